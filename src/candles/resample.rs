use crate::models::{Bar, Timeframe};

/// Aggregate time-ordered bars into `timeframe` buckets
///
/// Open comes from the first bar in a bucket, close from the last, high/low are
/// the extremes and volume is summed. Input must be sorted by `open_time`; the
/// output is sorted and has one bar per non-empty bucket, so no bucket is ever
/// built from bars later than the last input bar.
pub fn resample(bars: &[Bar], timeframe: Timeframe) -> Vec<Bar> {
    let mut out: Vec<Bar> = Vec::new();

    for bar in bars {
        let bucket = timeframe.bucket_start(bar.open_time);

        match out.last_mut() {
            Some(current) if current.open_time == bucket => {
                current.high = current.high.max(bar.high);
                current.low = current.low.min(bar.low);
                current.close = bar.close;
                current.volume += bar.volume;
            }
            _ => out.push(Bar {
                open_time: bucket,
                ..*bar
            }),
        }
    }

    out
}

/// Split a resampled series into (closed, partial) where the newest bucket is the partial one
pub fn split_partial(mut bars: Vec<Bar>) -> (Vec<Bar>, Option<Bar>) {
    let partial = bars.pop();
    (bars, partial)
}
