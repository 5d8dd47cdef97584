use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

const MINUTE: i64 = 60;
const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;
const WEEK: i64 = 604_800;

// 1970-01-01 was a Thursday; weekly buckets start on Monday 00:00 UTC
const WEEK_ALIGN_OFFSET: i64 = 4 * DAY;

/// Kline resolutions a venue serves directly, finest first
const VENUE_RESOLUTIONS: [i64; 4] = [MINUTE, 5 * MINUTE, HOUR, DAY];

/// A fixed-width, UTC-aligned bar resolution such as `5m` or `4h`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timeframe {
    secs: i64,
}

impl Timeframe {
    pub const M1: Timeframe = Timeframe { secs: MINUTE };
    pub const M5: Timeframe = Timeframe { secs: 5 * MINUTE };
    pub const H1: Timeframe = Timeframe { secs: HOUR };
    pub const D1: Timeframe = Timeframe { secs: DAY };

    pub fn from_secs(secs: i64) -> Result<Self, CoreError> {
        if secs <= 0 || secs % MINUTE != 0 {
            return Err(CoreError::InvalidTimeframe(format!("{}s", secs)));
        }
        Ok(Self { secs })
    }

    /// Bucket width in seconds
    pub fn width_secs(&self) -> i64 {
        self.secs
    }

    pub fn width(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.secs)
    }

    fn align_offset(&self) -> i64 {
        if self.secs % WEEK == 0 {
            WEEK_ALIGN_OFFSET
        } else {
            0
        }
    }

    /// Start of the bucket containing `ts`
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.align_offset();
        let secs = ts.timestamp() - offset;
        let start = secs.div_euclid(self.secs) * self.secs + offset;
        DateTime::from_timestamp(start, 0).unwrap_or(ts)
    }

    /// Exclusive end of the bucket containing `ts`
    pub fn bucket_end(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.bucket_start(ts) + self.width()
    }

    /// The venue kline resolution this timeframe is derived from
    ///
    /// With `minute_granularity` everything is built from one-minute bars,
    /// otherwise from the coarsest venue resolution that divides the width.
    pub fn source(&self, minute_granularity: bool) -> Timeframe {
        if minute_granularity {
            return Timeframe::M1;
        }
        let secs = VENUE_RESOLUTIONS
            .iter()
            .rev()
            .copied()
            .find(|r| *r <= self.secs && self.secs % r == 0 && self.align_offset() % r == 0)
            .unwrap_or(MINUTE);
        Timeframe { secs }
    }
}

impl FromStr for Timeframe {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() < 2 {
            return Err(CoreError::InvalidTimeframe(s.to_string()));
        }
        let (count, unit) = s.split_at(s.len() - 1);
        let count: i64 = count
            .parse()
            .map_err(|_| CoreError::InvalidTimeframe(s.to_string()))?;
        let unit_secs = match unit {
            "m" => MINUTE,
            "h" => HOUR,
            "d" => DAY,
            "w" => WEEK,
            _ => return Err(CoreError::InvalidTimeframe(s.to_string())),
        };
        Timeframe::from_secs(count * unit_secs)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.secs;
        if s % WEEK == 0 {
            write!(f, "{}w", s / WEEK)
        } else if s % DAY == 0 {
            write!(f, "{}d", s / DAY)
        } else if s % HOUR == 0 {
            write!(f, "{}h", s / HOUR)
        } else {
            write!(f, "{}m", s / MINUTE)
        }
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        for s in ["1m", "5m", "15m", "1h", "4h", "1d", "1w"] {
            let tf: Timeframe = s.parse().unwrap();
            assert_eq!(tf.to_string(), s);
        }
        assert_eq!("60m".parse::<Timeframe>().unwrap(), Timeframe::H1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Timeframe>().is_err());
        assert!("m".parse::<Timeframe>().is_err());
        assert!("5x".parse::<Timeframe>().is_err());
        assert!("0m".parse::<Timeframe>().is_err());
        assert!("-5m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_bucket_alignment() {
        let tf = Timeframe::M5;
        // 00:07:30 -> 00:05:00
        assert_eq!(tf.bucket_start(at(450)), at(300));
        assert_eq!(tf.bucket_end(at(450)), at(600));
        // boundary belongs to the new bucket
        assert_eq!(tf.bucket_start(at(600)), at(600));
    }

    #[test]
    fn test_weekly_buckets_start_monday() {
        let tf: Timeframe = "1w".parse().unwrap();
        // 2024-01-10 (Wednesday) -> 2024-01-08 (Monday)
        let wed = DateTime::parse_from_rfc3339("2024-01-10T13:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let start = tf.bucket_start(wed);
        assert_eq!(start.to_rfc3339(), "2024-01-08T00:00:00+00:00");
    }

    #[test]
    fn test_source_resolution() {
        let tf: Timeframe = "15m".parse().unwrap();
        assert_eq!(tf.source(false), Timeframe::M5);
        assert_eq!(tf.source(true), Timeframe::M1);

        let tf: Timeframe = "4h".parse().unwrap();
        assert_eq!(tf.source(false), Timeframe::H1);

        let tf: Timeframe = "3m".parse().unwrap();
        assert_eq!(tf.source(false), Timeframe::M1);

        let tf: Timeframe = "1w".parse().unwrap();
        assert_eq!(tf.source(false), Timeframe::D1);
    }

    #[test]
    fn test_serde_as_string() {
        let tf: Timeframe = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(tf, Timeframe::H1);
        assert_eq!(serde_json::to_string(&Timeframe::M5).unwrap(), "\"5m\"");
    }
}
