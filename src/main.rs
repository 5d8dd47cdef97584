use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;
use tradecore::candles::CandleAggregator;
use tradecore::clock::SystemClock;
use tradecore::execution::{
    ExitPolicy, LimitChaser, MarketFeed, OrderTracker, PositionTracker, SltpPolicy, Trader,
};
use tradecore::gateway::{ExchangeGateway, PaperGateway, RetryingGateway, Topic};
use tradecore::notify::{LogNotifier, Notifier, WebhookNotifier};
use tradecore::strategy::SmaCrossStrategy;
use tradecore::{AppConfig, Bar, Engine, RunOutcome, Timeframe};

// Half-width of each random-walk step, as a fraction of price
const PAPER_STEP: f64 = 0.002;
// Quoted spread, as a fraction of price
const PAPER_SPREAD: f64 = 0.0002;

#[derive(Parser, Debug)]
#[command(name = "tradecore", about = "Strategy execution core", version)]
struct Args {
    /// TOML configuration file (TRADECORE__* environment variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trade against an in-process venue fed by a synthetic random walk
    #[arg(long)]
    paper: bool,

    /// Wall-clock milliseconds per simulated one-minute bar
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    #[arg(long, default_value_t = 100.0)]
    start_price: f64,

    /// Order size used by the sample strategy
    #[arg(long, default_value_t = 0.01)]
    qty: f64,

    /// Enter with chased post-only limits instead of market orders
    #[arg(long)]
    chase: bool,

    /// Resting take-profit distance from entry, percent (0 = off)
    #[arg(long, default_value_t = 0.0)]
    take_profit_pct: f64,

    /// Resting stop-loss distance from entry, percent (0 = off)
    #[arg(long, default_value_t = 0.0)]
    stop_loss_pct: f64,

    /// Trailing-stop offset in price units (0 = off)
    #[arg(long, default_value_t = 0.0)]
    trail_offset: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config =
        AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    setup_logging(&config.logging.filter);

    tracing::info!("🚀 tradecore starting");

    if !args.paper {
        bail!("No live venue adapter is available; run with --paper");
    }

    // The synthetic feed only produces one-minute klines
    config.candles.minute_granularity = true;

    let paper = Arc::new(
        PaperGateway::new(config.exchange.product, config.exchange.symbol.clone())
            .with_book_matching(),
    );
    let gateway: Arc<dyn ExchangeGateway> = Arc::new(RetryingGateway::new(
        paper.clone(),
        config.retry_policy(),
    ));
    let notifier = create_notifier(&config)?;

    let precision = config.precision();
    let tracker = Arc::new(OrderTracker::new(
        Arc::clone(&gateway),
        Arc::clone(&notifier),
        config.tracker_settings(),
    ));
    let feed = Arc::new(MarketFeed::new());
    let chaser = Arc::new(LimitChaser::new(Arc::clone(&tracker), Arc::clone(&feed)));
    let positions = Arc::new(PositionTracker::new(
        config.exchange.commission,
        config.qty_in_quote(),
        precision,
    ));
    positions
        .reconcile(gateway.as_ref())
        .await
        .context("Failed to reconcile position")?;

    let trader = Arc::new(Trader::new(tracker, chaser, positions));
    if args.take_profit_pct > 0.0 || args.stop_loss_pct > 0.0 {
        trader.sltp(SltpPolicy::new(
            args.take_profit_pct,
            args.take_profit_pct,
            args.stop_loss_pct,
            args.stop_loss_pct,
        ));
    }
    if args.trail_offset > 0.0 {
        trader.exit(ExitPolicy::new(0.0, 0.0, args.trail_offset));
    }

    let candles = CandleAggregator::new(
        &config.candles.timeframes,
        config.aggregator_settings(),
        Arc::new(SystemClock),
    );
    let mut topics = vec![
        Topic::Instrument,
        Topic::BookTicker,
        Topic::Wallet,
        Topic::Position,
        Topic::Execution,
        Topic::Order,
    ];
    topics.extend(candles.sources().into_iter().map(Topic::Kline));

    let mut strategy = SmaCrossStrategy::new(9, 21, args.qty);
    if args.chase {
        strategy = strategy.with_chase(config.chase_settings());
    }

    let events = gateway
        .subscribe(&topics)
        .await
        .context("Failed to subscribe to venue streams")?;

    tracing::info!("📊 Configuration:");
    tracing::info!(
        "  Product: {} {} (demo: {})",
        config.exchange.product,
        config.exchange.symbol,
        config.exchange.demo
    );
    tracing::info!("  Timeframes: {:?}", config.candles.timeframes);
    tracing::info!("  Lookback: {}", config.candles.lookback);
    tracing::info!("  Order size: {}", args.qty);
    tracing::info!("  Chased entries: {}", args.chase);

    let mut engine = Engine::new(
        trader,
        feed,
        candles,
        Box::new(strategy),
        Arc::clone(&notifier),
    );
    let shutdown = engine.shutdown_handle();

    let feed_task = tokio::spawn(run_paper_feed(
        paper,
        args.start_price,
        Duration::from_millis(args.tick_ms.max(1)),
    ));
    let mut engine_task = tokio::spawn(async move { engine.run(events).await });

    tracing::info!("Press Ctrl+C to stop...");

    // Wait for Ctrl+C or the engine stopping on its own
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        result = &mut engine_task => Some(result),
    };
    let outcome = match finished {
        Some(result) => result.context("Engine task panicked")?,
        None => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
            shutdown.shutdown();
            engine_task.await.context("Engine task panicked")?
        }
    };
    feed_task.abort();

    match outcome {
        RunOutcome::Fatal(reason) => bail!("Engine halted: {}", reason),
        outcome => {
            tracing::info!("Engine stopped: {:?}", outcome);
            Ok(())
        }
    }
}

fn setup_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn create_notifier(config: &AppConfig) -> Result<Arc<dyn Notifier>> {
    match &config.notify.webhook_url {
        Some(url) => {
            let notifier = WebhookNotifier::new(url).context("Failed to create webhook client")?;
            tracing::info!("Notifications go to webhook");
            Ok(Arc::new(notifier))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

/// Drive the paper venue with a random walk: one book update and one closed
/// one-minute kline per tick, with simulated time starting at the current minute.
async fn run_paper_feed(paper: Arc<PaperGateway>, start_price: f64, tick: Duration) {
    let mut rng = StdRng::from_entropy();
    let mut price = start_price;
    let mut open_time = Timeframe::M1.bucket_start(Utc::now());
    let mut ticker = tokio::time::interval(tick);

    loop {
        ticker.tick().await;
        let bar = random_bar(&mut rng, open_time, price);
        price = bar.close;

        let half_spread = price * PAPER_SPREAD / 2.0;
        paper.push_book(price - half_spread, price + half_spread);
        paper.push_kline(Timeframe::M1, bar);

        open_time += Timeframe::M1.width();
    }
}

fn random_bar(rng: &mut impl Rng, open_time: DateTime<Utc>, open: f64) -> Bar {
    let close = open * (1.0 + rng.gen_range(-PAPER_STEP..PAPER_STEP));
    let wick = open * rng.gen_range(0.0..PAPER_STEP / 2.0);
    Bar {
        open_time,
        open,
        high: open.max(close) + wick,
        low: open.min(close) - wick,
        close,
        volume: rng.gen_range(1.0..100.0),
    }
}
