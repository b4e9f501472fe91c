use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};

use optfeed_rs::config::FeedConfig;
use optfeed_rs::market_data::adapters::{Credential, Venue};
use optfeed_rs::market_data::events::{EventKind, FeedEvent};
use optfeed_rs::market_data::router::FeedRouter;
use optfeed_rs::telemetry::{init_metrics, init_tracing, LogFormat};

/// Stream normalized quotes from one broker and log them until Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "optfeed", version)]
struct Args {
    /// tradier | tastytrade | schwab | webull | tradestation
    #[arg(long, env = "OPTFEED_VENUE")]
    venue: Venue,

    /// Broker access token
    #[arg(long, env = "OPTFEED_TOKEN", hide_env_values = true)]
    token: String,

    /// Comma-separated equity symbols
    #[arg(long, value_delimiter = ',')]
    tickers: Vec<String>,

    /// Comma-separated option symbols (OCC form)
    #[arg(long, value_delimiter = ',')]
    options: Vec<String>,

    /// TOML/YAML/JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `log_format` from the config
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[arg(long, default_value_t = 9000)]
    metrics_port: u16,
}

fn log_event(event: &FeedEvent) {
    match event {
        FeedEvent::Connected { venue } => info!(venue = %venue, "connected"),
        FeedEvent::Disconnected { venue, reason } => warn!(venue = %venue, reason, "disconnected"),
        FeedEvent::Error { venue, error } => error!(venue = ?venue, error = %error, "feed error"),
        FeedEvent::TickerUpdated(t) => {
            info!(symbol = %t.symbol, bid = t.bid, ask = t.ask, last = t.last, volume = t.volume, "ticker")
        }
        FeedEvent::OptionUpdated { option, .. } => info!(
            symbol = %option.symbol,
            bid = option.bid,
            ask = option.ask,
            mark = option.mark,
            volume = option.volume,
            live_oi = option.live_open_interest,
            "option"
        ),
        FeedEvent::TradeClassified(t) => info!(
            symbol = %t.symbol,
            price = t.price,
            size = t.size,
            side = ?t.aggressor,
            oi_change = t.estimated_oi_change,
            "trade"
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = FeedConfig::load(args.config.as_deref())?;

    init_tracing("info,optfeed_rs=debug", args.log_format.unwrap_or(config.log_format));
    init_metrics(args.metrics_port)?;

    let mut router = FeedRouter::new(config);
    for kind in [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Error,
        EventKind::TickerUpdated,
        EventKind::OptionUpdated,
        EventKind::TradeClassified,
    ] {
        router.on(kind, log_event);
    }

    router.connect(args.venue, Credential::new(args.token)).await?;
    if !args.tickers.is_empty() {
        router.subscribe_to_tickers(&args.tickers).await?;
    }
    if !args.options.is_empty() {
        router.subscribe_to_options(&args.options).await?;
        match router.fetch_open_interest(None).await {
            Ok(n) => info!(accepted = n, "base open interest loaded"),
            Err(e) => warn!(error = %e, "open interest backfill failed"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    router.disconnect().await;
    Ok(())
}
