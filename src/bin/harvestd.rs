use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use harvestd::{
    client::HttpCollectorClient,
    config::{Config, read_config_file},
    version,
    worker::run_worker,
};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version)]
struct Args {
    /// Config file
    #[arg(short = 'c', long = "config")]
    file: Option<String>,

    /// Port, absolute socket path or @name to listen on
    #[arg(short, long)]
    port: Option<String>,

    /// Stay in the foreground and stop on SIGINT
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    loglevel: LevelFilter,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("harvestd", level),
        ("tower_http", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.file {
        Some(path) => read_config_file(path).with_context(|| format!("reading {path}"))?,
        None => Config::default(),
    }
    .with_env();

    if let Some(port) = &args.port {
        config.bind_addr = port.clone();
    }
    config.foreground |= args.foreground;

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();
    init(args.loglevel);
    trace!("started with args: {args:?}");

    let config = load_config(&args)?;
    info!("harvestd {} ({})", version::NUMBER, version::commit());

    let client = HttpCollectorClient::new().context("building collector client")?;
    let exit = run_worker(&config, Arc::new(client)).await;

    std::process::exit(exit.code());
}
