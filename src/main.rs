use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dirgrab_core::cli::Args;
use dirgrab_core::{crawler, report};
use dirgrab_core::shutdown::ShutdownToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_filter());

    let token = ShutdownToken::new();
    spawn_interrupt_handler(token.clone());

    let config = args.into_config().context("invalid configuration")?;
    let stats = crawler::run(config, token).await?;

    report::print_summary(&stats);
    Ok(())
}

/// RUST_LOG wins over the verbosity flags when set.
fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn spawn_interrupt_handler(token: ShutdownToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight work");
            token.trigger();
        }
    });
}
