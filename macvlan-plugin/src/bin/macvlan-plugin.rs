use anyhow::Result;
use clap::Parser;
use macvlan_plugin::commands::{run, Cli};
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up tracing, RUST_LOG wins over --debug
    let level = if cli.debug { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run(cli).await {
        error!("macvlan plugin error: {:#}", err);
        std::process::exit(1);
    }

    Ok(())
}
