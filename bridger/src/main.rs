mod cli;
mod detach;

use bridger_core::Listener;
use clap::Parser;
use cli::Args;
use detach::{spawn_detached, DEFAULT_LISTEN_PORT, DEFAULT_UPSTREAM_PORT};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing();

    let Some((listen_port, upstream_port)) = args.ports() else {
        let child = spawn_detached(DEFAULT_LISTEN_PORT, DEFAULT_UPSTREAM_PORT)?;

        info!(
            pid = child.id(),
            "started bridger in the background on port {DEFAULT_LISTEN_PORT}"
        );

        return Ok(());
    };

    let listener = Listener::new(args.listener_config(listen_port, upstream_port));

    info!(
        "relaying port {listen_port} to {}",
        listener.config().upstream
    );

    listener.start();

    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    listener.stop().await;

    Ok(())
}
