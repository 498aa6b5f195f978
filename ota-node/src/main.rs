// wasm-ota node: sender or receiver role over a TCP link, with the restart loop.

mod config;
mod cycle;
mod link;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pause between boot cycles, so a store that keeps failing cannot spin the loop.
const RESTART_DELAY: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("ota-node {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument {:?}", other),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(config_path.as_deref())?;
    tracing::info!(
        role = ?cfg.role,
        addr = %cfg.addr,
        data_dir = %cfg.data_dir.display(),
        mtu = cfg.core.transfer.mtu,
        "starting ota-node {}",
        VERSION
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

/// Each iteration is one power-on: nothing but the data directory carries over.
async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let mut shutdown = std::pin::pin!(shutdown_signal());
    let mut boots: u64 = 0;
    loop {
        boots += 1;
        tracing::debug!(boot = boots, "boot cycle");
        tokio::select! {
            reason = cycle::run(&cfg) => {
                let reason = reason?;
                tracing::info!(?reason, "restarting");
            }
            res = &mut shutdown => {
                res?;
                tracing::info!("shutting down");
                return Ok(());
            }
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
