//! One boot cycle: open the stores, boot the core, drain the event queue until a restart.
//!
//! Everything built here (core, sessions, link tasks) is dropped when the cycle returns, which is
//! what a device reset does. Only the files under `data_dir` survive into the next cycle.

use std::time::Duration;

use anyhow::Context;
use ota_core::integrity::PayloadDigest;
use ota_core::{
    Action, Event, FileValidityStore, FsPayloadStore, OtaCore, PayloadStore, RestartReason, Role,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::link::{self, LinkTiming};

pub async fn run(cfg: &Config) -> anyhow::Result<RestartReason> {
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;
    let mut payload = FsPayloadStore::in_dir(&cfg.data_dir);
    let validity = FileValidityStore::in_dir(&cfg.data_dir)?;
    if cfg.role == Role::Sender {
        import_source(cfg, &mut payload)?;
    }

    let (mut core, mut pending) = OtaCore::boot(cfg.role, cfg.core.clone(), payload, validity);
    core.set_invoke_args(cfg.invoke_args());

    let timing = LinkTiming {
        connect_delay: cfg.connect_delay(),
        frame_interval: cfg.frame_interval(),
        ack_timeout: cfg.ack_timeout(),
        loss_percent: cfg.simulated_loss_percent,
    };
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut tasks = JoinSet::new();
    match cfg.role {
        Role::Sender => {
            let listener = TcpListener::bind(cfg.addr)
                .await
                .with_context(|| format!("binding {}", cfg.addr))?;
            tracing::info!(addr = %cfg.addr, "advertising, waiting for receiver");
            tasks.spawn(link::serve(listener, out_rx, event_tx.clone(), timing));
            if let Some(period) = cfg.republish_interval() {
                tasks.spawn(ticker(event_tx.clone(), period, Event::RepublishTick));
            }
            pending.extend(core.publish(cfg.version));
        }
        Role::Receiver => {
            tasks.spawn(link::connect(cfg.addr, event_tx.clone(), timing));
            tasks.spawn(ticker(event_tx.clone(), cfg.invoke_interval(), Event::InvokeTick));
        }
    }

    loop {
        for action in pending.drain(..) {
            match action {
                // The link may be gone; the core hears about it as `Disconnected`.
                Action::Send(frame) => {
                    let _ = out_tx.send(frame);
                }
                Action::Restart(reason) => return Ok(reason),
                Action::Invoked { args, result } => {
                    tracing::info!(a = args.0, b = args.1, result, "calcWasm")
                }
            }
        }
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("event queue closed");
                };
                pending = core.on_event(event);
            }
            Some(joined) = tasks.join_next() => {
                joined.context("link task panicked")??;
                anyhow::bail!("link task exited");
            }
        }
    }
}

/// Copy the configured source binary into the slot. Without a source, whatever the slot already
/// holds is published.
fn import_source(cfg: &Config, payload: &mut FsPayloadStore) -> anyhow::Result<()> {
    let Some(source) = &cfg.source else {
        tracing::info!(slot = %payload.path().display(), "no source configured, publishing slot as is");
        return Ok(());
    };
    let bytes =
        std::fs::read(source).with_context(|| format!("reading source {}", source.display()))?;
    payload.replace(&bytes)?;
    tracing::info!(
        source = %source.display(),
        size = bytes.len(),
        version = cfg.version,
        digest = %PayloadDigest::of(&bytes).short(),
        "binary imported"
    );
    Ok(())
}

/// Queue `event` every `period`, starting one period after boot.
async fn ticker(
    events: mpsc::UnboundedSender<Event>,
    period: Duration,
    event: Event,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        if events.send(event.clone()).is_err() {
            return Ok(());
        }
    }
}
