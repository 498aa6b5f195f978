//! Host-driven API: OtaCore receives events from the host, returns actions.
//!
//! One core per boot cycle. `Action::Restart` ends the cycle: the host drops the core and every
//! transient object with it, then boots a fresh one over the same persistent stores.

use serde::Deserialize;

use crate::bootstrap::{BootStage, ExecutionContext};
use crate::config::Config;
use crate::receiver::{ReceiveError, ReceiveOutcome, TransferReceiver};
use crate::sender::{DeliveryStatus, SendStep, TransferSender};
use crate::storage::PayloadStore;
use crate::validity::ValidityStore;

/// Default `calcWasm` arguments for `Event::InvokeTick`.
pub const DEFAULT_INVOKE_ARGS: (u8, u8) = (1, 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds a binary and streams it to a connected peer.
    Sender,
    /// Stages a received binary, commits it and executes it.
    Receiver,
}

/// Input from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected,
    Disconnected,
    FrameReceived(Vec<u8>),
    /// Transport report for the most recent `Action::Send`.
    Delivery(DeliveryStatus),
    InvokeTick,
    /// Offer the published binary again if the link is idle.
    RepublishTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// A new binary was committed and must be loaded from scratch.
    Committed { version: u8 },
    BootFailed(BootStage),
    InvokeFailed,
}

/// Output for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Vec<u8>),
    Restart(RestartReason),
    Invoked { args: (u8, u8), result: i32 },
}

/// Main coordinator. Owns both persistent stores for the length of one boot cycle.
pub struct OtaCore<P, V> {
    role: Role,
    config: Config,
    payload: P,
    validity: V,
    receiver: TransferReceiver,
    sender: TransferSender,
    execution: Option<ExecutionContext>,
    connected: bool,
    /// Version offered to every peer that connects, until a newer one is published.
    published: Option<u8>,
    invoke_args: (u8, u8),
    restart_pending: bool,
}

impl<P: PayloadStore, V: ValidityStore> OtaCore<P, V> {
    /// Start a boot cycle. A receiver holding a valid record runs the execution bootstrap; a
    /// failing bootstrap yields the restart action.
    pub fn boot(role: Role, config: Config, payload: P, validity: V) -> (Self, Vec<Action>) {
        let sender = TransferSender::new(&config.transfer);
        let mut core = Self {
            role,
            config,
            payload,
            validity,
            receiver: TransferReceiver::new(),
            sender,
            execution: None,
            connected: false,
            published: None,
            invoke_args: DEFAULT_INVOKE_ARGS,
            restart_pending: false,
        };
        let actions = match role {
            Role::Receiver => core.bootstrap(),
            Role::Sender => Vec::new(),
        };
        (core, actions)
    }

    fn bootstrap(&mut self) -> Vec<Action> {
        let stored = match self.validity.read_validity() {
            Ok(v) => v,
            Err(e) => {
                // Nothing to trust; wait for a transfer to rewrite the region.
                tracing::error!(error = %e, "cannot read validity region, skipping execution");
                return Vec::new();
            }
        };
        if !stored.is_executable() {
            tracing::info!(
                version = stored.version,
                "no valid binary stored, waiting for transfer"
            );
            return Vec::new();
        }
        match ExecutionContext::load(&self.payload, stored.version, &self.config.execution) {
            Ok(ctx) => {
                tracing::info!(version = stored.version, digest = %ctx.digest().short(), "boot ok");
                self.execution = Some(ctx);
                Vec::new()
            }
            Err(e) => {
                tracing::error!(version = stored.version, error = %e, "boot failed");
                self.invalidate(RestartReason::BootFailed(e.stage))
            }
        }
    }

    pub fn set_invoke_args(&mut self, args: (u8, u8)) {
        self.invoke_args = args;
    }

    pub fn is_restart_pending(&self) -> bool {
        self.restart_pending
    }

    pub fn execution(&self) -> Option<&ExecutionContext> {
        self.execution.as_ref()
    }

    pub fn receiver(&self) -> &TransferReceiver {
        &self.receiver
    }

    pub fn sender(&self) -> &TransferSender {
        &self.sender
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn validity(&self) -> &V {
        &self.validity
    }

    /// Hand the persistent stores back, ending this boot cycle.
    pub fn into_stores(self) -> (P, V) {
        (self.payload, self.validity)
    }

    /// Mark the slot's binary as ready for delivery ("upload completed"). Starts a transfer at once
    /// if a peer is connected and the sender is idle; later connections get it again.
    pub fn publish(&mut self, version: u8) -> Vec<Action> {
        if self.role != Role::Sender {
            tracing::warn!(version, "publish ignored: not a sender");
            return Vec::new();
        }
        if self.restart_pending {
            return Vec::new();
        }
        tracing::info!(version, "binary published");
        self.published = Some(version);
        self.try_start_transfer()
    }

    pub fn on_event(&mut self, event: Event) -> Vec<Action> {
        if self.restart_pending {
            tracing::debug!(?event, "restart pending, event dropped");
            return Vec::new();
        }
        match event {
            Event::Connected => {
                tracing::info!(role = ?self.role, "peer connected");
                self.connected = true;
                self.try_start_transfer()
            }
            Event::Disconnected => {
                tracing::info!(role = ?self.role, "peer disconnected");
                self.connected = false;
                self.receiver.on_disconnect();
                self.sender.on_disconnect();
                Vec::new()
            }
            Event::FrameReceived(bytes) => self.on_frame(&bytes),
            Event::Delivery(status) => self.on_delivery(status),
            Event::InvokeTick => self.on_invoke_tick(),
            Event::RepublishTick => {
                if self.role != Role::Sender {
                    return Vec::new();
                }
                self.try_start_transfer()
            }
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) -> Vec<Action> {
        if self.role != Role::Receiver {
            tracing::warn!(len = bytes.len(), "frame ignored: not a receiver");
            return Vec::new();
        }
        match self
            .receiver
            .on_frame_bytes(bytes, &mut self.payload, &mut self.validity)
        {
            Ok(ReceiveOutcome::Committed { version, .. }) => {
                self.restart_pending = true;
                self.execution = None;
                vec![Action::Restart(RestartReason::Committed { version })]
            }
            Ok(_) => Vec::new(),
            // The tail of a re-offered version this node already runs.
            Err(e @ ReceiveError::UnexpectedData { .. }) => {
                tracing::debug!(error = %e, "frame ignored");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame rejected, session reset");
                Vec::new()
            }
        }
    }

    fn on_delivery(&mut self, status: DeliveryStatus) -> Vec<Action> {
        if self.role != Role::Sender {
            return Vec::new();
        }
        if let Err(e) = self.sender.on_delivery(status) {
            tracing::warn!(error = %e, "transfer abandoned");
            return Vec::new();
        }
        match self.sender.next_frame(&self.payload) {
            Ok(SendStep::Frame(frame)) => vec![Action::Send(frame)],
            Ok(SendStep::Finished { version, .. }) => {
                // A newer version published mid-transfer goes out at once; the same one waits
                // for the next connection or republish tick.
                if self.published == Some(version) {
                    Vec::new()
                } else {
                    self.try_start_transfer()
                }
            }
            Ok(SendStep::Waiting) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "transfer abandoned");
                Vec::new()
            }
        }
    }

    fn on_invoke_tick(&mut self) -> Vec<Action> {
        let Some(ctx) = self.execution.as_mut() else {
            return Vec::new();
        };
        let (a, b) = self.invoke_args;
        match ctx.invoke(a, b) {
            Ok(result) => {
                tracing::debug!(a, b, result, "calcWasm");
                vec![Action::Invoked {
                    args: (a, b),
                    result,
                }]
            }
            Err(e) => {
                tracing::error!(version = ctx.version(), error = %e, "calcWasm failed");
                self.invalidate(RestartReason::InvokeFailed)
            }
        }
    }

    fn try_start_transfer(&mut self) -> Vec<Action> {
        let Some(version) = self.published else {
            return Vec::new();
        };
        if !self.connected || !self.sender.is_idle() {
            return Vec::new();
        }
        match self.sender.start_transfer(&self.payload, version) {
            Ok(frame) => vec![Action::Send(frame)],
            Err(e) => {
                tracing::warn!(version, error = %e, "cannot start transfer");
                Vec::new()
            }
        }
    }

    /// Fail-safe: mark the stored binary invalid once and request a restart.
    fn invalidate(&mut self, reason: RestartReason) -> Vec<Action> {
        if self.restart_pending {
            return Vec::new();
        }
        self.restart_pending = true;
        self.execution = None;
        if let Err(e) = self.validity.write_invalid() {
            tracing::error!(error = %e, "cannot mark binary invalid");
        }
        vec![Action::Restart(reason)]
    }
}
