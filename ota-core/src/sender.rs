//! Transfer sender: streams the payload slot as one Announce followed by Data frames.
//!
//! Pacing is driven by per-frame delivery reports from the transport: a frame is only produced
//! after the previous one was reported delivered (or failed, in which case the same frame is
//! produced again). States: `Idle -> Announced -> Streaming -> Idle`.

use crate::chunk::{self, ChunkPlanError};
use crate::config::TransferConfig;
use crate::protocol::Frame;
use crate::receiver::TransferSession;
use crate::storage::{PayloadStore, StorageError};
use crate::wire::{self, FrameEncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    /// Announce sent, waiting for its delivery report.
    Announced(TransferSession),
    /// `current_offset` is the sequence number of the last Data frame handed out.
    Streaming(TransferSession),
}

/// Transport-level delivery report for the most recent frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

/// Result of asking the sender for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStep {
    /// Encoded frame to hand to the transport.
    Frame(Vec<u8>),
    /// Every Data frame was delivered; the sender is idle again.
    Finished { version: u8, total_packets: u16 },
    /// Nothing to send until the next delivery report.
    Waiting,
}

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("cannot plan transfer: {0}")]
    Plan(#[from] ChunkPlanError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("payload slot changed during transfer: frame {sequence} expected {expected} bytes, read {read}")]
    SlotChanged {
        sequence: u16,
        expected: u64,
        read: usize,
    },
    #[error("frame {sequence} failed delivery {attempts} times in a row")]
    RetriesExhausted { sequence: u16, attempts: u32 },
}

#[derive(Debug)]
pub struct TransferSender {
    mtu: usize,
    chunk_size: usize,
    retry_limit: Option<u32>,
    state: SenderState,
    /// Size of the slot when the transfer started.
    total_len: u64,
    /// Set by a delivery report; the next frame may go out.
    pending: bool,
    consecutive_failures: u32,
}

impl TransferSender {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            mtu: config.mtu,
            chunk_size: config.chunk_size(),
            retry_limit: config.retry_limit,
            state: SenderState::Idle,
            total_len: 0,
            pending: false,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SenderState::Idle
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Plan a transfer of the whole slot and return the Announce frame to send.
    pub fn start_transfer<P: PayloadStore>(
        &mut self,
        payload: &P,
        version: u8,
    ) -> Result<Vec<u8>, SenderError> {
        self.reset();
        let size = payload.size()?;
        let total_packets = chunk::packet_count(size, self.chunk_size)?;
        let session = TransferSession {
            current_offset: 0,
            total_packets,
            version,
        };
        let frame = self.announce_frame(&session)?;
        self.total_len = size;
        self.state = SenderState::Announced(session);
        tracing::info!(
            version,
            size,
            total = total_packets,
            chunk_size = self.chunk_size,
            "starting transfer"
        );
        Ok(frame)
    }

    /// Record the transport's report for the most recent frame.
    pub fn on_delivery(&mut self, status: DeliveryStatus) -> Result<(), SenderError> {
        let session = match self.state {
            SenderState::Idle => return Ok(()),
            SenderState::Announced(s) | SenderState::Streaming(s) => s,
        };
        match status {
            DeliveryStatus::Delivered => {
                self.consecutive_failures = 0;
                self.state = SenderState::Streaming(session);
            }
            DeliveryStatus::Failed => {
                self.consecutive_failures += 1;
                let sequence = session.current_offset;
                if let Some(limit) = self.retry_limit {
                    if self.consecutive_failures > limit {
                        let attempts = self.consecutive_failures;
                        self.reset();
                        return Err(SenderError::RetriesExhausted { sequence, attempts });
                    }
                }
                tracing::debug!(
                    sequence,
                    attempts = self.consecutive_failures,
                    "delivery failed, resending"
                );
                if let SenderState::Streaming(mut s) = self.state {
                    // Step back so the same chunk is read and sent again.
                    s.current_offset = s.current_offset.saturating_sub(1);
                    self.state = SenderState::Streaming(s);
                }
            }
        }
        self.pending = true;
        Ok(())
    }

    /// Produce the next frame if a delivery report allows it.
    pub fn next_frame<P: PayloadStore>(&mut self, payload: &P) -> Result<SendStep, SenderError> {
        if !self.pending {
            return Ok(SendStep::Waiting);
        }
        self.pending = false;
        let result = self.produce(payload);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn produce<P: PayloadStore>(&mut self, payload: &P) -> Result<SendStep, SenderError> {
        let mut session = match self.state {
            SenderState::Idle => return Ok(SendStep::Waiting),
            // The Announce itself failed delivery.
            SenderState::Announced(s) => return Ok(SendStep::Frame(self.announce_frame(&s)?)),
            SenderState::Streaming(s) => s,
        };
        if session.current_offset == session.total_packets {
            tracing::info!(
                version = session.version,
                total = session.total_packets,
                "transfer finished"
            );
            self.reset();
            return Ok(SendStep::Finished {
                version: session.version,
                total_packets: session.total_packets,
            });
        }

        let sequence = session.current_offset + 1;
        let range = chunk::chunk_at(sequence, self.total_len, self.chunk_size);
        let bytes = payload.read_at(range.start, range.len() as usize)?;
        if bytes.len() as u64 != range.len() {
            return Err(SenderError::SlotChanged {
                sequence,
                expected: range.len(),
                read: bytes.len(),
            });
        }
        let frame = wire::encode_frame(
            &Frame::Data {
                sequence,
                payload: bytes,
            },
            self.mtu,
        )?;
        session.current_offset = sequence;
        self.state = SenderState::Streaming(session);
        tracing::debug!(
            sequence,
            remaining = session.remaining(),
            "data frame ready"
        );
        Ok(SendStep::Frame(frame))
    }

    /// Transport dropped; the next connection starts again from packet zero.
    pub fn on_disconnect(&mut self) {
        if !self.is_idle() {
            tracing::info!("transfer abandoned on disconnect");
        }
        self.reset();
    }

    fn announce_frame(&self, session: &TransferSession) -> Result<Vec<u8>, SenderError> {
        Ok(wire::encode_frame(
            &Frame::Announce {
                total_packets: session.total_packets,
                version: session.version,
            },
            self.mtu,
        )?)
    }

    fn reset(&mut self) {
        self.state = SenderState::Idle;
        self.total_len = 0;
        self.pending = false;
        self.consecutive_failures = 0;
    }
}
