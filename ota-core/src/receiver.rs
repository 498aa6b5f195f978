//! Transfer receiver: reassembles Announce + Data frames into the payload slot and commits validity.
//!
//! States: `Idle -> Receiving -> (Completing) -> Idle`. Completing is not observable; it is the
//! commit step at the end of the last accepted Data frame, after which the caller must restart the
//! device so the bootstrap loads the new binary. Any error resets the session to `Idle` without
//! touching the validity record.

use crate::protocol::Frame;
use crate::storage::{PayloadStore, StorageError};
use crate::validity::{ValidityError, ValidityStore};
use crate::wire::{self, FrameDecodeError};

/// Progress of one in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferSession {
    /// Sequence number of the last accepted Data frame (0 before the first).
    pub current_offset: u16,
    pub total_packets: u16,
    /// Version carried by the Announce frame.
    pub version: u8,
}

impl TransferSession {
    pub fn remaining(&self) -> u16 {
        self.total_packets.saturating_sub(self.current_offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Receiving(TransferSession),
}

/// What a successfully handled frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Announce for the version already installed and valid; nothing was touched.
    UpToDate { version: u8 },
    /// Announce accepted; the slot was truncated.
    Started { total_packets: u16, version: u8 },
    /// Data frame appended.
    Progress { offset: u16, total_packets: u16 },
    /// Last Data frame appended and validity committed. The device must restart.
    Committed { version: u8, total_packets: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("undecodable frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("announce declares zero data frames")]
    EmptyAnnounce,
    #[error("data frame {sequence} received with no transfer in progress")]
    UnexpectedData { sequence: u16 },
    #[error("data frame {got} out of order, expected {expected}")]
    OutOfOrder { expected: u16, got: u16 },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("validity region: {0}")]
    Validity(#[from] ValidityError),
}

#[derive(Debug)]
pub struct TransferReceiver {
    state: ReceiverState,
}

impl TransferReceiver {
    pub fn new() -> Self {
        Self {
            state: ReceiverState::Idle,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn session(&self) -> Option<TransferSession> {
        match self.state {
            ReceiverState::Receiving(s) => Some(s),
            ReceiverState::Idle => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ReceiverState::Idle
    }

    /// Transport dropped; the sender restarts from packet zero on reconnect.
    pub fn on_disconnect(&mut self) {
        if let ReceiverState::Receiving(s) = self.state {
            tracing::info!(
                offset = s.current_offset,
                total = s.total_packets,
                "transfer abandoned on disconnect"
            );
        }
        self.state = ReceiverState::Idle;
    }

    /// Decode and handle one raw frame.
    pub fn on_frame_bytes<P, V>(
        &mut self,
        bytes: &[u8],
        payload: &mut P,
        validity: &mut V,
    ) -> Result<ReceiveOutcome, ReceiveError>
    where
        P: PayloadStore,
        V: ValidityStore,
    {
        match wire::decode_frame(bytes) {
            Ok(frame) => self.on_frame(frame, payload, validity),
            Err(e) => {
                self.state = ReceiverState::Idle;
                Err(e.into())
            }
        }
    }

    /// Handle one decoded frame. On error the session is back to `Idle`.
    pub fn on_frame<P, V>(
        &mut self,
        frame: Frame,
        payload: &mut P,
        validity: &mut V,
    ) -> Result<ReceiveOutcome, ReceiveError>
    where
        P: PayloadStore,
        V: ValidityStore,
    {
        let result = match frame {
            Frame::Announce {
                total_packets,
                version,
            } => self.on_announce(total_packets, version, payload, validity),
            Frame::Data { sequence, payload: chunk } => {
                self.on_data(sequence, &chunk, payload, validity)
            }
        };
        if result.is_err() {
            self.state = ReceiverState::Idle;
        }
        result
    }

    fn on_announce<P, V>(
        &mut self,
        total_packets: u16,
        version: u8,
        payload: &mut P,
        validity: &mut V,
    ) -> Result<ReceiveOutcome, ReceiveError>
    where
        P: PayloadStore,
        V: ValidityStore,
    {
        let stored = validity.read_validity()?;
        if version == stored.version && stored.is_executable() {
            tracing::debug!(version, "announced version already installed");
            self.state = ReceiverState::Idle;
            return Ok(ReceiveOutcome::UpToDate { version });
        }
        if total_packets == 0 {
            return Err(ReceiveError::EmptyAnnounce);
        }
        payload.truncate()?;
        self.state = ReceiverState::Receiving(TransferSession {
            current_offset: 0,
            total_packets,
            version,
        });
        tracing::info!(
            version,
            total = total_packets,
            stored_version = stored.version,
            stored_invalid = stored.invalid,
            "receiving new payload"
        );
        Ok(ReceiveOutcome::Started {
            total_packets,
            version,
        })
    }

    fn on_data<P, V>(
        &mut self,
        sequence: u16,
        chunk: &[u8],
        payload: &mut P,
        validity: &mut V,
    ) -> Result<ReceiveOutcome, ReceiveError>
    where
        P: PayloadStore,
        V: ValidityStore,
    {
        let ReceiverState::Receiving(mut session) = self.state else {
            return Err(ReceiveError::UnexpectedData { sequence });
        };
        let expected = session.current_offset.wrapping_add(1);
        if sequence != expected || session.current_offset == session.total_packets {
            return Err(ReceiveError::OutOfOrder {
                expected,
                got: sequence,
            });
        }
        payload.append(chunk)?;
        session.current_offset = sequence;
        tracing::debug!(
            offset = session.current_offset,
            total = session.total_packets,
            len = chunk.len(),
            "data frame appended"
        );
        if session.current_offset < session.total_packets {
            self.state = ReceiverState::Receiving(session);
            return Ok(ReceiveOutcome::Progress {
                offset: session.current_offset,
                total_packets: session.total_packets,
            });
        }

        // Completing: the slot is already closed (append does not hold it open).
        validity.write_valid(session.version)?;
        self.state = ReceiverState::Idle;
        tracing::info!(
            version = session.version,
            total = session.total_packets,
            "payload committed"
        );
        Ok(ReceiveOutcome::Committed {
            version: session.version,
            total_packets: session.total_packets,
        })
    }
}

impl Default for TransferReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPayloadStore;
    use crate::validity::{MemoryValidityStore, Validity};

    fn announce(total_packets: u16, version: u8) -> Frame {
        Frame::Announce {
            total_packets,
            version,
        }
    }

    fn data(sequence: u16, payload: &[u8]) -> Frame {
        Frame::Data {
            sequence,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn in_order_transfer_commits_once() {
        let binary: Vec<u8> = (0..100u8).collect();
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::new();
        let mut flags = MemoryValidityStore::new();

        let r = rx.on_frame(announce(3, 9), &mut slot, &mut flags).unwrap();
        assert_eq!(
            r,
            ReceiveOutcome::Started {
                total_packets: 3,
                version: 9
            }
        );
        let chunks: Vec<&[u8]> = binary.chunks(40).collect();
        let r = rx.on_frame(data(1, chunks[0]), &mut slot, &mut flags).unwrap();
        assert_eq!(
            r,
            ReceiveOutcome::Progress {
                offset: 1,
                total_packets: 3
            }
        );
        rx.on_frame(data(2, chunks[1]), &mut slot, &mut flags)
            .unwrap();
        assert_eq!(flags.valid_writes(), 0);
        let r = rx.on_frame(data(3, chunks[2]), &mut slot, &mut flags).unwrap();
        assert_eq!(
            r,
            ReceiveOutcome::Committed {
                version: 9,
                total_packets: 3
            }
        );
        assert_eq!(flags.valid_writes(), 1);
        assert_eq!(flags.read_validity().unwrap(), Validity::valid(9));
        assert_eq!(slot.bytes(), Some(&binary[..]));
        assert!(rx.is_idle());
    }

    #[test]
    fn up_to_date_announce_is_noop() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::with_bytes(b"installed".to_vec());
        let mut flags = MemoryValidityStore::valid(5);

        let r = rx.on_frame(announce(3, 5), &mut slot, &mut flags).unwrap();
        assert_eq!(r, ReceiveOutcome::UpToDate { version: 5 });
        assert!(rx.is_idle());
        assert_eq!(slot.truncations(), 0);
        assert_eq!(slot.bytes(), Some(&b"installed"[..]));
    }

    #[test]
    fn same_version_but_invalid_is_received() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::with_bytes(b"broken".to_vec());
        let mut flags = MemoryValidityStore::valid(5);
        flags.write_invalid().unwrap();

        let r = rx.on_frame(announce(1, 5), &mut slot, &mut flags).unwrap();
        assert!(matches!(r, ReceiveOutcome::Started { .. }));
        assert_eq!(slot.truncations(), 1);
        assert_eq!(slot.bytes(), Some(&[][..]));
    }

    #[test]
    fn out_of_order_resets_without_advancing() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::new();
        let mut flags = MemoryValidityStore::new();
        rx.on_frame(announce(4, 2), &mut slot, &mut flags).unwrap();
        rx.on_frame(data(1, b"aa"), &mut slot, &mut flags).unwrap();

        let err = rx
            .on_frame(data(3, b"cc"), &mut slot, &mut flags)
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::OutOfOrder {
                expected: 2,
                got: 3
            }
        ));
        assert!(rx.is_idle());
        assert_eq!(slot.bytes(), Some(&b"aa"[..]));
        assert_eq!(flags.valid_writes(), 0);
    }

    #[test]
    fn duplicate_frame_is_protocol_error() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::new();
        let mut flags = MemoryValidityStore::new();
        rx.on_frame(announce(3, 2), &mut slot, &mut flags).unwrap();
        rx.on_frame(data(1, b"aa"), &mut slot, &mut flags).unwrap();
        let err = rx
            .on_frame(data(1, b"aa"), &mut slot, &mut flags)
            .unwrap_err();
        assert!(matches!(err, ReceiveError::OutOfOrder { .. }));
        assert!(rx.is_idle());
    }

    #[test]
    fn data_while_idle_is_protocol_error() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::new();
        let mut flags = MemoryValidityStore::new();
        let err = rx
            .on_frame(data(1, b"aa"), &mut slot, &mut flags)
            .unwrap_err();
        assert!(matches!(err, ReceiveError::UnexpectedData { sequence: 1 }));
        assert!(slot.bytes().is_none());
    }

    #[test]
    fn empty_announce_rejected() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::with_bytes(b"old".to_vec());
        let mut flags = MemoryValidityStore::new();
        let err = rx
            .on_frame(announce(0, 1), &mut slot, &mut flags)
            .unwrap_err();
        assert!(matches!(err, ReceiveError::EmptyAnnounce));
        assert_eq!(slot.truncations(), 0);
    }

    #[test]
    fn new_announce_restarts_session() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::new();
        let mut flags = MemoryValidityStore::new();
        rx.on_frame(announce(3, 2), &mut slot, &mut flags).unwrap();
        rx.on_frame(data(1, b"aa"), &mut slot, &mut flags).unwrap();
        rx.on_frame(announce(2, 2), &mut slot, &mut flags).unwrap();
        assert_eq!(
            rx.session(),
            Some(TransferSession {
                current_offset: 0,
                total_packets: 2,
                version: 2
            })
        );
        assert_eq!(slot.bytes(), Some(&[][..]));
    }

    #[test]
    fn decode_error_resets_session() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::new();
        let mut flags = MemoryValidityStore::new();
        rx.on_frame(announce(3, 2), &mut slot, &mut flags).unwrap();
        let err = rx
            .on_frame_bytes(&[0x7f, 0, 1], &mut slot, &mut flags)
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Decode(FrameDecodeError::UnknownKind(0x7f))
        ));
        assert!(rx.is_idle());
    }

    #[test]
    fn storage_failure_abandons_without_commit() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::new();
        let mut flags = MemoryValidityStore::valid(1);
        rx.on_frame(announce(1, 2), &mut slot, &mut flags).unwrap();
        slot.set_fail_writes(true);
        let err = rx
            .on_frame(data(1, b"aa"), &mut slot, &mut flags)
            .unwrap_err();
        assert!(matches!(err, ReceiveError::Storage(_)));
        assert!(rx.is_idle());
        assert_eq!(flags.read_validity().unwrap(), Validity::valid(1));
    }

    #[test]
    fn validity_failure_on_commit_is_reported() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::new();
        let mut flags = MemoryValidityStore::new();
        rx.on_frame(announce(1, 2), &mut slot, &mut flags).unwrap();
        flags.set_fail_writes(true);
        let err = rx
            .on_frame(data(1, b"aa"), &mut slot, &mut flags)
            .unwrap_err();
        assert!(matches!(err, ReceiveError::Validity(_)));
        assert!(rx.is_idle());
        assert!(flags.read_validity().unwrap().invalid);
    }

    #[test]
    fn disconnect_resets() {
        let mut rx = TransferReceiver::new();
        let mut slot = MemoryPayloadStore::new();
        let mut flags = MemoryValidityStore::new();
        rx.on_frame(announce(3, 2), &mut slot, &mut flags).unwrap();
        rx.on_disconnect();
        assert!(rx.is_idle());
        // The sender starts over with an Announce; a stray Data frame is an error.
        assert!(rx.on_frame(data(2, b"bb"), &mut slot, &mut flags).is_err());
    }
}
