//! Over-the-air WebAssembly delivery.
//! Host-driven: no sockets or timers here; the host passes events and receives actions.
//!
//! A sender streams a `.wasm` binary as one Announce frame plus sequenced Data frames. The
//! receiver stages it in a payload slot, commits a two-byte validity record, and after a restart
//! boots it in an embedded interpreter and calls its `calcWasm` export.

pub mod bootstrap;
pub mod chunk;
pub mod config;
pub mod core;
pub mod integrity;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod storage;
pub mod validity;
pub mod wire;

pub use bootstrap::{BootStage, BootstrapError, ExecutionContext};
pub use config::{Config, ConfigError, ExecutionConfig, TransferConfig};
pub use core::{Action, Event, OtaCore, RestartReason, Role};
pub use protocol::{Frame, ENTRY_FUNCTION};
pub use receiver::{ReceiveError, ReceiveOutcome, TransferReceiver, TransferSession};
pub use sender::{DeliveryStatus, SendStep, SenderError, TransferSender};
pub use storage::{FsPayloadStore, MemoryPayloadStore, PayloadStore, StorageError};
pub use validity::{FileValidityStore, MemoryValidityStore, Validity, ValidityError, ValidityStore};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
