//! wasm-ota wire protocol: frame kinds and fixed constants.

/// Discriminant of the Announce frame (first byte).
pub const FRAME_ANNOUNCE: u8 = 0x01;

/// Discriminant of the Data frame (first byte).
pub const FRAME_DATA: u8 = 0x02;

/// Announce: kind + total (u16 BE) + version.
pub const ANNOUNCE_LEN: usize = 4;

/// Data header: kind + sequence number (u16 BE). Payload follows.
pub const DATA_HEADER_LEN: usize = 3;

/// Name of the single exported entry function every payload must provide.
pub const ENTRY_FUNCTION: &str = "calcWasm";

/// File name of the payload slot.
pub const PAYLOAD_SLOT: &str = "main.wasm";

/// All wire frames. Encoding is a fixed byte layout (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First frame of a transfer: how many Data frames follow and which version they carry.
    Announce { total_packets: u16, version: u8 },
    /// One chunk of the binary. `sequence` is 1-based.
    Data { sequence: u16, payload: Vec<u8> },
}

impl Frame {
    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Announce { .. } => ANNOUNCE_LEN,
            Frame::Data { payload, .. } => DATA_HEADER_LEN + payload.len(),
        }
    }
}

/// Largest payload a Data frame can carry for a given transport payload limit.
pub fn chunk_size_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(DATA_HEADER_LEN)
}
