//! Error types for packet inspection.

use thiserror::Error;

/// Reasons an RTP packet is not accepted as transport-stream payload.
///
/// The dispatcher drops rejected packets silently; the reason is only
/// surfaced by [`crate::rtp::inspect`] for diagnostics.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpError {
    /// Packet is shorter than the fixed RTP header.
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),

    /// Offset and length point outside the buffer.
    #[error("Packet range {offset}+{length} exceeds buffer of {buffer} bytes")]
    OutOfBounds {
        offset: usize,
        length: usize,
        buffer: usize,
    },

    /// Payload type is not MPEG-2 transport stream.
    #[error("Unsupported payload type: 0x{0:02X}")]
    PayloadType(u8),

    /// RTP version is not 2.
    #[error("Unsupported RTP version: {0}")]
    Version(u8),

    /// Header extension bit is set.
    #[error("Header extensions are not supported")]
    Extension,

    /// Padding bit is set.
    #[error("Padding is not supported")]
    Padding,

    /// CSRC list is longer than the packet.
    #[error("Header of {header} bytes exceeds packet of {length} bytes")]
    HeaderOverrun { header: usize, length: usize },

    /// Payload is not made of whole transport-stream cells.
    #[error("Payload of {0} bytes is not a multiple of the TS cell size")]
    PartialCell(usize),
}
