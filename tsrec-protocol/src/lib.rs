//! Shared definitions for the tsrec recorder.
//!
//! This crate defines the data exchanged between the recorder and the
//! remote recording scheduler, and the RTP validator used by
//! network-transport devices to extract transport-stream payload.
//!
//! # RTP Payload
//!
//! ```text
//! +---------+-----------+----------------------+------------------+
//! | V P X CC| M    PT   |   sequence number    |                  |
//! +---------+-----------+----------------------+                  |
//! |            timestamp / SSRC / CSRC list    |  TS cells (188)  |
//! +--------------------------------------------+------------------+
//! |      12 + 4 * CC bytes                     |  n * 188 bytes   |
//! ```
//!
//! # Example
//!
//! ```rust
//! use tsrec_protocol::rtp::{dispatch_ts_payload, RTP_HEADER_SIZE, TS_CELL_SIZE};
//!
//! let mut packet = vec![0u8; RTP_HEADER_SIZE + TS_CELL_SIZE];
//! packet[0] = 0x80; // version 2
//! packet[1] = 0x21; // MPEG-2 TS payload type
//!
//! let mut seen = None;
//! dispatch_ts_payload(&packet, 0, packet.len(), |_, offset, length| {
//!     seen = Some((offset, length));
//! });
//! assert_eq!(seen, Some((RTP_HEADER_SIZE, TS_CELL_SIZE)));
//! ```

pub mod error;
pub mod rtp;
pub mod types;

pub use error::RtpError;
pub use types::{
    Channel, ChannelAllocation, LiveStream, LiveStreamResult, UpcomingProgram, API_VERSION,
};
