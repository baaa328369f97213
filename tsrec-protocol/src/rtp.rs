//! RTP framing of MPEG-2 transport streams.
//!
//! Network-transport devices receive transport-stream cells wrapped in RTP
//! (RFC 2250). Only the plain form is accepted: version 2, payload type
//! 0x21, no padding, no header extension, and a payload made of whole TS
//! cells. Everything else is dropped without an error.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |            contributing source (CSRC) identifiers             |
//! |                             ....                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::ops::Range;

use bytes::Bytes;

use crate::error::RtpError;

/// Size of the fixed RTP header.
pub const RTP_HEADER_SIZE: usize = 12;

/// Size of a transport-stream cell.
pub const TS_CELL_SIZE: usize = 188;

/// RTP payload type for MPEG-2 transport streams.
pub const PAYLOAD_TYPE_MP2T: u8 = 0x21;

/// Header bit layout.
mod bits {
    pub const PAYLOAD_TYPE: u8 = 0x7F;
    pub const EXTENSION: u8 = 0x10;
    pub const PADDING: u8 = 0x20;
    pub const CSRC_COUNT: u8 = 0x0F;
    pub const VERSION_SHIFT: u8 = 6;
}

/// Validate a packet and return the byte range of its TS payload.
///
/// The range is absolute, i.e. relative to the start of `packet`, not to
/// `offset`.
pub fn inspect(packet: &[u8], offset: usize, length: usize) -> Result<Range<usize>, RtpError> {
    if length < RTP_HEADER_SIZE {
        return Err(RtpError::TooShort(length));
    }
    let end = offset
        .checked_add(length)
        .filter(|&end| end <= packet.len())
        .ok_or(RtpError::OutOfBounds {
            offset,
            length,
            buffer: packet.len(),
        })?;

    // Type first, it rejects most foreign traffic
    let payload_type = packet[offset + 1] & bits::PAYLOAD_TYPE;
    if payload_type != PAYLOAD_TYPE_MP2T {
        return Err(RtpError::PayloadType(payload_type));
    }

    let first = packet[offset];
    let version = first >> bits::VERSION_SHIFT;
    if version != 2 {
        return Err(RtpError::Version(version));
    }
    if first & bits::EXTENSION != 0 {
        return Err(RtpError::Extension);
    }
    if first & bits::PADDING != 0 {
        return Err(RtpError::Padding);
    }

    let header = RTP_HEADER_SIZE + 4 * usize::from(first & bits::CSRC_COUNT);
    let payload = length
        .checked_sub(header)
        .ok_or(RtpError::HeaderOverrun { header, length })?;
    if payload % TS_CELL_SIZE != 0 {
        return Err(RtpError::PartialCell(payload));
    }

    Ok(offset + header..end)
}

/// Hand the TS payload of a valid packet to `sink`.
///
/// The sink receives `(packet, payload_offset, payload_length)`. Invalid
/// packets are ignored.
pub fn dispatch_ts_payload<F>(packet: &[u8], offset: usize, length: usize, sink: F)
where
    F: FnOnce(&[u8], usize, usize),
{
    if let Ok(range) = inspect(packet, offset, length) {
        sink(packet, range.start, range.len());
    }
}

/// Zero-copy variant of [`dispatch_ts_payload`] for a whole datagram.
pub fn ts_payload(packet: &Bytes) -> Option<Bytes> {
    inspect(packet, 0, packet.len())
        .ok()
        .map(|range| packet.slice(range))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(first: u8, payload_type: u8, payload: usize) -> Vec<u8> {
        let mut buf = vec![0u8; RTP_HEADER_SIZE + payload];
        buf[0] = first;
        buf[1] = payload_type;
        buf
    }

    fn dispatched(packet: &[u8], offset: usize, length: usize) -> Option<(usize, usize)> {
        let mut seen = None;
        dispatch_ts_payload(packet, offset, length, |_, o, l| seen = Some((o, l)));
        seen
    }

    #[test]
    fn test_partial_cell_rejected() {
        let buf = packet(0x80, 0x21, 100);
        assert_eq!(inspect(&buf, 0, buf.len()), Err(RtpError::PartialCell(100)));
        assert_eq!(dispatched(&buf, 0, buf.len()), None);
    }

    #[test]
    fn test_whole_cells_dispatched() {
        let buf = packet(0x80, 0x21, 2 * TS_CELL_SIZE);
        assert_eq!(
            dispatched(&buf, 0, buf.len()),
            Some((RTP_HEADER_SIZE, 2 * TS_CELL_SIZE))
        );
    }

    #[test]
    fn test_header_only_packet_dispatches_empty_payload() {
        let buf = packet(0x80, 0x21, 0);
        assert_eq!(dispatched(&buf, 0, buf.len()), Some((RTP_HEADER_SIZE, 0)));
    }

    #[test]
    fn test_marker_bit_is_ignored() {
        let buf = packet(0x80, 0x80 | 0x21, TS_CELL_SIZE);
        assert!(dispatched(&buf, 0, buf.len()).is_some());
    }

    #[test]
    fn test_csrc_list_extends_header() {
        // Two contributing sources
        let buf = packet(0x82, 0x21, 8 + TS_CELL_SIZE);
        assert_eq!(
            dispatched(&buf, 0, buf.len()),
            Some((RTP_HEADER_SIZE + 8, TS_CELL_SIZE))
        );
    }

    #[test]
    fn test_csrc_list_longer_than_packet() {
        let buf = packet(0x8F, 0x21, 0);
        assert_eq!(
            inspect(&buf, 0, buf.len()),
            Err(RtpError::HeaderOverrun {
                header: 72,
                length: 12
            })
        );
    }

    #[test]
    fn test_offset_is_honored() {
        let mut buf = vec![0xFFu8; 5];
        buf.extend(packet(0x80, 0x21, TS_CELL_SIZE));
        let length = buf.len() - 5;
        assert_eq!(
            dispatched(&buf, 5, length),
            Some((5 + RTP_HEADER_SIZE, TS_CELL_SIZE))
        );
    }

    #[test]
    fn test_header_rejections() {
        let short = packet(0x80, 0x21, 0);
        assert_eq!(inspect(&short, 0, 11), Err(RtpError::TooShort(11)));
        assert!(matches!(
            inspect(&short, 4, 12),
            Err(RtpError::OutOfBounds { .. })
        ));

        let wrong_type = packet(0x80, 0x20, TS_CELL_SIZE);
        assert_eq!(
            inspect(&wrong_type, 0, wrong_type.len()),
            Err(RtpError::PayloadType(0x20))
        );

        let wrong_version = packet(0x40, 0x21, TS_CELL_SIZE);
        assert_eq!(
            inspect(&wrong_version, 0, wrong_version.len()),
            Err(RtpError::Version(1))
        );

        let extension = packet(0x90, 0x21, TS_CELL_SIZE);
        assert_eq!(
            inspect(&extension, 0, extension.len()),
            Err(RtpError::Extension)
        );

        let padding = packet(0xA0, 0x21, TS_CELL_SIZE);
        assert_eq!(inspect(&padding, 0, padding.len()), Err(RtpError::Padding));
    }

    #[test]
    fn test_ts_payload_slices_datagram() {
        let mut buf = packet(0x80, 0x21, TS_CELL_SIZE);
        buf[RTP_HEADER_SIZE] = 0x47;
        let datagram = Bytes::from(buf);

        let payload = ts_payload(&datagram).unwrap();
        assert_eq!(payload.len(), TS_CELL_SIZE);
        assert_eq!(payload[0], 0x47);

        assert!(ts_payload(&Bytes::from_static(&[0x80, 0x21])).is_none());
    }
}
