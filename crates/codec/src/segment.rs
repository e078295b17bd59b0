//! Reliable stream segment header.
//!
//! The byte-stream transport places this header after the SAL header. It
//! is the classic sequence/ack/window layout, except that demultiplexing
//! runs on the SAL flow-id pair, so there are no port fields.
//!
//! ```text
//! 0                16               32
//! +----------------+----------------+
//! | sequence number                 |
//! +---------------------------------+
//! | acknowledgment number           |
//! +--------+--------+---------------+
//! | doff   | flags  | window        |
//! +--------+--------+---------------+
//! | checksum        | urgent        |
//! +-----------------+---------------+
//! | options (aligned timestamp)     |
//! +---------------------------------+
//! ```
//!
//! `doff` is the header length in 32-bit words: 4 bare, 7 with the
//! aligned timestamp option. The checksum field is carried but unused;
//! integrity is covered at the SAL layer.

use crate::Error;

use bytes::{BufMut, BytesMut};

pub const BASE_LEN: usize = 16;

/// The aligned timestamp option: two no-ops, kind 8, length 10, then
/// tsval and tsecr. Parsed as one 32-bit compare on the fast path.
pub const TIMESTAMP_ALIGNED: u32 = 0x0101_080A;
pub const TIMESTAMP_LEN: usize = 12;

/// Segment flag bits.
pub mod seg_flags {
    pub const FIN: u8 = 1 << 0;
    pub const SYN: u8 = 1 << 1;
    pub const RST: u8 = 1 << 2;
    pub const PSH: u8 = 1 << 3;
    pub const ACK: u8 = 1 << 4;
    pub const URG: u8 = 1 << 5;
}

/// A decoded stream segment header.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use svc_stack_codec::segment::{SegmentHeader, seg_flags};
///
/// let header = SegmentHeader {
///     seq: 1,
///     ack: 42,
///     flags: seg_flags::ACK | seg_flags::PSH,
///     window: 0x8000,
///     urgent: 0,
///     timestamp: Some((100, 90)),
///     unknown_options: false,
/// };
///
/// let mut bytes = BytesMut::new();
/// header.encode(&mut bytes);
/// assert_eq!(bytes.len(), 28);
///
/// let (decoded, len) = SegmentHeader::decode(&bytes).unwrap();
///
/// assert_eq!(len, 28);
/// assert_eq!(decoded, header);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub urgent: u16,
    pub timestamp: Option<(u32, u32)>,
    /// Set when the option area held anything other than the aligned
    /// timestamp; such segments take the receive slow path.
    pub unknown_options: bool,
}

impl SegmentHeader {
    pub fn ack_set(&self) -> bool {
        self.flags & seg_flags::ACK != 0
    }

    pub fn encoded_len(&self) -> usize {
        BASE_LEN + if self.timestamp.is_some() {
            TIMESTAMP_LEN
        } else {
            0
        }
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        let doff = (self.encoded_len() / 4) as u16;

        bytes.put_u32(self.seq);
        bytes.put_u32(self.ack);
        bytes.put_u16((doff << 12) | (self.flags as u16 & 0x3F));
        bytes.put_u16(self.window);
        bytes.put_u16(0);
        bytes.put_u16(self.urgent);

        if let Some((tsval, tsecr)) = self.timestamp {
            bytes.put_u32(TIMESTAMP_ALIGNED);
            bytes.put_u32(tsval);
            bytes.put_u32(tsecr);
        }
    }

    /// Parse a segment header off the front of `bytes`, returning it with
    /// its length so the payload can be taken by offset.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < BASE_LEN {
            return Err(Error::Malformed);
        }

        let seq = u32::from_be_bytes(bytes[0..4].try_into()?);
        let ack = u32::from_be_bytes(bytes[4..8].try_into()?);
        let doff_flags = u16::from_be_bytes(bytes[8..10].try_into()?);
        let window = u16::from_be_bytes(bytes[10..12].try_into()?);
        let urgent = u16::from_be_bytes(bytes[14..16].try_into()?);

        let doff = (doff_flags >> 12) as usize * 4;
        if doff < BASE_LEN || doff > bytes.len() {
            return Err(Error::Malformed);
        }

        let mut timestamp = None;
        let mut unknown_options = false;

        let options = &bytes[BASE_LEN..doff];
        if options.len() == TIMESTAMP_LEN
            && u32::from_be_bytes(options[0..4].try_into()?) == TIMESTAMP_ALIGNED
        {
            timestamp = Some((
                u32::from_be_bytes(options[4..8].try_into()?),
                u32::from_be_bytes(options[8..12].try_into()?),
            ));
        } else if !options.is_empty() {
            unknown_options = true;
        }

        Ok((
            Self {
                seq,
                ack,
                flags: (doff_flags & 0x3F) as u8,
                window,
                urgent,
                timestamp,
                unknown_options,
            },
            doff,
        ))
    }
}
