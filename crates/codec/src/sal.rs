//! Service access layer header.
//!
//! The SAL header precedes the transport header on every stack packet.
//! It carries the flow-id pair used for demultiplexing and, on control
//! packets, a chain of typed options that drive the handshake, close and
//! migration protocol.
//!
//! Layout:
//!
//! ```text
//! 0        4        8        16       32
//! +--------+--------+--------+--------+
//! | ver    | words  | flags  | check  |
//! +--------+--------+--------+--------+
//! | source flow id                    |
//! +-----------------------------------+
//! | destination flow id               |
//! +-----------------------------------+
//! | options ... terminated by 0, then |
//! | zero padding to a 4-byte boundary |
//! +-----------------------------------+
//! ```
//!
//! `words` is the total header length in 32-bit words, so a SAL header is
//! at most 60 bytes.

use crate::{Error, FlowId, ServiceId, checksum};

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

pub const VERSION: u8 = 1;
pub const BASE_LEN: usize = 12;
pub const MAX_LEN: usize = 60;

/// SAL control flags.
///
/// A header with none of these set carries transport payload.
///
/// # Test
///
/// ```
/// use svc_stack_codec::sal::SalFlags;
///
/// let mut flags = SalFlags::default();
/// flags.insert(SalFlags::CONNECT);
/// flags.insert(SalFlags::ACK);
///
/// assert!(flags.contains(SalFlags::CONNECT));
/// assert!(!flags.contains(SalFlags::FIN));
/// assert!(flags.is_control());
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SalFlags(u8);

impl SalFlags {
    pub const CONNECT: SalFlags = SalFlags(1 << 0);
    pub const ACK: SalFlags = SalFlags(1 << 1);
    pub const FIN: SalFlags = SalFlags(1 << 2);
    pub const RST: SalFlags = SalFlags(1 << 3);
    pub const MIGRATE: SalFlags = SalFlags(1 << 4);

    pub fn contains(&self, other: SalFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SalFlags) {
        self.0 |= other.0;
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Whether the packet must be handled by the SAL state machine
    /// rather than the transport.
    pub fn is_control(&self) -> bool {
        self.0 != 0
    }
}

impl std::ops::BitOr for SalFlags {
    type Output = SalFlags;

    fn bitor(self, rhs: SalFlags) -> SalFlags {
        SalFlags(self.0 | rhs.0)
    }
}

mod option_type {
    pub const END: u8 = 0;
    pub const CONNECT: u8 = 1;
    pub const CONNECT_ACK: u8 = 2;
    pub const ACK: u8 = 3;
    pub const FIN: u8 = 4;
    pub const MIGRATE: u8 = 5;
    pub const SERVICE_ID: u8 = 6;
}

/// Transport capability bits negotiated during the handshake.
pub mod caps {
    /// Peer supports selective acknowledgment. This stack is reno-only
    /// and refuses connections that set it.
    pub const SACK_PERMITTED: u8 = 1 << 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SalOption {
    /// Active open: initial sequence number plus the offered transport
    /// parameters.
    Connect {
        seqno: u32,
        mss: u16,
        wscale: u8,
        caps: u8,
    },
    /// Passive-side reply: responder parameters plus the cumulative ack
    /// of the initiator's Connect.
    ConnectAck {
        seqno: u32,
        ackno: u32,
        mss: u16,
        wscale: u8,
        caps: u8,
    },
    /// Control-level cumulative acknowledgment.
    Ack { ackno: u32 },
    /// Connection teardown; consumes one sequence number.
    Fin { seqno: u32 },
    /// Source address change announcement; consumes one sequence number.
    Migrate { seqno: u32, addr: Ipv4Addr },
    /// Destination service identifier, carried on control packets sent
    /// before a flow is established.
    ServiceId(ServiceId),
}

impl SalOption {
    fn payload_len(&self) -> usize {
        match self {
            SalOption::Connect { .. } => 8,
            SalOption::ConnectAck { .. } => 12,
            SalOption::Ack { .. } => 4,
            SalOption::Fin { .. } => 4,
            SalOption::Migrate { .. } => 8,
            SalOption::ServiceId(_) => 32,
        }
    }

    fn encode(&self, bytes: &mut BytesMut) {
        let (kind, len) = match self {
            SalOption::Connect { .. } => (option_type::CONNECT, self.payload_len()),
            SalOption::ConnectAck { .. } => (option_type::CONNECT_ACK, self.payload_len()),
            SalOption::Ack { .. } => (option_type::ACK, self.payload_len()),
            SalOption::Fin { .. } => (option_type::FIN, self.payload_len()),
            SalOption::Migrate { .. } => (option_type::MIGRATE, self.payload_len()),
            SalOption::ServiceId(_) => (option_type::SERVICE_ID, self.payload_len()),
        };

        bytes.put_u8(kind);
        bytes.put_u8((len + 2) as u8);

        match *self {
            SalOption::Connect {
                seqno,
                mss,
                wscale,
                caps,
            } => {
                bytes.put_u32(seqno);
                bytes.put_u16(mss);
                bytes.put_u8(wscale);
                bytes.put_u8(caps);
            }
            SalOption::ConnectAck {
                seqno,
                ackno,
                mss,
                wscale,
                caps,
            } => {
                bytes.put_u32(seqno);
                bytes.put_u32(ackno);
                bytes.put_u16(mss);
                bytes.put_u8(wscale);
                bytes.put_u8(caps);
            }
            SalOption::Ack { ackno } => bytes.put_u32(ackno),
            SalOption::Fin { seqno } => bytes.put_u32(seqno),
            SalOption::Migrate { seqno, addr } => {
                bytes.put_u32(seqno);
                bytes.put_u32(addr.to_bits());
            }
            SalOption::ServiceId(id) => bytes.put(id.as_bytes().as_slice()),
        }
    }

    fn decode(kind: u8, value: &[u8]) -> Result<Option<Self>, Error> {
        let opt = match kind {
            option_type::CONNECT => {
                if value.len() != 8 {
                    return Err(Error::Malformed);
                }

                SalOption::Connect {
                    seqno: u32::from_be_bytes(value[0..4].try_into()?),
                    mss: u16::from_be_bytes(value[4..6].try_into()?),
                    wscale: value[6],
                    caps: value[7],
                }
            }
            option_type::CONNECT_ACK => {
                if value.len() != 12 {
                    return Err(Error::Malformed);
                }

                SalOption::ConnectAck {
                    seqno: u32::from_be_bytes(value[0..4].try_into()?),
                    ackno: u32::from_be_bytes(value[4..8].try_into()?),
                    mss: u16::from_be_bytes(value[8..10].try_into()?),
                    wscale: value[10],
                    caps: value[11],
                }
            }
            option_type::ACK => {
                if value.len() != 4 {
                    return Err(Error::Malformed);
                }

                SalOption::Ack {
                    ackno: u32::from_be_bytes(value[0..4].try_into()?),
                }
            }
            option_type::FIN => {
                if value.len() != 4 {
                    return Err(Error::Malformed);
                }

                SalOption::Fin {
                    seqno: u32::from_be_bytes(value[0..4].try_into()?),
                }
            }
            option_type::MIGRATE => {
                if value.len() != 8 {
                    return Err(Error::Malformed);
                }

                SalOption::Migrate {
                    seqno: u32::from_be_bytes(value[0..4].try_into()?),
                    addr: Ipv4Addr::from_bits(u32::from_be_bytes(value[4..8].try_into()?)),
                }
            }
            option_type::SERVICE_ID => {
                if value.len() != 32 {
                    return Err(Error::Malformed);
                }

                let mut id = [0u8; 32];
                id.copy_from_slice(value);
                SalOption::ServiceId(ServiceId::from_bytes(id))
            }
            // Unknown options are skipped, not fatal.
            _ => return Ok(None),
        };

        Ok(Some(opt))
    }
}

/// A decoded (or to-be-encoded) SAL header.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use svc_stack_codec::FlowId;
/// use svc_stack_codec::sal::{SalFlags, SalHeader, SalOption};
///
/// let header = SalHeader {
///     flags: SalFlags::CONNECT,
///     src_flow: FlowId::new(0xdeadbeef),
///     dst_flow: FlowId::NONE,
///     options: vec![SalOption::Connect {
///         seqno: 1000,
///         mss: 1440,
///         wscale: 2,
///         caps: 0,
///     }],
/// };
///
/// let mut bytes = BytesMut::new();
/// header.encode(&mut bytes);
///
/// let (decoded, len) = SalHeader::decode(&bytes).unwrap();
///
/// assert_eq!(len, bytes.len());
/// assert_eq!(decoded, header);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalHeader {
    pub flags: SalFlags,
    pub src_flow: FlowId,
    pub dst_flow: FlowId,
    pub options: Vec<SalOption>,
}

impl SalHeader {
    pub fn data(src_flow: FlowId, dst_flow: FlowId) -> Self {
        Self {
            flags: SalFlags::default(),
            src_flow,
            dst_flow,
            options: Vec::new(),
        }
    }

    pub fn control(flags: SalFlags, src_flow: FlowId, dst_flow: FlowId) -> Self {
        Self {
            flags,
            src_flow,
            dst_flow,
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, option: SalOption) -> Self {
        self.options.push(option);
        self
    }

    /// Total encoded length, padded to a 4-byte boundary.
    pub fn encoded_len(&self) -> usize {
        let mut len = BASE_LEN;

        for opt in &self.options {
            len += 2 + opt.payload_len();
        }

        if !self.options.is_empty() {
            // End marker.
            len += 1;
        }

        (len + 3) & !3
    }

    /// Serialize the header into `bytes`, computing the checksum over the
    /// finished header.
    pub fn encode(&self, bytes: &mut BytesMut) {
        let start = bytes.len();
        let total = self.encoded_len();
        debug_assert!(total <= MAX_LEN);

        bytes.put_u8((VERSION << 4) | (total / 4) as u8);
        bytes.put_u8(self.flags.bits());
        bytes.put_u16(0);
        bytes.put_u32(self.src_flow.get());
        bytes.put_u32(self.dst_flow.get());

        for opt in &self.options {
            opt.encode(bytes);
        }

        if !self.options.is_empty() {
            bytes.put_u8(option_type::END);
        }

        while bytes.len() - start < total {
            bytes.put_u8(0);
        }

        let sum = checksum(&bytes[start..start + total]);
        bytes[start + 2..start + 4].copy_from_slice(&sum.to_be_bytes());
    }

    /// Parse a SAL header off the front of `bytes`, returning it together
    /// with its length so callers can strip it by offset.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < BASE_LEN {
            return Err(Error::Malformed);
        }

        if bytes[0] >> 4 != VERSION {
            return Err(Error::UnknownVersion);
        }

        let total = ((bytes[0] & 0x0F) as usize) * 4;
        if total < BASE_LEN || total > bytes.len() {
            return Err(Error::Malformed);
        }

        // The checksum field participates as zero.
        if checksum(&bytes[..total]) != 0 {
            return Err(Error::ChecksumFailed);
        }

        let flags = SalFlags::from_bits(bytes[1]);
        let src_flow = FlowId::new(u32::from_be_bytes(bytes[4..8].try_into()?));
        let dst_flow = FlowId::new(u32::from_be_bytes(bytes[8..12].try_into()?));

        let mut options = Vec::new();
        let mut offset = BASE_LEN;

        while offset < total {
            let kind = bytes[offset];
            if kind == option_type::END {
                break;
            }

            if offset + 2 > total {
                return Err(Error::Malformed);
            }

            let len = bytes[offset + 1] as usize;
            if len < 2 || offset + len > total {
                return Err(Error::Malformed);
            }

            if let Some(opt) = SalOption::decode(kind, &bytes[offset + 2..offset + len])? {
                options.push(opt);
            }

            offset += len;
        }

        Ok((
            Self {
                flags,
                src_flow,
                dst_flow,
                options,
            },
            total,
        ))
    }

    pub fn service_id(&self) -> Option<&ServiceId> {
        self.options.iter().find_map(|opt| match opt {
            SalOption::ServiceId(id) => Some(id),
            _ => None,
        })
    }

    pub fn find_connect(&self) -> Option<(u32, u16, u8, u8)> {
        self.options.iter().find_map(|opt| match opt {
            SalOption::Connect {
                seqno,
                mss,
                wscale,
                caps,
            } => Some((*seqno, *mss, *wscale, *caps)),
            _ => None,
        })
    }

    pub fn find_connect_ack(&self) -> Option<(u32, u32, u16, u8, u8)> {
        self.options.iter().find_map(|opt| match opt {
            SalOption::ConnectAck {
                seqno,
                ackno,
                mss,
                wscale,
                caps,
            } => Some((*seqno, *ackno, *mss, *wscale, *caps)),
            _ => None,
        })
    }

    pub fn find_ack(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            SalOption::Ack { ackno } => Some(*ackno),
            _ => None,
        })
    }

    pub fn find_fin(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            SalOption::Fin { seqno } => Some(*seqno),
            _ => None,
        })
    }

    pub fn find_migrate(&self) -> Option<(u32, Ipv4Addr)> {
        self.options.iter().find_map(|opt| match opt {
            SalOption::Migrate { seqno, addr } => Some((*seqno, *addr)),
            _ => None,
        })
    }
}
