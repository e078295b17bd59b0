//! Resolver control messages.
//!
//! The stack and the cooperating resolver exchange fixed-format messages
//! over a local datagram socket. Every message starts with an 8-byte
//! header `{ type, retval, len, xid }` where `len` covers header plus
//! payload. The socket is host-local, so multi-byte fields are carried in
//! host (little-endian) order; addresses keep their network-order octet
//! layout.

use crate::{Error, FlowId, ServiceId};

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

pub const HEADER_LEN: usize = 8;
pub const SERVICE_INFO_LEN: usize = 60;
pub const SERVICE_INFO_STAT_LEN: usize = 88;

/// Default path of the stack's control socket.
pub const CTRL_SOCKET_PATH: &str = "/tmp/svc-stack-ctrl.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlType {
    Register = 0,
    Unregister = 1,
    Resolve = 2,
    AddService = 3,
    DelService = 4,
    ModService = 5,
    GetService = 6,
    ServiceStat = 7,
    Capabilities = 8,
    Migrate = 9,
}

impl TryFrom<u8> for CtrlType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => Self::Register,
            1 => Self::Unregister,
            2 => Self::Resolve,
            3 => Self::AddService,
            4 => Self::DelService,
            5 => Self::ModService,
            6 => Self::GetService,
            7 => Self::ServiceStat,
            8 => Self::Capabilities,
            9 => Self::Migrate,
            _ => return Err(Error::UnknownType),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Retval {
    #[default]
    Ok = 0,
    Error = 1,
    NoEntry = 2,
    Malformed = 3,
}

impl TryFrom<u8> for Retval {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::NoEntry,
            3 => Self::Malformed,
            _ => return Err(Error::UnknownType),
        })
    }
}

/// Stack capability bits reported by the capabilities message.
pub mod capability {
    /// The stack may resolve and forward packets addressed to services it
    /// does not terminate.
    pub const TRANSIT: u32 = 1 << 0;
}

/// One service table entry as carried on the wire, packed to 60 bytes.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use svc_stack_codec::ServiceId;
/// use svc_stack_codec::ctrl::{SERVICE_INFO_LEN, ServiceInfo};
///
/// let info = ServiceInfo {
///     kind: 2,
///     prefix_bits: 16,
///     flags: 0,
///     if_index: 1,
///     priority: 10,
///     weight: 3,
///     idle_timeout: 60,
///     hard_timeout: 0,
///     address: "10.0.0.1".parse().unwrap(),
///     service_id: ServiceId::from_bytes([7; 32]),
/// };
///
/// let mut bytes = BytesMut::new();
/// info.encode(&mut bytes);
/// assert_eq!(bytes.len(), SERVICE_INFO_LEN);
///
/// assert_eq!(ServiceInfo::decode(&bytes).unwrap(), info);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    pub kind: u16,
    pub prefix_bits: u8,
    pub flags: u8,
    pub if_index: u32,
    pub priority: u32,
    pub weight: u32,
    pub idle_timeout: u32,
    pub hard_timeout: u32,
    pub address: Ipv4Addr,
    pub service_id: ServiceId,
}

impl ServiceInfo {
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16_le(self.kind);
        bytes.put_u8(self.prefix_bits);
        bytes.put_u8(self.flags);
        bytes.put_u32_le(self.if_index);
        bytes.put_u32_le(self.priority);
        bytes.put_u32_le(self.weight);
        bytes.put_u32_le(self.idle_timeout);
        bytes.put_u32_le(self.hard_timeout);
        bytes.put(self.address.octets().as_slice());
        bytes.put(self.service_id.as_bytes().as_slice());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < SERVICE_INFO_LEN {
            return Err(Error::Malformed);
        }

        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes[28..60]);

        Ok(Self {
            kind: u16::from_le_bytes(bytes[0..2].try_into()?),
            prefix_bits: bytes[2],
            flags: bytes[3],
            if_index: u32::from_le_bytes(bytes[4..8].try_into()?),
            priority: u32::from_le_bytes(bytes[8..12].try_into()?),
            weight: u32::from_le_bytes(bytes[12..16].try_into()?),
            idle_timeout: u32::from_le_bytes(bytes[16..20].try_into()?),
            hard_timeout: u32::from_le_bytes(bytes[20..24].try_into()?),
            address: Ipv4Addr::new(bytes[24], bytes[25], bytes[26], bytes[27]),
            service_id: ServiceId::from_bytes(id),
        })
    }
}

/// A service table entry plus its counters, packed to 88 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfoStat {
    pub info: ServiceInfo,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub packets_resolved: u32,
    pub bytes_resolved: u32,
    pub packets_dropped: u32,
    pub bytes_dropped: u32,
    pub tokens_consumed: u32,
}

impl ServiceInfoStat {
    pub fn encode(&self, bytes: &mut BytesMut) {
        self.info.encode(bytes);
        bytes.put_u32_le(self.duration_sec);
        bytes.put_u32_le(self.duration_nsec);
        bytes.put_u32_le(self.packets_resolved);
        bytes.put_u32_le(self.bytes_resolved);
        bytes.put_u32_le(self.packets_dropped);
        bytes.put_u32_le(self.bytes_dropped);
        bytes.put_u32_le(self.tokens_consumed);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < SERVICE_INFO_STAT_LEN {
            return Err(Error::Malformed);
        }

        Ok(Self {
            info: ServiceInfo::decode(&bytes[..SERVICE_INFO_LEN])?,
            duration_sec: u32::from_le_bytes(bytes[60..64].try_into()?),
            duration_nsec: u32::from_le_bytes(bytes[64..68].try_into()?),
            packets_resolved: u32::from_le_bytes(bytes[68..72].try_into()?),
            bytes_resolved: u32::from_le_bytes(bytes[72..76].try_into()?),
            packets_dropped: u32::from_le_bytes(bytes[76..80].try_into()?),
            bytes_dropped: u32::from_le_bytes(bytes[80..84].try_into()?),
            tokens_consumed: u32::from_le_bytes(bytes[84..88].try_into()?),
        })
    }
}

/// Local bind (or unbind) of a service identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub reregister: bool,
    pub prefix_bits: u8,
    pub srvid_flags: u8,
    /// When re-registering, the previous address.
    pub address: Ipv4Addr,
    pub service_id: ServiceId,
}

/// Resolution upcall emitted on a service table miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveUpcall {
    pub src_flags: u8,
    pub src_prefix_bits: u8,
    pub dst_flags: u8,
    pub dst_prefix_bits: u8,
    pub src_service: ServiceId,
    pub dst_service: ServiceId,
    pub src_address: Ipv4Addr,
}

/// Selector for a migration directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateFrom {
    Interface(String),
    Flow(FlowId),
    Service(ServiceId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateDirective {
    pub from: MigrateFrom,
    pub to_interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlMessage {
    Register(Registration),
    Unregister(Registration),
    Resolve(ResolveUpcall),
    AddService(Vec<ServiceInfo>),
    DelService(Vec<ServiceInfo>),
    ModService(Vec<ServiceInfo>),
    GetService(Vec<ServiceInfo>),
    ServiceStat(Vec<ServiceInfoStat>),
    Capabilities(u32),
    Migrate(MigrateDirective),
}

const IFNAMSIZ: usize = 16;
const MIGRATE_FROM_LEN: usize = 32;

fn put_name(bytes: &mut BytesMut, name: &str, len: usize) {
    let raw = name.as_bytes();
    let n = raw.len().min(len - 1);

    bytes.put(&raw[..n]);
    bytes.put_bytes(0, len - n);
}

fn get_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());

    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl CtrlMessage {
    pub fn kind(&self) -> CtrlType {
        match self {
            CtrlMessage::Register(_) => CtrlType::Register,
            CtrlMessage::Unregister(_) => CtrlType::Unregister,
            CtrlMessage::Resolve(_) => CtrlType::Resolve,
            CtrlMessage::AddService(_) => CtrlType::AddService,
            CtrlMessage::DelService(_) => CtrlType::DelService,
            CtrlMessage::ModService(_) => CtrlType::ModService,
            CtrlMessage::GetService(_) => CtrlType::GetService,
            CtrlMessage::ServiceStat(_) => CtrlType::ServiceStat,
            CtrlMessage::Capabilities(_) => CtrlType::Capabilities,
            CtrlMessage::Migrate(_) => CtrlType::Migrate,
        }
    }

    /// Serialize the full message, header included.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use svc_stack_codec::ctrl::{CtrlMessage, Retval};
    ///
    /// let message = CtrlMessage::Capabilities(1);
    ///
    /// let mut bytes = BytesMut::new();
    /// message.encode(7, Retval::Ok, &mut bytes);
    ///
    /// // type 8, retval 0, len 12, xid 7, bitmap 1.
    /// assert_eq!(
    ///     &bytes[..],
    ///     [8, 0, 12, 0, 7, 0, 0, 0, 1, 0, 0, 0]
    /// );
    ///
    /// let (decoded, xid, retval) = CtrlMessage::decode(&bytes).unwrap();
    ///
    /// assert_eq!(decoded, message);
    /// assert_eq!(xid, 7);
    /// assert_eq!(retval, Retval::Ok);
    /// ```
    pub fn encode(&self, xid: u32, retval: Retval, bytes: &mut BytesMut) {
        let start = bytes.len();

        bytes.put_u8(self.kind() as u8);
        bytes.put_u8(retval as u8);
        bytes.put_u16_le(0);
        bytes.put_u32_le(xid);

        match self {
            CtrlMessage::Register(reg) | CtrlMessage::Unregister(reg) => {
                bytes.put_u8(reg.reregister as u8);
                bytes.put_u8(0);
                bytes.put_u8(reg.prefix_bits);
                bytes.put_u8(reg.srvid_flags);
                bytes.put(reg.address.octets().as_slice());
                bytes.put(reg.service_id.as_bytes().as_slice());
            }
            CtrlMessage::Resolve(up) => {
                bytes.put_u8(up.src_flags);
                bytes.put_u8(up.src_prefix_bits);
                bytes.put_u8(up.dst_flags);
                bytes.put_u8(up.dst_prefix_bits);
                bytes.put(up.src_service.as_bytes().as_slice());
                bytes.put(up.dst_service.as_bytes().as_slice());
                bytes.put(up.src_address.octets().as_slice());
            }
            CtrlMessage::AddService(services)
            | CtrlMessage::DelService(services)
            | CtrlMessage::ModService(services)
            | CtrlMessage::GetService(services) => {
                for info in services {
                    info.encode(bytes);
                }
            }
            CtrlMessage::ServiceStat(stats) => {
                for stat in stats {
                    stat.encode(bytes);
                }
            }
            CtrlMessage::Capabilities(bits) => bytes.put_u32_le(*bits),
            CtrlMessage::Migrate(directive) => {
                let (subtype, from) = match &directive.from {
                    MigrateFrom::Interface(name) => {
                        let mut buf = BytesMut::with_capacity(MIGRATE_FROM_LEN);
                        put_name(&mut buf, name, MIGRATE_FROM_LEN);
                        (0u8, buf)
                    }
                    MigrateFrom::Flow(flow) => {
                        let mut buf = BytesMut::with_capacity(MIGRATE_FROM_LEN);
                        buf.put_u32_le(flow.get());
                        buf.put_bytes(0, MIGRATE_FROM_LEN - 4);
                        (1u8, buf)
                    }
                    MigrateFrom::Service(id) => {
                        let mut buf = BytesMut::with_capacity(MIGRATE_FROM_LEN);
                        buf.put(id.as_bytes().as_slice());
                        (2u8, buf)
                    }
                };

                bytes.put_u8(subtype);
                bytes.put(from);
                put_name(bytes, &directive.to_interface, IFNAMSIZ);
            }
        }

        let len = (bytes.len() - start) as u16;
        bytes[start + 2..start + 4].copy_from_slice(&len.to_le_bytes());
    }

    /// Parse one complete message.
    pub fn decode(bytes: &[u8]) -> Result<(Self, u32, Retval), Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Malformed);
        }

        let kind = CtrlType::try_from(bytes[0])?;
        let retval = Retval::try_from(bytes[1])?;
        let len = u16::from_le_bytes(bytes[2..4].try_into()?) as usize;
        let xid = u32::from_le_bytes(bytes[4..8].try_into()?);

        if len < HEADER_LEN || len > bytes.len() {
            return Err(Error::Malformed);
        }

        let payload = &bytes[HEADER_LEN..len];

        let message = match kind {
            CtrlType::Register | CtrlType::Unregister => {
                if payload.len() != 40 {
                    return Err(Error::Malformed);
                }

                let mut id = [0u8; 32];
                id.copy_from_slice(&payload[8..40]);

                let reg = Registration {
                    reregister: payload[0] & 1 != 0,
                    prefix_bits: payload[2],
                    srvid_flags: payload[3],
                    address: Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]),
                    service_id: ServiceId::from_bytes(id),
                };

                if kind == CtrlType::Register {
                    CtrlMessage::Register(reg)
                } else {
                    CtrlMessage::Unregister(reg)
                }
            }
            CtrlType::Resolve => {
                if payload.len() != 72 {
                    return Err(Error::Malformed);
                }

                let mut src = [0u8; 32];
                let mut dst = [0u8; 32];
                src.copy_from_slice(&payload[4..36]);
                dst.copy_from_slice(&payload[36..68]);

                CtrlMessage::Resolve(ResolveUpcall {
                    src_flags: payload[0],
                    src_prefix_bits: payload[1],
                    dst_flags: payload[2],
                    dst_prefix_bits: payload[3],
                    src_service: ServiceId::from_bytes(src),
                    dst_service: ServiceId::from_bytes(dst),
                    src_address: Ipv4Addr::new(
                        payload[68],
                        payload[69],
                        payload[70],
                        payload[71],
                    ),
                })
            }
            CtrlType::AddService
            | CtrlType::DelService
            | CtrlType::ModService
            | CtrlType::GetService => {
                if payload.len() % SERVICE_INFO_LEN != 0 {
                    return Err(Error::Malformed);
                }

                let services = payload
                    .chunks_exact(SERVICE_INFO_LEN)
                    .map(ServiceInfo::decode)
                    .collect::<Result<Vec<_>, _>>()?;

                match kind {
                    CtrlType::AddService => CtrlMessage::AddService(services),
                    CtrlType::DelService => CtrlMessage::DelService(services),
                    CtrlType::ModService => CtrlMessage::ModService(services),
                    _ => CtrlMessage::GetService(services),
                }
            }
            CtrlType::ServiceStat => {
                if payload.len() % SERVICE_INFO_STAT_LEN != 0 {
                    return Err(Error::Malformed);
                }

                CtrlMessage::ServiceStat(
                    payload
                        .chunks_exact(SERVICE_INFO_STAT_LEN)
                        .map(ServiceInfoStat::decode)
                        .collect::<Result<Vec<_>, _>>()?,
                )
            }
            CtrlType::Capabilities => {
                if payload.len() != 4 {
                    return Err(Error::Malformed);
                }

                CtrlMessage::Capabilities(u32::from_le_bytes(payload[0..4].try_into()?))
            }
            CtrlType::Migrate => {
                if payload.len() != 1 + MIGRATE_FROM_LEN + IFNAMSIZ {
                    return Err(Error::Malformed);
                }

                let from = &payload[1..1 + MIGRATE_FROM_LEN];
                let from = match payload[0] {
                    0 => MigrateFrom::Interface(get_name(&from[..IFNAMSIZ])),
                    1 => MigrateFrom::Flow(FlowId::new(u32::from_le_bytes(
                        from[0..4].try_into()?,
                    ))),
                    2 => {
                        let mut id = [0u8; 32];
                        id.copy_from_slice(from);
                        MigrateFrom::Service(ServiceId::from_bytes(id))
                    }
                    _ => return Err(Error::Malformed),
                };

                CtrlMessage::Migrate(MigrateDirective {
                    from,
                    to_interface: get_name(&payload[1 + MIGRATE_FROM_LEN..]),
                })
            }
        };

        Ok((message, xid, retval))
    }
}
