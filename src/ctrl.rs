use crate::config::Config;

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use codec::ctrl::{CtrlMessage, Retval, ServiceInfo, ServiceInfoStat};
use parking_lot::Mutex;
use service::{
    Error, MigrateSelector, Stack,
    routing::{RouteEntry, RouteSpec},
};
use tokio::{net::UnixDatagram, sync::mpsc::UnboundedReceiver};

/// Bind the resolver control socket and serve the message protocol.
///
/// Two tasks run for the life of the daemon: one answers requests from
/// the resolver, one forwards the stack's upcalls to whichever resolver
/// last spoke to us.
pub async fn start(
    config: Arc<Config>,
    stack: Stack,
    mut upcalls: UnboundedReceiver<CtrlMessage>,
) -> Result<()> {
    let path = config.ctrl.path.clone();

    // A previous run may have left the socket behind.
    let _ = std::fs::remove_file(&path);
    let socket = Arc::new(UnixDatagram::bind(&path)?);

    let resolver: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));

    {
        let socket = socket.clone();
        let resolver = resolver.clone();

        tokio::spawn(async move {
            let mut xid = 0u32;
            let mut buf = BytesMut::with_capacity(256);

            while let Some(message) = upcalls.recv().await {
                let Some(peer) = resolver.lock().clone() else {
                    log::debug!("upcall dropped: no resolver connected yet");
                    continue;
                };

                xid = xid.wrapping_add(1);
                buf.clear();
                message.encode(xid, Retval::Ok, &mut buf);

                if let Err(err) = socket.send_to(&buf, &peer).await {
                    log::warn!("upcall send failed: {}", err);
                }
            }
        });
    }

    {
        let socket = socket.clone();
        let path = path.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];

            loop {
                let (size, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        log::warn!("control socket receive error on {}: {}", path, err);
                        continue;
                    }
                };

                let from = from.as_pathname().map(|p| p.to_path_buf());
                if let Some(peer) = &from {
                    *resolver.lock() = Some(peer.clone());
                }

                let reply = handle_request(&config, &stack, &buf[..size]);
                if let (Some(reply), Some(peer)) = (reply, from) {
                    if let Err(err) = socket.send_to(&reply, peer).await {
                        log::warn!("control reply failed: {}", err);
                    }
                }
            }
        });
    }

    log::info!("control socket listening: {}", path);
    Ok(())
}

// The wire field is a u8; 0 means a full 256-bit match.
fn prefix_bits(bits: u8) -> u16 {
    if bits == 0 { 256 } else { bits as u16 }
}

fn wire_bits(bits: u16) -> u8 {
    if bits >= 256 { 0 } else { bits as u8 }
}

fn route_spec(info: &ServiceInfo) -> Result<RouteSpec, Error> {
    Ok(RouteSpec {
        kind: info.kind.try_into()?,
        next_hop: info.address,
        if_index: info.if_index,
        priority: info.priority,
        weight: info.weight,
        idle_timeout: info.idle_timeout,
        hard_timeout: info.hard_timeout,
    })
}

fn info_of(prefix: &codec::ServiceId, bits: u16, entry: &RouteEntry) -> ServiceInfo {
    ServiceInfo {
        kind: entry.kind as u16,
        prefix_bits: wire_bits(bits),
        flags: 0,
        if_index: entry.if_index,
        priority: entry.priority,
        weight: entry.weight,
        idle_timeout: entry.idle_timeout,
        hard_timeout: entry.hard_timeout,
        address: entry.next_hop,
        service_id: *prefix,
    }
}

fn stat_of(prefix: &codec::ServiceId, bits: u16, entry: &RouteEntry, now: u64) -> ServiceInfoStat {
    use std::sync::atomic::Ordering;

    ServiceInfoStat {
        info: info_of(prefix, bits, entry),
        duration_sec: entry.age(now) as u32,
        duration_nsec: 0,
        packets_resolved: entry.counters.packets_resolved.load(Ordering::Relaxed),
        bytes_resolved: entry.counters.bytes_resolved.load(Ordering::Relaxed),
        packets_dropped: entry.counters.packets_dropped.load(Ordering::Relaxed),
        bytes_dropped: entry.counters.bytes_dropped.load(Ordering::Relaxed),
        tokens_consumed: entry.counters.tokens_consumed.load(Ordering::Relaxed),
    }
}

fn retval_of(result: Result<(), Error>) -> Retval {
    match result {
        Ok(()) => Retval::Ok,
        Err(Error::NoEntry) => Retval::NoEntry,
        Err(Error::Malformed) => Retval::Malformed,
        Err(_) => Retval::Error,
    }
}

/// Run one control request against the stack, producing the reply.
pub fn handle_request(config: &Config, stack: &Stack, raw: &[u8]) -> Option<BytesMut> {
    let mut reply = BytesMut::with_capacity(256);

    let (message, xid, _) = match CtrlMessage::decode(raw) {
        Ok(decoded) => decoded,
        Err(err) => {
            log::debug!("malformed control message: {}", err);

            // Echo a bare header carrying the malformed verdict.
            reply.put_u8(*raw.first().unwrap_or(&0));
            reply.put_u8(Retval::Malformed as u8);
            reply.put_u16_le(codec::ctrl::HEADER_LEN as u16);
            reply.put_u32_le(0);
            return Some(reply);
        }
    };

    match message {
        CtrlMessage::Register(reg) => {
            stack.register(&reg.service_id, prefix_bits(reg.prefix_bits), 0);
            CtrlMessage::Register(reg).encode(xid, Retval::Ok, &mut reply);
        }
        CtrlMessage::Unregister(reg) => {
            let retval =
                retval_of(stack.unregister(&reg.service_id, prefix_bits(reg.prefix_bits), 0));
            CtrlMessage::Unregister(reg).encode(xid, retval, &mut reply);
        }
        CtrlMessage::AddService(services) => {
            let mut retval = Retval::Ok;

            for info in &services {
                match route_spec(info) {
                    Ok(spec) => {
                        stack.add_route(&info.service_id, prefix_bits(info.prefix_bits), &spec)
                    }
                    Err(_) => retval = Retval::Malformed,
                }
            }

            CtrlMessage::AddService(services).encode(xid, retval, &mut reply);
        }
        CtrlMessage::DelService(services) => {
            let mut retval = Retval::Ok;

            for info in &services {
                // An all-zero selector clears the whole node.
                let selector = if info.address.is_unspecified() && info.if_index == 0 {
                    None
                } else {
                    Some((info.address, info.if_index))
                };

                if let Err(err) =
                    stack.del_route(&info.service_id, prefix_bits(info.prefix_bits), selector)
                {
                    retval = retval_of(Err(err));
                }
            }

            CtrlMessage::DelService(services).encode(xid, retval, &mut reply);
        }
        CtrlMessage::ModService(services) => {
            let mut retval = Retval::Ok;

            for info in &services {
                let result = route_spec(info).and_then(|spec| {
                    stack.mod_route(&info.service_id, prefix_bits(info.prefix_bits), &spec)
                });

                if result.is_err() {
                    retval = retval_of(result);
                }
            }

            CtrlMessage::ModService(services).encode(xid, retval, &mut reply);
        }
        CtrlMessage::GetService(selectors) => {
            // The response is add_service-shaped.
            let (prefix, bits) = match selectors.first() {
                Some(info) => (info.service_id, prefix_bits(info.prefix_bits)),
                None => (codec::ServiceId::default(), 0),
            };

            let services: Vec<ServiceInfo> = stack
                .get_routes(&prefix, bits)
                .iter()
                .map(|(p, b, entry)| info_of(p, *b, entry))
                .collect();

            let retval = if services.is_empty() {
                Retval::NoEntry
            } else {
                Retval::Ok
            };
            CtrlMessage::AddService(services).encode(xid, retval, &mut reply);
        }
        CtrlMessage::ServiceStat(selectors) => {
            let (prefix, bits) = match selectors.first() {
                Some(stat) => (stat.info.service_id, prefix_bits(stat.info.prefix_bits)),
                None => (codec::ServiceId::default(), 0),
            };

            let now = stack.table().now();
            let stats: Vec<ServiceInfoStat> = stack
                .get_routes(&prefix, bits)
                .iter()
                .map(|(p, b, entry)| stat_of(p, *b, entry, now))
                .collect();

            let retval = if stats.is_empty() {
                Retval::NoEntry
            } else {
                Retval::Ok
            };
            CtrlMessage::ServiceStat(stats).encode(xid, retval, &mut reply);
        }
        CtrlMessage::Capabilities(_) => {
            CtrlMessage::Capabilities(stack.capabilities()).encode(xid, Retval::Ok, &mut reply);
        }
        CtrlMessage::Migrate(directive) => {
            let mut retval = Retval::NoEntry;

            let target = config
                .if_index_by_name(&directive.to_interface)
                .and_then(|to_if| config.addr_by_if_index(to_if).map(|addr| (to_if, addr)));

            if let Some((to_if, new_source)) = target {
                let selector = match &directive.from {
                    codec::ctrl::MigrateFrom::Interface(name) => config
                        .if_index_by_name(name)
                        .map(MigrateSelector::Interface),
                    codec::ctrl::MigrateFrom::Flow(flow) => Some(MigrateSelector::Flow(*flow)),
                    codec::ctrl::MigrateFrom::Service(sid) => {
                        Some(MigrateSelector::Service(*sid))
                    }
                };

                if let Some(selector) = selector {
                    let migrated = stack.migrate(&selector, to_if, new_source, crate::now_ms());
                    if migrated > 0 {
                        retval = Retval::Ok;
                    }

                    log::info!(
                        "migration directive: {} flows moved to {}",
                        migrated,
                        directive.to_interface
                    );
                }
            }

            CtrlMessage::Migrate(directive).encode(xid, retval, &mut reply);
        }
        CtrlMessage::Resolve(up) => {
            // Upcalls travel the other way; a resolve request here is a
            // protocol misuse.
            CtrlMessage::Resolve(up).encode(xid, Retval::Error, &mut reply);
        }
    }

    Some(reply)
}
