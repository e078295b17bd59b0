use std::{net::Ipv4Addr, sync::Arc};

use anyhow::Result;
use bytes::BytesMut;
use codec::{
    FlowId, ServiceId,
    sal::{SalFlags, SalHeader},
};
use parking_lot::Mutex;
use svc_stack_service::{
    Error, MigrateSelector, Stack, StackConfig, StackHandler, StackOptions,
    routing::RouteSpec,
    sal::SalState,
};

#[derive(Default, Clone)]
struct Recorder {
    misses: Arc<Mutex<Vec<ServiceId>>>,
}

impl StackHandler for Recorder {
    fn on_resolve_miss(&self, _src: Option<&ServiceId>, dst: &ServiceId, _src_addr: Ipv4Addr) {
        self.misses.lock().push(*dst);
    }
}

fn sid(n: u8) -> ServiceId {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    ServiceId::from_bytes(bytes)
}

fn addr(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, n)
}

struct Pair {
    a: Stack,
    b: Stack,
    recorder_a: Recorder,
}

impl Pair {
    fn new() -> Self {
        let recorder_a = Recorder::default();

        let a = Stack::new(StackOptions {
            config: StackConfig::default(),
            local_addr: addr(1),
            capabilities: 0,
            handler: recorder_a.clone(),
        });

        let b = Stack::new(StackOptions {
            config: StackConfig::default(),
            local_addr: addr(2),
            capabilities: 0,
            handler: Recorder::default(),
        });

        Self { a, b, recorder_a }
    }

    /// Route the service from a's point of view to host b.
    fn route_to_b(&self, service: &ServiceId) {
        self.a.add_route(service, 256, &RouteSpec::forward(addr(2), 1));
    }

    /// Shuttle packets both ways until the wire is quiet.
    fn pump(&self, now: u64) {
        loop {
            let mut moved = false;

            while let Some(out) = self.a.pop_outbound() {
                let _ = self.b.handle_packet(&out.bytes, addr(1), 1, now);
                moved = true;
            }

            while let Some(out) = self.b.pop_outbound() {
                let _ = self.a.handle_packet(&out.bytes, addr(2), 1, now);
                moved = true;
            }

            if !moved {
                break;
            }
        }
    }
}

fn established_pair() -> Result<(Pair, Arc<svc_stack_service::stream::StreamSocket>, Arc<svc_stack_service::stream::StreamSocket>)>
{
    let pair = Pair::new();
    let service = sid(42);
    pair.route_to_b(&service);

    let listener = pair.b.socket();
    listener.bind(service)?;
    listener.listen()?;
    listener.set_nonblocking(true);

    let client = pair.a.socket();
    client.set_nonblocking(true);
    client.connect(service, 0)?;

    pair.pump(0);

    let accepted = listener.accept()?;
    assert_eq!(client.state(), SalState::Established);
    assert_eq!(accepted.state(), SalState::Established);

    Ok((pair, client, accepted))
}

#[test]
fn handshake_wire_sequence() -> Result<()> {
    let pair = Pair::new();
    let service = sid(42);
    pair.route_to_b(&service);

    let listener = pair.b.socket();
    listener.bind(service)?;
    listener.listen()?;
    listener.set_nonblocking(true);

    let client = pair.a.socket();
    client.set_nonblocking(true);
    client.connect(service, 0)?;

    // First message: connect carrying the client flow and the service.
    let connect = pair.a.pop_outbound().expect("connect emitted");
    let (hdr, _) = SalHeader::decode(&connect.bytes)?;
    assert!(hdr.flags.contains(SalFlags::CONNECT));
    assert!(!hdr.flags.contains(SalFlags::ACK));
    assert_eq!(hdr.src_flow, client.local_flow());
    assert_eq!(hdr.service_id(), Some(&service));

    pair.b.handle_packet(&connect.bytes, addr(1), 1, 0)?;

    // Second: connect-ack from the responder, addressed at the client
    // flow and carrying the responder's.
    let connect_ack = pair.b.pop_outbound().expect("connect-ack emitted");
    let (hdr, _) = SalHeader::decode(&connect_ack.bytes)?;
    assert!(hdr.flags.contains(SalFlags::CONNECT));
    assert!(hdr.flags.contains(SalFlags::ACK));
    assert_eq!(hdr.dst_flow, client.local_flow());
    let responder_flow = hdr.src_flow;

    pair.a.handle_packet(&connect_ack.bytes, addr(2), 1, 0)?;

    // Third: the closing ack of the three-way exchange.
    let ack = pair.a.pop_outbound().expect("ack emitted");
    let (hdr, _) = SalHeader::decode(&ack.bytes)?;
    assert!(hdr.flags.contains(SalFlags::ACK));
    assert!(!hdr.flags.contains(SalFlags::CONNECT));
    assert_eq!(hdr.dst_flow, responder_flow);

    pair.b.handle_packet(&ack.bytes, addr(1), 1, 0)?;

    assert_eq!(client.state(), SalState::Established);

    let accepted = listener.accept()?;
    assert_eq!(accepted.state(), SalState::Established);
    assert_eq!(accepted.local_flow(), responder_flow);

    Ok(())
}

#[test]
fn stream_transfer_round_trip() -> Result<()> {
    let (pair, client, accepted) = established_pair()?;
    accepted.set_nonblocking(true);

    let n = client.send(b"service-centric bytes", 10)?;
    assert_eq!(n, 21);
    pair.pump(10);

    let mut buf = [0u8; 64];
    let read = accepted.recv(&mut buf, 11)?;
    assert_eq!(&buf[..read], b"service-centric bytes");

    // The other direction.
    accepted.send(b"pong", 12)?;
    pair.pump(12);

    let read = client.recv(&mut buf, 13)?;
    assert_eq!(&buf[..read], b"pong");

    Ok(())
}

#[test]
fn out_of_order_segments_reassemble() -> Result<()> {
    let (pair, client, accepted) = established_pair()?;
    accepted.set_nonblocking(true);

    // Three segments, one per send call.
    client.send(&[1u8; 100], 10)?;
    client.send(&[2u8; 100], 10)?;
    client.send(&[3u8; 100], 10)?;

    let first = pair.a.pop_outbound().unwrap();
    let second = pair.a.pop_outbound().unwrap();
    let third = pair.a.pop_outbound().unwrap();

    // Deliver 1, 3, 2.
    pair.b.handle_packet(&first.bytes, addr(1), 1, 11)?;
    pair.b.handle_packet(&third.bytes, addr(1), 1, 12)?;
    pair.b.handle_packet(&second.bytes, addr(1), 1, 13)?;
    pair.pump(14);

    let mut buf = [0u8; 512];
    let read = accepted.recv(&mut buf, 15)?;
    assert_eq!(read, 300);
    assert_eq!(&buf[..100], &[1u8; 100]);
    assert_eq!(&buf[100..200], &[2u8; 100]);
    assert_eq!(&buf[200..300], &[3u8; 100]);

    Ok(())
}

#[test]
fn resolution_miss_parks_and_retries() -> Result<()> {
    let pair = Pair::new();
    let service = sid(77);

    // No route yet: the connect must park and upcall.
    let listener = pair.b.socket();
    listener.bind(service)?;
    listener.listen()?;
    listener.set_nonblocking(true);

    let client = pair.a.socket();
    client.set_nonblocking(true);
    client.connect(service, 0)?;

    assert!(pair.a.pop_outbound().is_none());
    assert_eq!(pair.recorder_a.misses.lock().as_slice(), &[service]);

    // The resolver answers with a target entry; the parked connect goes
    // out and the handshake completes.
    pair.route_to_b(&service);
    pair.pump(1);

    assert_eq!(client.state(), SalState::Established);
    Ok(())
}

#[test]
fn sal_connect_retransmits_then_fails() -> Result<()> {
    let pair = Pair::new();
    let service = sid(9);
    pair.route_to_b(&service);

    let client = pair.a.socket();
    client.set_nonblocking(true);
    client.connect(service, 0)?;

    // Swallow the first connect; the peer never answers.
    assert!(pair.a.pop_outbound().is_some());

    let mut retransmits = 0;
    let mut now = 0;
    while now < 400_000 {
        now += 1_000;
        pair.a.on_tick(now);
        while pair.a.pop_outbound().is_some() {
            retransmits += 1;
        }

        if client.state() == SalState::Closed {
            break;
        }
    }

    // Backoff 3s/6s/12s/24s/48s/60s then failure.
    assert_eq!(retransmits, 6);
    assert_eq!(client.state(), SalState::Closed);
    assert_eq!(client.take_error(), Some(Error::TimedOut));

    Ok(())
}

#[test]
fn rto_exhaustion_resets_connection() -> Result<()> {
    let (pair, client, _accepted) = established_pair()?;

    client.send(&[0u8; 500], 1_000)?;

    // The segment goes out once; every ack is then lost.
    assert!(pair.a.pop_outbound().is_some());

    let mut retransmits = 0;
    let mut now = 1_000;
    while now < 400_000 {
        now += 500;
        pair.a.on_tick(now);
        while pair.a.pop_outbound().is_some() {
            retransmits += 1;
        }
    }

    assert_eq!(retransmits, 7);

    let mut buf = [0u8; 1];
    assert_eq!(client.recv(&mut buf, now), Err(Error::ConnectionReset));

    Ok(())
}

#[test]
fn migration_announces_new_source() -> Result<()> {
    let (pair, client, accepted) = established_pair()?;
    accepted.set_nonblocking(true);

    client.send(b"before", 10)?;
    pair.pump(10);

    let migrated = pair.a.migrate(
        &MigrateSelector::Flow(client.local_flow()),
        2,
        addr(3),
        20,
    );
    assert_eq!(migrated, 1);
    pair.pump(20);

    // The peer now addresses the migrated host.
    client.send(b"after", 30)?;
    while let Some(out) = pair.a.pop_outbound() {
        pair.b.handle_packet(&out.bytes, addr(3), 1, 30)?;
    }

    let reply = pair.b.pop_outbound().expect("ack for migrated flow");
    assert_eq!(reply.next_hop, addr(3));
    pair.a.handle_packet(&reply.bytes, addr(2), 1, 31)?;

    let mut buf = [0u8; 64];
    let mut total = accepted.recv(&mut buf, 32)?;
    while total < 11 {
        total += accepted.recv(&mut buf[total..], 32)?;
    }
    assert_eq!(&buf[..total], b"beforeafter");

    Ok(())
}

#[test]
fn close_handshake_reaches_closed() -> Result<()> {
    let (pair, client, accepted) = established_pair()?;
    accepted.set_nonblocking(true);

    client.close(100)?;
    pair.pump(100);

    // The passive side sees end of stream.
    let mut buf = [0u8; 8];
    assert_eq!(accepted.recv(&mut buf, 101)?, 0);
    assert_eq!(client.state(), SalState::FinWait2);

    accepted.close(102)?;
    pair.pump(102);

    assert_eq!(accepted.state(), SalState::Closed);
    assert_eq!(client.state(), SalState::TimeWait);

    // Two maximum segment lifetimes later the socket is gone.
    pair.a.on_tick(102 + 2 * 30_000 + 1);
    assert_eq!(client.state(), SalState::Closed);

    Ok(())
}

#[test]
fn prefix_listener_accepts_deeper_ids() -> Result<()> {
    let pair = Pair::new();

    // The listener binds a /8 prefix; the client dials one specific id
    // under it.
    let prefix = sid(0x42);
    let mut deep = [0u8; 32];
    deep[0] = 0x42;
    deep[5] = 0x99;
    let target = ServiceId::from_bytes(deep);

    pair.route_to_b(&target);

    let listener = pair.b.socket();
    listener.bind_prefix(prefix, 8)?;
    listener.listen()?;
    listener.set_nonblocking(true);

    let client = pair.a.socket();
    client.set_nonblocking(true);
    client.connect(target, 0)?;
    pair.pump(0);

    assert_eq!(client.state(), SalState::Established);
    let accepted = listener.accept()?;
    assert_eq!(accepted.state(), SalState::Established);

    // An exact bind shadows the prefix listener for its own id.
    let exact = pair.b.socket();
    exact.bind(target)?;
    exact.listen()?;
    exact.set_nonblocking(true);

    let client2 = pair.a.socket();
    client2.set_nonblocking(true);
    client2.connect(target, 1)?;
    pair.pump(1);

    assert_eq!(client2.state(), SalState::Established);
    assert!(exact.accept().is_ok());
    assert!(matches!(listener.accept(), Err(Error::WouldBlock)));

    Ok(())
}

#[test]
fn closed_flow_is_unhashed() -> Result<()> {
    let (pair, client, accepted) = established_pair()?;
    let flow = client.local_flow();

    client.close(100)?;
    pair.pump(100);
    accepted.close(101)?;
    pair.pump(101);

    // Past two maximum segment lifetimes the flow entry is gone.
    pair.a.on_tick(101 + 2 * 30_000 + 1);

    let dropped = pair.a.dropped();

    // A packet addressed at the vanished flow is dropped and counted.
    let hdr = SalHeader::data(FlowId::new(7), flow);
    let mut bytes = BytesMut::new();
    hdr.encode(&mut bytes);
    pair.a.handle_packet(&bytes, addr(2), 1, 200_000)?;

    assert_eq!(pair.a.dropped(), dropped + 1);
    Ok(())
}

#[test]
fn bind_conflicts() -> Result<()> {
    let pair = Pair::new();
    let service = sid(5);

    let first = pair.b.socket();
    first.bind(service)?;

    // A second non-listening bind of the same id is refused.
    let second = pair.b.socket();
    assert_eq!(second.bind(service), Err(Error::AddrNotAvailable));

    // Once the first is a listener, a client may bind alongside it, but
    // a second listener may not.
    first.listen()?;
    second.bind(service)?;
    assert_eq!(second.listen(), Err(Error::AddrNotAvailable));

    Ok(())
}

#[test]
fn datagram_round_trip() -> Result<()> {
    let pair = Pair::new();
    let service_b = sid(30);
    let service_a = sid(31);

    pair.a.add_route(&service_b, 256, &RouteSpec::forward(addr(2), 1));
    pair.b.add_route(&service_a, 256, &RouteSpec::forward(addr(1), 1));

    let sock_b = pair.b.dgram(service_b)?;
    sock_b.set_nonblocking(true);

    let sock_a = pair.a.dgram(service_a)?;
    sock_a.set_nonblocking(true);

    sock_a.send_to(&service_b, b"query", 0)?;
    pair.pump(0);

    let mut buf = [0u8; 64];
    let (n, from) = sock_b.recv_from(&mut buf)?;
    assert_eq!(&buf[..n], b"query");
    assert_eq!(from, service_a);

    // Reply to the learned source service.
    sock_b.send_to(&from, b"answer", 1)?;
    pair.pump(1);

    let (n, from) = sock_a.recv_from(&mut buf)?;
    assert_eq!(&buf[..n], b"answer");
    assert_eq!(from, service_b);

    Ok(())
}

#[test]
fn datagram_errors() -> Result<()> {
    let pair = Pair::new();
    let sock = pair.a.dgram(sid(1))?;

    let big = vec![0u8; 65_536];
    assert_eq!(sock.send_to(&sid(2), &big, 0), Err(Error::MessageTooLarge));

    // Unconnected send has no peer.
    assert_eq!(sock.send(b"x", 0), Err(Error::AddrRequired));

    Ok(())
}

#[test]
fn local_delivery_via_loopback() -> Result<()> {
    let pair = Pair::new();
    let service = sid(60);

    // Register the service locally; resolution demultiplexes in-process.
    pair.a.register(&service, 256, 1);

    let sock = pair.a.dgram(service)?;
    sock.set_nonblocking(true);

    let sender = pair.a.dgram(sid(61))?;
    sender.send_to(&service, b"hello self", 0)?;

    let mut buf = [0u8; 32];
    let (n, _) = sock.recv_from(&mut buf)?;
    assert_eq!(&buf[..n], b"hello self");

    Ok(())
}

#[test]
fn malformed_packets_counted_not_fatal() -> Result<()> {
    let pair = Pair::new();

    // Garbage, a truncated header, a bad version.
    assert!(pair.a.handle_packet(&[0xFF; 40], addr(2), 1, 0).is_err());
    assert!(pair.a.handle_packet(&[0x10, 0x00], addr(2), 1, 0).is_err());
    assert_eq!(pair.a.malformed(), 2);

    Ok(())
}
