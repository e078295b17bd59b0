use std::net::Ipv4Addr;

use anyhow::Result;
use bytes::BytesMut;
use codec::{
    ServiceId,
    ctrl::{CtrlMessage, Retval, ServiceInfo},
};
use service::{Stack, StackConfig, StackHandler, StackOptions};
use svc_stack::{config::Config, ctrl::handle_request};

#[derive(Default, Clone)]
struct NullHandler;

impl StackHandler for NullHandler {}

fn test_stack() -> Stack {
    Stack::new(StackOptions {
        config: StackConfig::default(),
        local_addr: Ipv4Addr::new(127, 0, 0, 1),
        capabilities: 1,
        handler: NullHandler,
    })
}

fn sid(n: u8) -> ServiceId {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    ServiceId::from_bytes(bytes)
}

fn info(n: u8, weight: u32) -> ServiceInfo {
    ServiceInfo {
        kind: 2,
        prefix_bits: 8,
        flags: 0,
        if_index: 1,
        priority: 0,
        weight,
        idle_timeout: 0,
        hard_timeout: 0,
        address: Ipv4Addr::new(10, 0, 0, n),
        service_id: sid(n),
    }
}

fn roundtrip(config: &Config, stack: &Stack, message: CtrlMessage) -> (CtrlMessage, Retval) {
    let mut request = BytesMut::new();
    message.encode(7, Retval::Ok, &mut request);

    let reply = handle_request(config, stack, &request).expect("a reply");
    let (decoded, xid, retval) = CtrlMessage::decode(&reply).expect("parseable reply");
    assert_eq!(xid, 7);

    (decoded, retval)
}

#[test]
fn config_parses_json5_with_defaults() -> Result<()> {
    let config: Config = serde_json5::from_str(
        r#"{
            // A single packet port.
            interfaces: [
                { name: "eth0", listen: "10.0.0.1:7472", "if-index": 1 },
            ],
            ctrl: { transit: true },
            log: { level: "debug" },
        }"#,
    )?;

    assert_eq!(config.interfaces.len(), 1);
    assert_eq!(config.interfaces[0].mtu, 1500);
    assert_eq!(config.port, 7472);
    assert!(config.ctrl.transit);
    assert_eq!(config.local_addr(), Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(config.if_index_by_name("eth0"), Some(1));
    assert_eq!(config.addr_by_if_index(1), Some(Ipv4Addr::new(10, 0, 0, 1)));

    Ok(())
}

#[test]
fn add_get_del_service_flow() {
    let config = Config::default();
    let stack = test_stack();

    // Two instances of the same service behind different next hops.
    let primary = info(1, 3);
    let mut secondary = info(1, 1);
    secondary.address = Ipv4Addr::new(10, 0, 0, 99);

    let (_, retval) = roundtrip(
        &config,
        &stack,
        CtrlMessage::AddService(vec![primary, secondary]),
    );
    assert_eq!(retval, Retval::Ok);

    // get_service answers in add_service shape.
    let (reply, retval) = roundtrip(&config, &stack, CtrlMessage::GetService(vec![]));
    assert_eq!(retval, Retval::Ok);
    match reply {
        CtrlMessage::AddService(services) => {
            assert_eq!(services.len(), 2);
            assert_eq!(services[0].service_id, sid(1));
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    // Delete one instance by its next-hop selector.
    let (_, retval) = roundtrip(&config, &stack, CtrlMessage::DelService(vec![primary]));
    assert_eq!(retval, Retval::Ok);

    let (reply, _) = roundtrip(&config, &stack, CtrlMessage::GetService(vec![]));
    match reply {
        CtrlMessage::AddService(services) => assert_eq!(services.len(), 1),
        other => panic!("unexpected reply: {:?}", other),
    }

    // Deleting an absent entry reports no-entry.
    let (_, retval) = roundtrip(&config, &stack, CtrlMessage::DelService(vec![info(9, 1)]));
    assert_eq!(retval, Retval::NoEntry);
}

#[test]
fn mod_service_requires_existing_entry() {
    let config = Config::default();
    let stack = test_stack();

    let (_, retval) = roundtrip(&config, &stack, CtrlMessage::ModService(vec![info(1, 5)]));
    assert_eq!(retval, Retval::NoEntry);

    roundtrip(&config, &stack, CtrlMessage::AddService(vec![info(1, 5)]));

    let mut updated = info(1, 9);
    updated.idle_timeout = 60;
    let (_, retval) = roundtrip(&config, &stack, CtrlMessage::ModService(vec![updated]));
    assert_eq!(retval, Retval::Ok);
}

#[test]
fn service_stat_reports_counters() {
    let config = Config::default();
    let stack = test_stack();

    roundtrip(&config, &stack, CtrlMessage::AddService(vec![info(4, 1)]));

    // Resolving on behalf of a datagram send charges the entry.
    let sender = stack.dgram(sid(200)).unwrap();
    sender.send_to(&sid(4), b"count me", 0).unwrap();

    let (reply, retval) = roundtrip(&config, &stack, CtrlMessage::ServiceStat(vec![]));
    assert_eq!(retval, Retval::Ok);

    match reply {
        CtrlMessage::ServiceStat(stats) => {
            assert_eq!(stats.len(), 1);
            assert_eq!(stats[0].packets_resolved, 1);
            assert!(stats[0].bytes_resolved > 0);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[test]
fn capabilities_reports_transit() {
    let config = Config::default();
    let stack = test_stack();

    let (reply, retval) = roundtrip(&config, &stack, CtrlMessage::Capabilities(0));
    assert_eq!(retval, Retval::Ok);
    assert_eq!(reply, CtrlMessage::Capabilities(1));
}

#[test]
fn malformed_request_gets_malformed_retval() {
    let config = Config::default();
    let stack = test_stack();

    let reply = handle_request(&config, &stack, &[3, 0, 200, 0, 1, 2, 3, 4]).unwrap();
    assert_eq!(reply[1], Retval::Malformed as u8);
}
