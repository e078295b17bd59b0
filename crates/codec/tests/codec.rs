use anyhow::Result;
use bytes::BytesMut;
use svc_stack_codec::{
    Error, FlowId, ServiceId,
    ctrl::{
        CtrlMessage, MigrateDirective, MigrateFrom, Registration, ResolveUpcall, Retval,
        SERVICE_INFO_LEN, SERVICE_INFO_STAT_LEN, ServiceInfo, ServiceInfoStat,
    },
    sal::{SalFlags, SalHeader, SalOption},
    segment::{SegmentHeader, seg_flags},
};

fn sid(n: u8) -> ServiceId {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    bytes[31] = n;
    ServiceId::from_bytes(bytes)
}

fn info(n: u8) -> ServiceInfo {
    ServiceInfo {
        kind: 2,
        prefix_bits: 128,
        flags: 0,
        if_index: n as u32,
        priority: 1,
        weight: 3,
        idle_timeout: 60,
        hard_timeout: 3600,
        address: std::net::Ipv4Addr::new(192, 168, 1, n),
        service_id: sid(n),
    }
}

#[test]
fn sal_header_round_trip_with_all_options() -> Result<()> {
    let cases = vec![
        SalHeader::control(SalFlags::CONNECT, FlowId::new(1), FlowId::NONE)
            .with_option(SalOption::Connect {
                seqno: 0xDEAD_BEEF,
                mss: 1460,
                wscale: 7,
                caps: 0,
            })
            .with_option(SalOption::ServiceId(sid(9))),
        SalHeader::control(
            SalFlags::CONNECT | SalFlags::ACK,
            FlowId::new(2),
            FlowId::new(1),
        )
        .with_option(SalOption::ConnectAck {
            seqno: 77,
            ackno: 0xDEAD_BEF0,
            mss: 1200,
            wscale: 2,
            caps: 0,
        }),
        SalHeader::control(SalFlags::ACK, FlowId::new(1), FlowId::new(2))
            .with_option(SalOption::Ack { ackno: 78 }),
        SalHeader::control(SalFlags::FIN, FlowId::new(1), FlowId::new(2))
            .with_option(SalOption::Fin { seqno: 100 }),
        SalHeader::control(SalFlags::MIGRATE, FlowId::new(1), FlowId::new(2)).with_option(
            SalOption::Migrate {
                seqno: 101,
                addr: "172.16.0.9".parse()?,
            },
        ),
        SalHeader::data(FlowId::new(3), FlowId::new(4)),
    ];

    for header in cases {
        let mut bytes = BytesMut::new();
        header.encode(&mut bytes);

        // Length matches the declared word count and the 4-byte padding.
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(bytes.len(), header.encoded_len());

        let (decoded, len) = SalHeader::decode(&bytes)?;
        assert_eq!(len, bytes.len());
        assert_eq!(decoded, header);
    }

    Ok(())
}

#[test]
fn sal_header_rejects_corruption() {
    let header = SalHeader::control(SalFlags::CONNECT, FlowId::new(1), FlowId::NONE)
        .with_option(SalOption::Connect {
            seqno: 1,
            mss: 1460,
            wscale: 0,
            caps: 0,
        });

    let mut bytes = BytesMut::new();
    header.encode(&mut bytes);

    // Checksum failure on a flipped payload bit.
    let mut bad = bytes.clone();
    bad[6] ^= 0x40;
    assert_eq!(SalHeader::decode(&bad), Err(Error::ChecksumFailed));

    // Unknown version.
    let mut bad = bytes.clone();
    bad[0] = (9 << 4) | (bad[0] & 0x0F);
    assert_eq!(SalHeader::decode(&bad), Err(Error::UnknownVersion));

    // Declared length beyond the buffer.
    let mut bad = bytes.clone();
    bad[0] = (1 << 4) | 0x0F;
    assert!(SalHeader::decode(&bad[..bytes.len().min(20)]).is_err());

    // Truncated base header.
    assert_eq!(SalHeader::decode(&bytes[..8]), Err(Error::Malformed));
}

#[test]
fn segment_round_trip() -> Result<()> {
    let bare = SegmentHeader {
        seq: 1000,
        ack: 2000,
        flags: seg_flags::ACK,
        window: 512,
        urgent: 0,
        timestamp: None,
        unknown_options: false,
    };

    let mut bytes = BytesMut::new();
    bare.encode(&mut bytes);
    assert_eq!(bytes.len(), 16);

    let (decoded, len) = SegmentHeader::decode(&bytes)?;
    assert_eq!((decoded, len), (bare, 16));

    let stamped = SegmentHeader {
        timestamp: Some((123_456, 654_321)),
        flags: seg_flags::ACK | seg_flags::PSH,
        ..bare
    };

    let mut bytes = BytesMut::new();
    stamped.encode(&mut bytes);
    bytes.extend_from_slice(b"payload");

    let (decoded, len) = SegmentHeader::decode(&bytes)?;
    assert_eq!(decoded, stamped);
    assert_eq!(&bytes[len..], b"payload");

    Ok(())
}

#[test]
fn segment_unknown_options_flagged() -> Result<()> {
    let stamped = SegmentHeader {
        seq: 1,
        ack: 2,
        flags: seg_flags::ACK,
        window: 64,
        urgent: 0,
        timestamp: Some((3, 4)),
        unknown_options: false,
    };

    let mut bytes = BytesMut::new();
    stamped.encode(&mut bytes);

    // Corrupt the aligned-timestamp marker: still parseable, but the
    // receiver must take the slow path.
    bytes[16] = 0x42;
    let (decoded, _) = SegmentHeader::decode(&bytes)?;
    assert!(decoded.unknown_options);
    assert_eq!(decoded.timestamp, None);

    Ok(())
}

#[test]
fn service_info_exact_sizes() {
    let mut bytes = BytesMut::new();
    info(1).encode(&mut bytes);
    assert_eq!(bytes.len(), SERVICE_INFO_LEN);

    let stat = ServiceInfoStat {
        info: info(1),
        duration_sec: 1,
        duration_nsec: 2,
        packets_resolved: 3,
        bytes_resolved: 4,
        packets_dropped: 5,
        bytes_dropped: 6,
        tokens_consumed: 7,
    };

    let mut bytes = BytesMut::new();
    stat.encode(&mut bytes);
    assert_eq!(bytes.len(), SERVICE_INFO_STAT_LEN);
}

#[test]
fn ctrl_messages_byte_identical_round_trip() -> Result<()> {
    let cases: Vec<CtrlMessage> = vec![
        CtrlMessage::Register(Registration {
            reregister: false,
            prefix_bits: 255,
            srvid_flags: 0,
            address: "10.1.2.3".parse()?,
            service_id: sid(1),
        }),
        CtrlMessage::Unregister(Registration {
            reregister: true,
            prefix_bits: 16,
            srvid_flags: 1,
            address: "10.1.2.4".parse()?,
            service_id: sid(2),
        }),
        CtrlMessage::Resolve(ResolveUpcall {
            src_flags: 0,
            src_prefix_bits: 255,
            dst_flags: 0,
            dst_prefix_bits: 255,
            src_service: sid(3),
            dst_service: sid(4),
            src_address: "10.0.0.1".parse()?,
        }),
        CtrlMessage::AddService(vec![info(1), info(2), info(3)]),
        CtrlMessage::DelService(vec![info(1)]),
        CtrlMessage::ModService(vec![info(2)]),
        CtrlMessage::GetService(vec![]),
        CtrlMessage::ServiceStat(vec![ServiceInfoStat {
            info: info(5),
            duration_sec: 10,
            duration_nsec: 0,
            packets_resolved: 100,
            bytes_resolved: 4_000,
            packets_dropped: 1,
            bytes_dropped: 40,
            tokens_consumed: 0,
        }]),
        CtrlMessage::Capabilities(1),
        CtrlMessage::Migrate(MigrateDirective {
            from: MigrateFrom::Interface("eth0".into()),
            to_interface: "wlan0".into(),
        }),
        CtrlMessage::Migrate(MigrateDirective {
            from: MigrateFrom::Flow(FlowId::new(0xAABBCCDD)),
            to_interface: "eth1".into(),
        }),
        CtrlMessage::Migrate(MigrateDirective {
            from: MigrateFrom::Service(sid(6)),
            to_interface: "eth2".into(),
        }),
    ];

    for (xid, message) in cases.into_iter().enumerate() {
        let mut bytes = BytesMut::new();
        message.encode(xid as u32, Retval::Ok, &mut bytes);

        let (decoded, got_xid, retval) = CtrlMessage::decode(&bytes)?;
        assert_eq!(decoded, message);
        assert_eq!(got_xid, xid as u32);
        assert_eq!(retval, Retval::Ok);

        // Encode-then-decode-then-encode is byte identical.
        let mut again = BytesMut::new();
        decoded.encode(xid as u32, Retval::Ok, &mut again);
        assert_eq!(bytes, again);
    }

    Ok(())
}

#[test]
fn ctrl_decode_rejects_malformed() {
    // Unknown type.
    assert!(CtrlMessage::decode(&[99, 0, 8, 0, 0, 0, 0, 0]).is_err());

    // Length beyond the buffer.
    assert!(CtrlMessage::decode(&[8, 0, 200, 0, 0, 0, 0, 0]).is_err());

    // A service array whose payload is not a multiple of 60.
    let mut bytes = BytesMut::new();
    CtrlMessage::AddService(vec![info(1)]).encode(1, Retval::Ok, &mut bytes);
    assert!(CtrlMessage::decode(&bytes[..bytes.len() - 4]).is_err());
}
