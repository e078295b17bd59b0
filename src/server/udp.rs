use super::Ports;
use crate::statistics::{Stats, StatisticsReporter};

use std::{io::ErrorKind::ConnectionReset, net::IpAddr, sync::Arc};

use anyhow::Result;
use service::Stack;
use tokio::net::UdpSocket;

/// Packet port worker: read frames, run them through the stack's demux,
/// and flush whatever the stack wants on the wire in response.
pub async fn processor(
    stack: Stack,
    socket: Arc<UdpSocket>,
    ports: Arc<Ports>,
    reporter: StatisticsReporter,
    if_index: u32,
    mtu: usize,
) -> Result<()> {
    let mut buf = vec![0u8; mtu.max(codec::sal::MAX_LEN)];

    loop {
        let (size, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                // A peer shutting down surfaces here on some platforms;
                // the port itself is fine.
                if err.kind() != ConnectionReset {
                    return Err(err.into());
                }
                continue;
            }
        };

        reporter.send(&[Stats::ReceivedPkts(1), Stats::ReceivedBytes(size)]);
        log::trace!(
            "packet port receive: size={}, addr={:?}, if_index={}",
            size,
            addr,
            if_index
        );

        let IpAddr::V4(src) = addr.ip() else {
            reporter.send(&[Stats::ErrorPkts(1)]);
            continue;
        };

        // Anything shorter than a SAL base header cannot be ours.
        if size < codec::sal::BASE_LEN
            || stack
                .handle_packet(&buf[..size], src, if_index, crate::now_ms())
                .is_err()
        {
            reporter.send(&[Stats::ErrorPkts(1)]);
            continue;
        }

        // Flush responses produced inline by the demux.
        while let Some(out) = stack.pop_outbound() {
            let Some(tx) = ports.get(out.if_index) else {
                continue;
            };

            match tx.send_to(&out.bytes, ports.destination(out.next_hop)).await {
                Ok(sent) => {
                    reporter.send(&[Stats::SendPkts(1), Stats::SendBytes(sent)]);
                }
                Err(err) => {
                    reporter.send(&[Stats::ErrorPkts(1)]);
                    log::warn!("packet port send to {} failed: {}", out.next_hop, err);
                }
            }
        }
    }
}
