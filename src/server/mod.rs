mod udp;

use crate::{config::Config, statistics::Statistics};

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use service::Stack;
use tokio::net::UdpSocket;

/// Shared view of every bound packet port, for outbound dispatch by
/// interface index.
pub struct Ports {
    sockets: HashMap<u32, Arc<UdpSocket>>,
    port: u16,
}

impl Ports {
    /// The socket to transmit on for an interface index, falling back to
    /// any port when the index is unknown.
    pub fn get(&self, if_index: u32) -> Option<&Arc<UdpSocket>> {
        self.sockets
            .get(&if_index)
            .or_else(|| self.sockets.values().next())
    }

    /// Peers listen on the shared stack port.
    pub fn destination(&self, next_hop: std::net::Ipv4Addr) -> SocketAddr {
        SocketAddr::from((next_hop, self.port))
    }
}

/// Bind every configured packet port and start its worker tasks, plus
/// the timer/outbound pump.
pub async fn start(config: &Arc<Config>, stack: &Stack, statistics: &Statistics) -> Result<()> {
    let mut sockets = HashMap::with_capacity(config.interfaces.len());

    for interface in &config.interfaces {
        let socket = Arc::new(UdpSocket::bind(interface.listen).await?);
        statistics.register(interface.if_index);
        sockets.insert(interface.if_index, socket);
    }

    let ports = Arc::new(Ports {
        sockets,
        port: config.port,
    });

    for interface in &config.interfaces {
        let socket = ports.get(interface.if_index).expect("just bound").clone();

        for _ in 0..config.max_threads {
            tokio::spawn(udp::processor(
                stack.clone(),
                socket.clone(),
                ports.clone(),
                statistics.get_reporter(interface.if_index),
                interface.if_index,
                interface.mtu,
            ));
        }

        log::info!(
            "packet port up: {} ({}) listening {}",
            interface.name,
            interface.if_index,
            interface.listen
        );
    }

    tokio::spawn(pump(stack.clone(), ports));
    log::info!("stack workers per port: {}", config.max_threads);

    Ok(())
}

// Drives socket timers and flushes whatever the tick produced (acks,
// retransmissions, control packets).
async fn pump(stack: Stack, ports: Arc<Ports>) {
    let mut interval = tokio::time::interval(Duration::from_millis(10));

    loop {
        interval.tick().await;
        stack.on_tick(crate::now_ms());

        while let Some(out) = stack.pop_outbound() {
            let Some(socket) = ports.get(out.if_index) else {
                continue;
            };

            if let Err(err) = socket.send_to(&out.bytes, ports.destination(out.next_hop)).await {
                log::warn!("outbound send to {} failed: {}", out.next_hop, err);
            }
        }
    }
}
