// UDP ingestion loop - socket management and dispatch for Art-Net and sACN

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::Protocol;
use crate::network::artnet::{parse_artnet_packet, ArtnetPacket};
use crate::network::sacn::{parse_sacn_packet, SacnPacket};
use crate::CoreShared;

const RX_BUFFER_SIZE: usize = 1536;
/// Upper bound on the multiplexed wait, also the timeout-sweep cadence
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Per-socket drain bound per wake so one busy protocol cannot starve the
/// other
const MAX_DATAGRAMS_PER_WAKE: usize = 32;

/// The two listener sockets; either may be absent after a bind failure.
pub(crate) struct IngestSockets {
    pub artnet: Option<Arc<UdpSocket>>,
    pub sacn: Option<Arc<UdpSocket>>,
}

impl IngestSockets {
    pub fn any_bound(&self) -> bool {
        self.artnet.is_some() || self.sacn.is_some()
    }
}

/// Bind a non-blocking reusable UDP socket on all interfaces.
fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true)?;

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(socket)
}

/// Bring up both listeners. A single bind failure degrades that protocol
/// and is counted; the caller decides what an empty result means.
pub(crate) fn bind_sockets(
    artnet_port: u16,
    sacn_port: u16,
    shared: &CoreShared,
) -> IngestSockets {
    let artnet = match bind_udp(artnet_port) {
        Ok(socket) => {
            if let Err(e) = socket.set_broadcast(true) {
                warn!("failed to enable broadcast receive: {}", e);
            }
            info!("[Art-Net] listening on 0.0.0.0:{}", artnet_port);
            Some(Arc::new(socket))
        }
        Err(e) => {
            warn!("[Art-Net] bind failed on port {}: {}", artnet_port, e);
            shared.metrics.inc_socket_error();
            None
        }
    };

    let sacn = match bind_udp(sacn_port) {
        Ok(socket) => {
            info!("[sACN] listening on 0.0.0.0:{} (multicast)", sacn_port);
            Some(Arc::new(socket))
        }
        Err(e) => {
            warn!("[sACN] bind failed on port {}: {}", sacn_port, e);
            shared.metrics.inc_socket_error();
            None
        }
    };

    IngestSockets { artnet, sacn }
}

async fn readable_opt(socket: &Option<Arc<UdpSocket>>) -> io::Result<()> {
    match socket {
        Some(socket) => socket.readable().await,
        None => std::future::pending().await,
    }
}

/// The ingestion worker: multiplex both sockets with a 100 ms timeout,
/// drain, parse, route, merge, then sweep source timeouts.
pub(crate) async fn run(
    shared: Arc<CoreShared>,
    sockets: IngestSockets,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = [0u8; RX_BUFFER_SIZE];
    info!("ingestion loop started");

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(POLL_TIMEOUT) => {}
            result = readable_opt(&sockets.artnet) => match result {
                Ok(()) => {
                    if let Some(socket) = &sockets.artnet {
                        drain_artnet(&shared, socket, &mut buf);
                    }
                }
                Err(e) => {
                    warn!("[Art-Net] socket error: {}", e);
                    shared.metrics.inc_socket_error();
                }
            },
            result = readable_opt(&sockets.sacn) => match result {
                Ok(()) => {
                    if let Some(socket) = &sockets.sacn {
                        drain_sacn(&shared, socket, &mut buf);
                    }
                }
                Err(e) => {
                    warn!("[sACN] socket error: {}", e);
                    shared.metrics.inc_socket_error();
                }
            },
        }

        shared.merge.sweep_timeouts(shared.clock.now_ms());
    }

    // Leave every joined group before the sockets close; the desired set
    // survives for the next start
    shared.multicast.leave_all();
    shared.multicast.clear_socket();
    info!("ingestion loop exiting");
}

fn drain_artnet(shared: &CoreShared, socket: &UdpSocket, buf: &mut [u8]) {
    for _ in 0..MAX_DATAGRAMS_PER_WAKE {
        match socket.try_recv_from(buf) {
            Ok((len, src)) => handle_artnet(shared, &buf[..len], src),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("[Art-Net] receive error: {}", e);
                shared.metrics.inc_socket_error();
                break;
            }
        }
    }
}

fn drain_sacn(shared: &CoreShared, socket: &UdpSocket, buf: &mut [u8]) {
    for _ in 0..MAX_DATAGRAMS_PER_WAKE {
        match socket.try_recv_from(buf) {
            Ok((len, src)) => handle_sacn(shared, &buf[..len], src),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("[sACN] receive error: {}", e);
                shared.metrics.inc_socket_error();
                break;
            }
        }
    }
}

fn handle_artnet(shared: &CoreShared, datagram: &[u8], src: SocketAddr) {
    match parse_artnet_packet(datagram) {
        Ok(ArtnetPacket::Dmx(dmx)) => {
            let routes = shared.routes();
            match routes.find_port(Protocol::ArtNet, dmx.universe) {
                Some(port) => {
                    shared
                        .merge
                        .ingest(port, dmx.data, 0, src.ip(), shared.clock.now_ms());
                }
                None => trace!("no output port for art-net universe {}", dmx.universe),
            }
        }
        Ok(ArtnetPacket::Ignored(opcode)) => {
            trace!("ignoring art-net opcode {:#06x}", opcode);
        }
        Err(e) => {
            shared.metrics.inc_malformed_artnet();
            debug!("malformed art-net packet from {}: {}", src, e);
        }
    }
}

fn handle_sacn(shared: &CoreShared, datagram: &[u8], src: SocketAddr) {
    match parse_sacn_packet(datagram) {
        Ok(SacnPacket::Dmx(dmx)) => {
            let routes = shared.routes();
            match routes.find_port(Protocol::Sacn, dmx.universe) {
                Some(port) => {
                    shared.merge.ingest(
                        port,
                        dmx.data,
                        dmx.priority,
                        src.ip(),
                        shared.clock.now_ms(),
                    );
                }
                None => trace!("no output port for sacn universe {}", dmx.universe),
            }
        }
        Ok(SacnPacket::Ignored) => {}
        Err(e) => {
            shared.metrics.inc_malformed_sacn();
            debug!("malformed sacn packet from {}: {}", src, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_udp_is_nonblocking_and_reusable() {
        let socket = bind_udp(0).unwrap();
        let port = socket.local_addr().unwrap().port();
        assert_ne!(port, 0);

        // try_recv_from on an empty queue reports WouldBlock instead of
        // hanging
        let mut buf = [0u8; 64];
        let err = socket.try_recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
