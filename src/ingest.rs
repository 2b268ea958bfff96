/// Multicast datagram receiver.
///
/// Joins the group on the given interface and hands every datagram to a
/// [`PacketHandler`]. The socket uses a short read timeout so the loop can
/// notice the stop flag.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{RelayError, RelayResult};
use crate::pipeline::PacketHandler;

/// Largest UDP payload, so no datagram is ever cut short.
const RECV_BUFFER: usize = 65_536;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct MulticastReceiver {
    socket: UdpSocket,
    group: SocketAddr,
}

impl MulticastReceiver {
    pub fn join(group: Ipv4Addr, port: u16, interface: Ipv4Addr) -> RelayResult<Self> {
        let addr = SocketAddr::V4(SocketAddrV4::new(group, port));
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        socket
            .join_multicast_v4(&group, &interface)
            .map_err(|source| RelayError::JoinFailed { group: addr, source })?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        info!("listening on {addr} via {interface}");
        Ok(Self { socket, group: addr })
    }

    /// Wrap an already bound socket (unicast works too).
    pub fn from_socket(socket: UdpSocket) -> RelayResult<Self> {
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let group = socket.local_addr()?;
        Ok(Self { socket, group })
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive until `stop` is set or the handler shuts down. Returns the
    /// number of datagrams handed over.
    pub fn run(&self, handler: &dyn PacketHandler, stop: &AtomicBool) -> u64 {
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut delivered = 0u64;
        while !stop.load(Ordering::Acquire) {
            let len = match self.socket.recv(&mut buf) {
                Ok(0) => continue,
                Ok(len) => len,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(group = %self.group, "receive error: {e}");
                    continue;
                }
            };
            match handler.handle(buf[..len].to_vec()) {
                Ok(()) => delivered += 1,
                Err(RelayError::ShutDown) => break,
                // Framing errors are already counted and logged downstream.
                Err(_) => delivered += 1,
            }
        }
        info!(group = %self.group, delivered, "receiver stopped");
        delivered
    }
}
