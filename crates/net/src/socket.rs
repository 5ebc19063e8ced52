use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::protocol::MAX_PACKET_SIZE;
use crate::stats::{NetworkStats, PacketLossSimulation};

/// Destination for encoded datagrams.
///
/// Connections only ever write through this trait, which keeps the state
/// machine independent of the real socket.
pub trait PacketSink {
    fn send_datagram(&mut self, addr: SocketAddr, data: &[u8]);
}

/// Records datagrams in memory.
impl PacketSink for Vec<(SocketAddr, Vec<u8>)> {
    fn send_datagram(&mut self, addr: SocketAddr, data: &[u8]) {
        self.push((addr, data.to_vec()));
    }
}

/// Non-blocking UDP socket shared by a client or server and its STUN probe.
pub struct NetSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: NetworkStats,
    loss: PacketLossSimulation,
    recv_buffer: [u8; MAX_PACKET_SIZE],
}

impl NetSocket {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            stats: NetworkStats::default(),
            loss: PacketLossSimulation::default(),
            recv_buffer: [0u8; MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn set_packet_loss(&mut self, loss: PacketLossSimulation) {
        self.loss = loss;
    }

    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Packet exceeds MTU",
            ));
        }

        if self.loss.should_drop() {
            self.stats.packets_dropped += 1;
            return Ok(data.len());
        }

        let bytes = self.socket.send_to(data, addr)?;
        self.stats.record_sent(bytes);
        Ok(bytes)
    }

    /// Next pending datagram, or `None` when the socket would block.
    pub fn recv_from(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    self.stats.record_received(size);
                    return Ok(Some((self.recv_buffer[..size].to_vec(), addr)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP port unreachable surfaces here on some platforms
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Blocks until a datagram is readable or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        if timeout.is_zero() {
            return Ok(false);
        }
        self.socket.set_nonblocking(false)?;
        self.socket.set_read_timeout(Some(timeout))?;
        let mut probe = [0u8; 1];
        let result = match self.socket.peek_from(&mut probe) {
            Ok(_) => Ok(true),
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(false)
            }
            // a truncated peek still means data is ready
            Err(ref e) if e.raw_os_error().is_some() => Ok(true),
            Err(e) => Err(e),
        };
        self.socket.set_read_timeout(None)?;
        self.socket.set_nonblocking(true)?;
        result
    }
}

impl PacketSink for NetSocket {
    fn send_datagram(&mut self, addr: SocketAddr, data: &[u8]) {
        if let Err(e) = self.send_to(data, addr) {
            log::warn!("Failed to send {} bytes to {}: {}", data.len(), addr, e);
        }
    }
}
