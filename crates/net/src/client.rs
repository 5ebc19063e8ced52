use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec::Codec;
use crate::config::ClientConfig;
use crate::connection::{ConnState, Io, NetConnection};
use crate::error::{NetError, Result};
use crate::protocol::{
    CTRL_TOKEN, ChunkFlags, MAX_PAYLOAD, PacketFlags, SecurityToken, SendFlags,
};
use crate::socket::NetSocket;
use crate::stats::NetworkStats;
use crate::stun::{Connectivity, IpFamily, Stun};
use crate::token_cache::TokenCache;
use crate::unpacker::{NetChunk, RecvUnpacker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Offline,
    Connecting,
    Online,
}

/// Client endpoint: one socket, one connection to a server, plus the
/// connectionless helpers sharing that socket.
pub struct NetClient {
    socket: NetSocket,
    codec: Arc<Codec>,
    connection: NetConnection,
    unpacker: RecvUnpacker,
    token_cache: TokenCache,
    stun: Stun,
}

impl NetClient {
    pub fn open(bind: SocketAddr, codec: Arc<Codec>, config: ClientConfig) -> Result<Self> {
        let mut socket = NetSocket::bind(bind).map_err(|source| NetError::Bind {
            addr: bind.to_string(),
            source,
        })?;
        if let Some(loss) = config.packet_loss.clone() {
            socket.set_packet_loss(loss);
        }
        log::info!("Client bound to {}", socket.local_addr());

        Ok(Self {
            socket,
            codec,
            connection: NetConnection::new(config.conn.clone()),
            unpacker: RecvUnpacker::new(),
            token_cache: TokenCache::new(
                SecurityToken::random(),
                config.token_packet_expiry,
                config.token_address_expiry,
            ),
            stun: Stun::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn socket_stats(&self) -> &NetworkStats {
        self.socket.stats()
    }

    pub fn connection(&self) -> &NetConnection {
        &self.connection
    }

    /// Sends CONNECT to every address; the first to answer becomes the server.
    pub fn connect(&mut self, addrs: &[SocketAddr]) -> Result<()> {
        let mut io = Io::new(&self.codec, &mut self.socket, Instant::now());
        self.connection.connect(&mut io, addrs)?;
        log::info!("Connecting to {:?}", addrs);
        Ok(())
    }

    pub fn connect_sixup(&mut self, addr: SocketAddr) -> Result<()> {
        let mut io = Io::new(&self.codec, &mut self.socket, Instant::now());
        self.connection.connect_sixup(&mut io, addr)?;
        log::info!("Connecting to {} (sixup)", addr);
        Ok(())
    }

    pub fn disconnect(&mut self, reason: &str) {
        let mut io = Io::new(&self.codec, &mut self.socket, Instant::now());
        self.connection.disconnect(&mut io, reason);
        self.unpacker.clear();
    }

    pub fn update(&mut self) {
        let now = Instant::now();
        let mut io = Io::new(&self.codec, &mut self.socket, now);
        self.connection.update(&mut io);
        if self.connection.state() == ConnState::Error {
            let reason = self.connection.error_string().to_string();
            log::info!("Connection error: {}", reason);
            self.connection.disconnect(&mut io, &reason);
            self.unpacker.clear();
        }

        self.token_cache.update(now);
        self.stun.update(&mut self.socket, now);
    }

    /// Next chunk for the application, or `None` once the socket is drained.
    pub fn recv(&mut self) -> Result<Option<NetChunk>> {
        loop {
            if self.unpacker.is_active() {
                if let Some(chunk) = self.unpacker.fetch_chunk(Some(&mut self.connection)) {
                    return Ok(Some(chunk));
                }
            }

            let Some((data, addr)) = self.socket.recv_from()? else {
                return Ok(None);
            };
            let now = Instant::now();

            if self.stun.on_packet(addr, &data, now) {
                continue;
            }

            let mut packet = match self.codec.unpack(&data, self.connection.is_sixup()) {
                Ok(packet) => packet,
                Err(e) => {
                    log::debug!("Dropping datagram from {}: {}", addr, e);
                    continue;
                }
            };

            if packet.is_connless() {
                if packet.sixup {
                    if packet.security_token != self.token_cache.our_token() {
                        log::debug!("Connless packet from {} with wrong token", addr);
                        continue;
                    }
                    let mut io = Io::new(&self.codec, &mut self.socket, now);
                    self.token_cache
                        .add_token(&mut io, addr, packet.response_token);
                }

                let response_token = packet.sixup.then_some(packet.response_token);
                let mut chunk = NetChunk::connless(addr, packet.data);
                chunk.response_token = response_token;
                if packet.flags.contains(PacketFlags::EXTENDED) {
                    chunk.flags |= SendFlags::EXTENDED;
                    chunk.extra = Some(packet.extra);
                }
                return Ok(Some(chunk));
            }

            if packet.sixup
                && packet.control_msg() == Some(CTRL_TOKEN)
                && packet.security_token == self.token_cache.our_token()
            {
                let mut io = Io::new(&self.codec, &mut self.socket, now);
                self.token_cache
                    .add_token(&mut io, addr, packet.response_token);
                continue;
            }

            if matches!(self.connection.state(), ConnState::Offline | ConnState::Error) {
                continue;
            }

            let mut io = Io::new(&self.codec, &mut self.socket, now);
            if self
                .connection
                .feed(&mut io, &mut packet, addr, SecurityToken::UNKNOWN)
                && !packet.is_control()
            {
                let sixup = packet.sixup;
                self.unpacker.start(addr, packet, None, sixup);
            }
        }
    }

    pub fn send(&mut self, chunk: &NetChunk) -> Result<()> {
        if chunk.data.len() >= MAX_PAYLOAD {
            return Err(NetError::PayloadTooLarge(chunk.data.len()));
        }

        if chunk.is_connless() {
            let extra = if chunk.flags.contains(SendFlags::EXTENDED) {
                Some(chunk.extra.unwrap_or_default())
            } else {
                None
            };
            let bytes = Codec::pack_connless(&chunk.data, extra)?;
            self.socket.send_to(&bytes, chunk.addr)?;
            return Ok(());
        }

        let flags = if chunk.is_vital() {
            ChunkFlags::VITAL
        } else {
            ChunkFlags::empty()
        };
        let mut io = Io::new(&self.codec, &mut self.socket, Instant::now());
        self.connection.queue_chunk(&mut io, flags, &chunk.data)?;
        if chunk.flags.contains(SendFlags::FLUSH) {
            self.connection.flush(&mut io);
        }
        Ok(())
    }

    /// Connectionless send to a sixup peer, fetching its token first if needed.
    pub fn send_connless_sixup(&mut self, addr: SocketAddr, data: &[u8]) -> Result<()> {
        let mut io = Io::new(&self.codec, &mut self.socket, Instant::now());
        self.token_cache.send_packet_connless(&mut io, addr, data)
    }

    pub fn flush(&mut self) -> usize {
        let mut io = Io::new(&self.codec, &mut self.socket, Instant::now());
        self.connection.flush(&mut io)
    }

    pub fn state(&self) -> ClientState {
        match self.connection.state() {
            ConnState::Offline | ConnState::Error => ClientState::Offline,
            ConnState::Online => ClientState::Online,
            ConnState::WantToken | ConnState::Connect | ConnState::Pending => {
                ClientState::Connecting
            }
        }
    }

    pub fn got_problems(&self, max_latency: Duration) -> bool {
        self.connection.state() == ConnState::Online
            && self.connection.got_problems(max_latency, Instant::now())
    }

    pub fn error_string(&self) -> &str {
        self.connection.error_string()
    }

    pub fn reset_error_string(&mut self) {
        self.connection.reset_error_string();
    }

    pub fn security_token_unknown(&self) -> bool {
        self.connection.security_token() == SecurityToken::UNKNOWN
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        self.connection.peer_addr()
    }

    pub fn feed_stun_server(&mut self, addr: SocketAddr) {
        self.stun.feed_stun_server(addr, Instant::now());
    }

    pub fn refresh_stun(&mut self) {
        self.stun.refresh(Instant::now());
    }

    pub fn connectivity(&self, family: IpFamily) -> (Connectivity, Option<SocketAddr>) {
        self.stun.connectivity(family, Instant::now())
    }

    /// Blocks until a datagram arrives or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        Ok(self.socket.wait(timeout)?)
    }
}
