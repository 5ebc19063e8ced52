//! Server endpoint: one socket, a fixed table of connection slots and the
//! stateless token handshake that guards slot allocation.
//!
//! Peers never get a slot before proving they can receive traffic at their
//! source address. Token-aware peers echo a token derived from their IP;
//! legacy peers go through the [`vanilla`] handshake instead.

mod connlimit;
pub mod vanilla;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub use connlimit::ConnLimiter;
use vanilla::FloodGuard;

use crate::codec::{Codec, PacketConstruct};
use crate::config::ServerConfig;
use crate::connection::{ConnState, Io, NetConnection};
use crate::error::{NetError, Result};
use crate::netban::SharedBans;
use crate::protocol::{
    CTRL_ACCEPT, CTRL_CLOSE, CTRL_CONNECT, CTRL_CONNECTACCEPT, CTRL_TOKEN, ChunkFlags,
    MAX_CLIENTS, MAX_PAYLOAD, PacketFlags, SECURITY_TOKEN_MAGIC, SecurityToken, SendFlags,
    TOKEN_REQUEST_DATA_SIZE,
};
use crate::socket::{NetSocket, PacketSink};
use crate::stats::NetworkStats;
use crate::unpacker::{NetChunk, RecvUnpacker};

const TOKEN_SIZE: usize = 4;
const SEED_SIZE: usize = 16;

/// Callbacks into the game layer when slots change hands.
pub trait ServerHooks {
    fn new_client(&mut self, client_id: usize, sixup: bool);
    /// A legacy client passed the anti-spoof handshake and skips auth.
    fn new_client_noauth(&mut self, client_id: usize);
    fn client_rejoin(&mut self, client_id: usize);
    fn del_client(&mut self, client_id: usize, reason: &str);
}

pub struct NetServer {
    socket: NetSocket,
    codec: Arc<Codec>,
    config: ServerConfig,
    slots: Vec<NetConnection>,
    unpacker: RecvUnpacker,
    bans: Option<SharedBans>,
    seed: [u8; SEED_SIZE],
    global_token: SecurityToken,
    connlimit: ConnLimiter,
    flood: FloodGuard,
}

impl NetServer {
    pub fn open(
        bind: SocketAddr,
        codec: Arc<Codec>,
        mut config: ServerConfig,
        bans: Option<SharedBans>,
    ) -> Result<Self> {
        let mut socket = NetSocket::bind(bind).map_err(|source| NetError::Bind {
            addr: bind.to_string(),
            source,
        })?;
        if let Some(loss) = config.packet_loss.clone() {
            socket.set_packet_loss(loss);
        }
        config.max_clients = config.max_clients.clamp(1, MAX_CLIENTS);

        let seed: [u8; SEED_SIZE] = rand::random();
        let slots = (0..config.max_clients)
            .map(|_| NetConnection::new(config.conn.clone()))
            .collect();
        log::info!(
            "Server listening on {} ({} slots)",
            socket.local_addr(),
            config.max_clients
        );

        Ok(Self {
            socket,
            codec,
            slots,
            unpacker: RecvUnpacker::new(),
            bans,
            seed,
            global_token: derive_token(&seed, None),
            connlimit: ConnLimiter::new(),
            flood: FloodGuard::default(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn socket_stats(&self) -> &NetworkStats {
        self.socket.stats()
    }

    pub fn max_clients(&self) -> usize {
        self.slots.len()
    }

    pub fn set_max_clients_per_ip(&mut self, max: usize) {
        self.config.max_clients_per_ip = max.clamp(1, MAX_CLIENTS);
    }

    pub fn slot(&self, client_id: usize) -> Option<&NetConnection> {
        self.slots.get(client_id)
    }

    pub fn client_addr(&self, client_id: usize) -> Option<SocketAddr> {
        self.slots.get(client_id)?.peer_addr()
    }

    pub fn has_security_token(&self, client_id: usize) -> bool {
        self.slots
            .get(client_id)
            .is_some_and(|slot| slot.security_token() != SecurityToken::UNSUPPORTED)
    }

    /// Token accepted on sixup connectionless packets from any address.
    pub fn global_token(&self) -> SecurityToken {
        self.global_token
    }

    pub fn token_for(&self, addr: SocketAddr) -> SecurityToken {
        derive_token(&self.seed, Some(addr.ip()))
    }

    pub fn vanilla_token_for(&self, addr: SocketAddr) -> i32 {
        self.token_for(addr).vanilla()
    }

    pub fn set_timeout_protected(&mut self, client_id: usize) -> Result<()> {
        self.slot_mut(client_id)?.set_timeout_protected(true);
        Ok(())
    }

    pub fn reset_error_string(&mut self, client_id: usize) -> Result<()> {
        self.slot_mut(client_id)?.reset_error_string();
        Ok(())
    }

    /// Moves the session of `orig_id` into `client_id`, so a client that
    /// reconnected after a timeout keeps its sequence state and resend queue.
    pub fn set_timed_out(&mut self, client_id: usize, orig_id: usize) -> Result<()> {
        if client_id == orig_id {
            return Err(NetError::InvalidClient(orig_id));
        }
        let session = self
            .slot_mut(orig_id)?
            .take_session()
            .ok_or(NetError::NotConnected)?;
        let now = Instant::now();
        self.slot_mut(client_id)?.set_timed_out(now, session);
        log::info!("Client {} resumed the session of slot {}", client_id, orig_id);
        Ok(())
    }

    pub fn drop_client(
        &mut self,
        client_id: usize,
        reason: &str,
        hooks: &mut dyn ServerHooks,
    ) -> Result<()> {
        if self.slot_mut(client_id)?.state() == ConnState::Offline {
            return Err(NetError::NotConnected);
        }
        hooks.del_client(client_id, reason);
        let mut io = Io::new(&self.codec, &mut self.socket, Instant::now());
        self.slots[client_id].disconnect(&mut io, reason);
        log::info!("Dropped client {}: {}", client_id, reason);
        Ok(())
    }

    pub fn update(&mut self, hooks: &mut dyn ServerHooks) {
        let now = Instant::now();
        for client_id in 0..self.slots.len() {
            let mut io = Io::new(&self.codec, &mut self.socket, now);
            let slot = &mut self.slots[client_id];
            slot.update(&mut io);

            if slot.state() == ConnState::Error
                && !(slot.is_timeout_protected() && slot.in_timeout_situation())
            {
                let reason = slot.error_string().to_string();
                hooks.del_client(client_id, &reason);
                slot.disconnect(&mut io, &reason);
                log::info!("Dropped client {}: {}", client_id, reason);
            }
        }

        if let Some(bans) = &self.bans {
            bans.borrow_mut().update(now);
        }
    }

    /// Next chunk for the game layer, or `None` once the socket is drained.
    pub fn recv(&mut self, hooks: &mut dyn ServerHooks) -> Result<Option<NetChunk>> {
        loop {
            if self.unpacker.is_active() {
                let conn = self
                    .unpacker
                    .client_id()
                    .and_then(|id| self.slots.get_mut(id));
                if let Some(chunk) = self.unpacker.fetch_chunk(conn) {
                    return Ok(Some(chunk));
                }
            }

            let Some((data, addr)) = self.socket.recv_from()? else {
                return Ok(None);
            };
            let now = Instant::now();

            if let Some(message) = self.ban_message(addr.ip(), now) {
                let mut extra = message.into_bytes();
                extra.push(0);
                self.send_control_raw(addr, CTRL_CLOSE, &extra, SecurityToken::UNSUPPORTED, false);
                continue;
            }

            let slot = self.find_slot(addr);
            let sixup_hint = slot.is_some_and(|id| self.slots[id].is_sixup());
            let mut packet = match self.codec.unpack(&data, sixup_hint) {
                Ok(packet) => packet,
                Err(e) => {
                    log::debug!("Dropping datagram from {}: {}", addr, e);
                    continue;
                }
            };

            if packet.is_connless() {
                if let Some(chunk) = self.on_connless(addr, packet) {
                    return Ok(Some(chunk));
                }
                continue;
            }

            if let Some(client_id) = slot {
                if let Some(ctrl) = packet.control_msg() {
                    self.on_conn_ctrl_msg(client_id, ctrl, &packet, addr, hooks);
                }
                let token = self.token_for(addr);
                let mut io = Io::new(&self.codec, &mut self.socket, now);
                if self.slots[client_id].feed(&mut io, &mut packet, addr, token)
                    && !packet.is_control()
                {
                    let sixup = packet.sixup;
                    self.unpacker.start(addr, packet, Some(client_id), sixup);
                }
                continue;
            }

            if packet.sixup {
                self.on_sixup_msg(addr, &packet, now, hooks);
            } else if let Some(ctrl) = packet.control_msg() {
                self.on_token_ctrl_msg(addr, ctrl, &packet, now, hooks);
            } else {
                self.on_pre_conn_msg(addr, &packet, now, hooks);
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

        let client_id = chunk.client_id.ok_or(NetError::NotConnected)?;
        let flags = if chunk.is_vital() {
            ChunkFlags::VITAL
        } else {
            ChunkFlags::empty()
        };
        let slot = self
            .slots
            .get_mut(client_id)
            .ok_or(NetError::InvalidClient(client_id))?;
        let mut io = Io::new(&self.codec, &mut self.socket, Instant::now());
        slot.queue_chunk(&mut io, flags, &chunk.data)?;
        if chunk.flags.contains(SendFlags::FLUSH) {
            slot.flush(&mut io);
        }
        Ok(())
    }

    /// Connectionless reply to a sixup peer that told us its response token.
    pub fn send_connless_sixup(
        &mut self,
        chunk: &NetChunk,
        response_token: SecurityToken,
    ) -> Result<()> {
        let own = self.token_for(chunk.addr);
        let bytes = Codec::pack_connless_sixup(&chunk.data, response_token, own)?;
        self.socket.send_to(&bytes, chunk.addr)?;
        Ok(())
    }

    pub fn flush(&mut self, client_id: usize) -> Result<usize> {
        let slot = self
            .slots
            .get_mut(client_id)
            .ok_or(NetError::InvalidClient(client_id))?;
        let mut io = Io::new(&self.codec, &mut self.socket, Instant::now());
        Ok(slot.flush(&mut io))
    }

    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        Ok(self.socket.wait(timeout)?)
    }

    fn slot_mut(&mut self, client_id: usize) -> Result<&mut NetConnection> {
        self.slots
            .get_mut(client_id)
            .ok_or(NetError::InvalidClient(client_id))
    }

    fn find_slot(&self, addr: SocketAddr) -> Option<usize> {
        self.slots.iter().position(|slot| {
            !matches!(slot.state(), ConnState::Offline | ConnState::Error)
                && slot.peer_addr() == Some(addr)
        })
    }

    fn ban_message(&self, ip: IpAddr, now: Instant) -> Option<String> {
        self.bans.as_ref()?.borrow().is_banned(ip, now)
    }

    fn send_control_raw(
        &mut self,
        addr: SocketAddr,
        ctrl: u8,
        extra: &[u8],
        token: SecurityToken,
        sixup: bool,
    ) {
        match self.codec.pack_control(0, ctrl, extra, token, sixup) {
            Ok(bytes) => self.socket.send_datagram(addr, &bytes),
            Err(e) => log::warn!("Failed to pack control message {} for {}: {}", ctrl, addr, e),
        }
    }

    fn on_connless(&mut self, addr: SocketAddr, packet: PacketConstruct) -> Option<NetChunk> {
        if packet.sixup
            && packet.security_token != self.token_for(addr)
            && packet.security_token != self.global_token
        {
            log::debug!("Connless packet from {} with wrong token", addr);
            return None;
        }

        let response_token = packet.sixup.then_some(packet.response_token);
        let mut chunk = NetChunk::connless(addr, packet.data);
        chunk.response_token = response_token;
        if packet.flags.contains(PacketFlags::EXTENDED) {
            chunk.flags |= SendFlags::EXTENDED;
            chunk.extra = Some(packet.extra);
        }
        Some(chunk)
    }

    fn on_conn_ctrl_msg(
        &mut self,
        client_id: usize,
        ctrl: u8,
        packet: &PacketConstruct,
        addr: SocketAddr,
        hooks: &mut dyn ServerHooks,
    ) {
        match ctrl {
            CTRL_CONNECT if supports_token(packet) => {
                // reconnect attempt inside a live session
                let token = self.token_for(addr);
                self.send_control_raw(addr, CTRL_CONNECTACCEPT, &SECURITY_TOKEN_MAGIC, token, false);
                log::debug!("Client {} reconnecting from {}", client_id, addr);
            }
            CTRL_ACCEPT if packet.data.len() == 1 + TOKEN_SIZE => {
                if read_token(&packet.data, 1) == Some(self.token_for(addr)) {
                    self.slots[client_id].reset(true);
                    hooks.client_rejoin(client_id);
                    log::debug!("Client {} rejoined from {}", client_id, addr);
                }
            }
            _ => {}
        }
    }

    fn on_sixup_msg(
        &mut self,
        addr: SocketAddr,
        packet: &PacketConstruct,
        now: Instant,
        hooks: &mut dyn ServerHooks,
    ) {
        let token = self.token_for(addr);
        match packet.control_msg() {
            Some(CTRL_TOKEN) if packet.data.len() >= 1 + TOKEN_REQUEST_DATA_SIZE => {
                match self.codec.pack_control_with_token(
                    packet.response_token,
                    0,
                    CTRL_TOKEN,
                    token,
                    false,
                ) {
                    Ok(bytes) => self.socket.send_datagram(addr, &bytes),
                    Err(e) => log::warn!("Failed to pack token reply for {}: {}", addr, e),
                }
            }
            Some(CTRL_CONNECT) if packet.security_token == token => {
                self.try_accept_client(addr, packet.response_token, false, true, token, now, hooks);
            }
            Some(ctrl) => log::debug!("Ignoring sixup control {} from unknown {}", ctrl, addr),
            None => {}
        }
    }

    fn on_token_ctrl_msg(
        &mut self,
        addr: SocketAddr,
        ctrl: u8,
        packet: &PacketConstruct,
        now: Instant,
        hooks: &mut dyn ServerHooks,
    ) {
        match ctrl {
            CTRL_CONNECT if supports_token(packet) => {
                let token = self.token_for(addr);
                self.send_control_raw(addr, CTRL_CONNECTACCEPT, &SECURITY_TOKEN_MAGIC, token, false);
                log::debug!("Sent token {:?} to {}", token, addr);
            }
            CTRL_CONNECT => {
                self.send_control_raw(
                    addr,
                    CTRL_CONNECTACCEPT,
                    &[],
                    SecurityToken::UNSUPPORTED,
                    false,
                );
                if self.config.vanilla_anti_spoof && !self.config.password_set {
                    self.send_vanilla_handshake(addr, now);
                } else {
                    self.try_accept_client(
                        addr,
                        SecurityToken::UNSUPPORTED,
                        false,
                        false,
                        SecurityToken::UNKNOWN,
                        now,
                        hooks,
                    );
                }
            }
            CTRL_ACCEPT if packet.data.len() == 1 + TOKEN_SIZE => {
                let token = self.token_for(addr);
                if read_token(&packet.data, 1) == Some(token) {
                    self.try_accept_client(addr, token, false, false, SecurityToken::UNKNOWN, now, hooks);
                } else {
                    log::debug!("Invalid token in accept from {}", addr);
                }
            }
            _ => {}
        }
    }

    fn on_pre_conn_msg(
        &mut self,
        addr: SocketAddr,
        packet: &PacketConstruct,
        now: Instant,
        hooks: &mut dyn ServerHooks,
    ) {
        if !self.config.vanilla_anti_spoof || self.config.password_set {
            return;
        }
        if vanilla::input_ack_token(packet) == Some(self.vanilla_token_for(addr)) {
            self.try_accept_client(
                addr,
                SecurityToken::UNSUPPORTED,
                true,
                false,
                SecurityToken::UNKNOWN,
                now,
                hooks,
            );
        }
    }

    fn send_vanilla_handshake(&mut self, addr: SocketAddr, now: Instant) {
        let flooding = self.flood.register(now, self.config.van_conn_per_second);
        let map = if flooding {
            log::debug!("Handshake flood detected, sending fallback map to {}", addr);
            None
        } else {
            self.config.bootstrap_map.as_ref()
        };

        match vanilla::build_handshake(&self.codec, map, self.vanilla_token_for(addr)) {
            Ok(bytes) => self.socket.send_datagram(addr, &bytes),
            Err(e) => log::warn!("Failed to build handshake for {}: {}", addr, e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_accept_client(
        &mut self,
        addr: SocketAddr,
        token: SecurityToken,
        vanilla_auth: bool,
        sixup: bool,
        sixup_token: SecurityToken,
        now: Instant,
        hooks: &mut dyn ServerHooks,
    ) -> Option<usize> {
        let rejection = if sixup && !self.config.sixup {
            Some("0.7 connections are not accepted at this time".to_string())
        } else if self.config.connlimit > 0
            && !self.connlimit.allow(
                addr.ip(),
                now,
                self.config.connlimit,
                self.config.connlimit_time,
            )
        {
            Some("Too many connections in a short time".to_string())
        } else {
            let same_ip = self
                .slots
                .iter()
                .filter(|slot| {
                    slot.state() != ConnState::Offline
                        && slot.peer_addr().is_some_and(|peer| peer.ip() == addr.ip())
                })
                .count();
            if same_ip >= self.config.max_clients_per_ip {
                Some(format!(
                    "Only {} players with the same IP are allowed",
                    self.config.max_clients_per_ip
                ))
            } else {
                None
            }
        };

        let free = self
            .slots
            .iter()
            .position(|slot| slot.state() == ConnState::Offline);
        let (client_id, reason) = match (rejection, free) {
            (Some(reason), _) => (None, reason),
            (None, None) => (None, "This server is full".to_string()),
            (None, Some(client_id)) => (Some(client_id), String::new()),
        };
        let Some(client_id) = client_id else {
            log::debug!("Refusing {}: {}", addr, reason);
            let mut extra = reason.into_bytes();
            extra.push(0);
            self.send_control_raw(addr, CTRL_CLOSE, &extra, token, sixup);
            return None;
        };

        let mut io = Io::new(&self.codec, &mut self.socket, now);
        let slot = &mut self.slots[client_id];
        slot.direct_init(now, addr, token, sixup_token, sixup);
        if sixup {
            slot.send_control(&mut io, CTRL_CONNECTACCEPT, &sixup_token.to_be_bytes());
        }

        if vanilla_auth {
            slot.set_unknown_seq();
            slot.set_sequence(6);
            hooks.new_client_noauth(client_id);
        } else {
            hooks.new_client(client_id, sixup);
        }
        log::info!(
            "Client {} connected from {}{}",
            client_id,
            addr,
            if sixup { " (sixup)" } else { "" }
        );
        Some(client_id)
    }
}

/// SHA-256 over the seed and the address octets; the port is ignored so a
/// client keeps its token across source ports.
fn derive_token(seed: &[u8; SEED_SIZE], ip: Option<IpAddr>) -> SecurityToken {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    match ip {
        Some(IpAddr::V4(ip)) => hasher.update(ip.octets()),
        Some(IpAddr::V6(ip)) => hasher.update(ip.octets()),
        None => {}
    }
    let digest = hasher.finalize();
    let token = SecurityToken::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    if token.is_concrete() {
        token
    } else {
        SecurityToken(1)
    }
}

fn supports_token(packet: &PacketConstruct) -> bool {
    packet.data.len() >= 1 + SECURITY_TOKEN_MAGIC.len() + TOKEN_SIZE
        && packet.data[1..1 + SECURITY_TOKEN_MAGIC.len()] == SECURITY_TOKEN_MAGIC
}

fn read_token(data: &[u8], offset: usize) -> Option<SecurityToken> {
    let bytes = data.get(offset..offset + TOKEN_SIZE)?;
    Some(SecurityToken::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3],
    ]))
}
