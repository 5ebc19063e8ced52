//! Reliable, ordered channel to exactly one peer.
//!
//! A [`NetConnection`] never touches a socket or reads the clock itself.
//! Every operation that may emit datagrams takes an [`Io`] carrying the
//! shared codec, the outgoing sink and the current time, so the whole state
//! machine is deterministic under test.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::codec::{ByteWriter, ChunkHeader, Codec, PacketConstruct};
use crate::config::ConnConfig;
use crate::error::{NetError, Result};
use crate::protocol::{
    CONN_BUFFER_SIZE, CTRL_ACCEPT, CTRL_CLOSE, CTRL_CONNECT, CTRL_CONNECTACCEPT, CTRL_KEEPALIVE,
    CTRL_TOKEN, ChunkFlags, MAX_CHUNK_HEADER_SIZE, MAX_PACKET_CHUNKS, MAX_PAYLOAD, MAX_SEQUENCE,
    PacketFlags, SECURITY_TOKEN_MAGIC, SecurityToken, is_seq_in_backroom, next_sequence,
    sanitize_cc,
};
use crate::ringbuffer::RingBuffer;
use crate::socket::PacketSink;
use crate::stats::NetworkStats;

const TOKEN_SIZE: usize = 4;
const MAX_RESEND_ENTRIES: usize = MAX_SEQUENCE as usize;
/// Bookkeeping charged per resend entry on top of its payload.
const RESEND_ENTRY_OVERHEAD: usize = 32;
/// Chunk data a single packet may hold, leaving room for the legacy token.
const CONSTRUCT_CAPACITY: usize = MAX_PAYLOAD - TOKEN_SIZE;
const MAX_REASON_LEN: usize = 255;
const RECONNECT_GRACE: Duration = Duration::from_secs(3);

/// Per-call context handed to the connection state machine.
pub struct Io<'a> {
    pub codec: &'a Codec,
    pub sink: &'a mut dyn PacketSink,
    pub now: Instant,
}

impl<'a> Io<'a> {
    pub fn new(codec: &'a Codec, sink: &'a mut dyn PacketSink, now: Instant) -> Self {
        Self { codec, sink, now }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Offline,
    /// Sixup client waiting for the server token.
    WantToken,
    Connect,
    Pending,
    Online,
    Error,
}

/// Copy of a vital chunk kept until the peer acknowledges it.
#[derive(Debug, Clone)]
pub struct ResendEntry {
    pub flags: ChunkFlags,
    pub data: Vec<u8>,
    pub sequence: u16,
    pub first_send: Instant,
    pub last_send: Instant,
}

/// Everything a timed-out slot needs to resume another slot's session.
#[derive(Debug)]
pub struct MigratedSession {
    pub addr: SocketAddr,
    pub sequence: u16,
    pub ack: u16,
    pub security_token: SecurityToken,
    pub sixup_token: SecurityToken,
    pub resend_buffer: RingBuffer<ResendEntry>,
    pub sixup: bool,
}

#[derive(Debug)]
pub struct NetConnection {
    state: ConnState,
    config: ConnConfig,

    sequence: u16,
    ack: u16,
    peer_ack: u16,
    remote_closed: bool,
    unknown_seq: bool,

    sixup: bool,
    /// Token we stamp on outgoing packets. Legacy peers echo the same value.
    security_token: SecurityToken,
    /// Token sixup peers must put in the header of packets sent to us.
    sixup_token: SecurityToken,

    resend_buffer: RingBuffer<ResendEntry>,
    construct: PacketConstruct,

    peer_addr: Option<SocketAddr>,
    connect_addrs: Vec<SocketAddr>,

    last_send_time: Instant,
    last_recv_time: Instant,
    last_update_time: Option<Instant>,

    error: String,
    timeout_protected: bool,
    timeout_situation: bool,
    stats: NetworkStats,
}

impl NetConnection {
    pub fn new(config: ConnConfig) -> Self {
        let now = Instant::now();
        Self {
            state: ConnState::Offline,
            config,
            sequence: 0,
            ack: 0,
            peer_ack: 0,
            remote_closed: false,
            unknown_seq: false,
            sixup: false,
            security_token: SecurityToken::UNKNOWN,
            sixup_token: SecurityToken::UNKNOWN,
            resend_buffer: RingBuffer::new(MAX_RESEND_ENTRIES, CONN_BUFFER_SIZE),
            construct: PacketConstruct::default(),
            peer_addr: None,
            connect_addrs: Vec::new(),
            last_send_time: now,
            last_recv_time: now,
            last_update_time: None,
            error: String::new(),
            timeout_protected: false,
            timeout_situation: false,
            stats: NetworkStats::default(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn ack(&self) -> u16 {
        self.ack
    }

    pub fn peer_ack(&self) -> u16 {
        self.peer_ack
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn connect_addrs(&self) -> &[SocketAddr] {
        &self.connect_addrs
    }

    pub fn security_token(&self) -> SecurityToken {
        self.security_token
    }

    pub fn sixup_token(&self) -> SecurityToken {
        self.sixup_token
    }

    pub fn is_sixup(&self) -> bool {
        self.sixup
    }

    pub fn error_string(&self) -> &str {
        &self.error
    }

    pub fn reset_error_string(&mut self) {
        self.error.clear();
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn resend_buffer(&self) -> &RingBuffer<ResendEntry> {
        &self.resend_buffer
    }

    pub fn last_recv_time(&self) -> Instant {
        self.last_recv_time
    }

    pub fn is_timeout_protected(&self) -> bool {
        self.timeout_protected
    }

    pub fn set_timeout_protected(&mut self, protected: bool) {
        self.timeout_protected = protected;
    }

    pub fn in_timeout_situation(&self) -> bool {
        self.timeout_situation
    }

    /// The first vital chunk received is taken as in order, whatever its sequence.
    pub fn set_unknown_seq(&mut self) {
        self.unknown_seq = true;
    }

    pub fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence % MAX_SEQUENCE;
    }

    /// Nothing heard from the peer for longer than `max_latency`.
    pub fn got_problems(&self, max_latency: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_recv_time) > max_latency
    }

    pub fn reset(&mut self, rejoin: bool) {
        self.sequence = 0;
        self.ack = 0;
        self.peer_ack = 0;
        self.remote_closed = false;

        if !rejoin {
            self.timeout_protected = false;
            self.timeout_situation = false;
            self.state = ConnState::Offline;
            self.security_token = SecurityToken::UNKNOWN;
            self.sixup_token = SecurityToken::UNKNOWN;
            self.sixup = false;
        }

        self.unknown_seq = false;
        self.resend_buffer.clear();
        self.construct.clear();
    }

    pub fn connect(&mut self, io: &mut Io<'_>, addrs: &[SocketAddr]) -> Result<()> {
        if self.state != ConnState::Offline {
            return Err(NetError::AlreadyConnected);
        }
        if addrs.is_empty() {
            return Err(NetError::NoAddress);
        }

        self.reset(false);
        self.peer_addr = None;
        self.connect_addrs = addrs.to_vec();
        self.error.clear();
        self.state = ConnState::Connect;
        self.send_connect(io);
        Ok(())
    }

    /// Starts the sixup handshake by asking `addr` for its token.
    pub fn connect_sixup(&mut self, io: &mut Io<'_>, addr: SocketAddr) -> Result<()> {
        if self.state != ConnState::Offline {
            return Err(NetError::AlreadyConnected);
        }

        self.reset(false);
        self.peer_addr = None;
        self.connect_addrs = vec![addr];
        self.error.clear();
        self.sixup = true;
        self.sixup_token = SecurityToken::random();
        self.state = ConnState::WantToken;
        self.send_token_request(io);
        Ok(())
    }

    pub fn disconnect(&mut self, io: &mut Io<'_>, reason: &str) {
        if self.state == ConnState::Offline {
            return;
        }

        if !self.remote_closed {
            if !self.timeout_situation {
                let mut extra = Vec::with_capacity(reason.len() + 1);
                if !reason.is_empty() {
                    extra.extend_from_slice(reason.as_bytes());
                    extra.push(0);
                }
                self.send_control(io, CTRL_CLOSE, &extra);
            }
            self.set_error(reason);
        }

        self.reset(false);
    }

    /// Puts the connection straight into `Online`, for handshakes completed
    /// without a slot.
    pub fn direct_init(
        &mut self,
        now: Instant,
        addr: SocketAddr,
        security_token: SecurityToken,
        sixup_token: SecurityToken,
        sixup: bool,
    ) {
        self.reset(false);
        self.state = ConnState::Online;
        self.peer_addr = Some(addr);
        self.error.clear();
        self.last_send_time = now;
        self.last_recv_time = now;
        self.last_update_time = Some(now);
        self.security_token = security_token;
        self.sixup_token = sixup_token;
        self.sixup = sixup;
    }

    /// Hands over the session state, leaving this connection offline.
    pub fn take_session(&mut self) -> Option<MigratedSession> {
        let addr = self.peer_addr?;
        let resend_buffer = std::mem::replace(
            &mut self.resend_buffer,
            RingBuffer::new(MAX_RESEND_ENTRIES, CONN_BUFFER_SIZE),
        );
        let session = MigratedSession {
            addr,
            sequence: self.sequence,
            ack: self.ack,
            security_token: self.security_token,
            sixup_token: self.sixup_token,
            resend_buffer,
            sixup: self.sixup,
        };
        self.reset(false);
        Some(session)
    }

    /// Resumes a session taken from another connection and goes `Online`.
    pub fn set_timed_out(&mut self, now: Instant, session: MigratedSession) {
        self.sequence = session.sequence;
        self.ack = session.ack;
        self.remote_closed = false;
        self.unknown_seq = false;
        self.state = ConnState::Online;
        self.peer_addr = Some(session.addr);
        self.error.clear();
        self.last_send_time = now;
        self.last_recv_time = now;
        self.last_update_time = Some(now);
        self.security_token = session.security_token;
        self.sixup_token = session.sixup_token;
        self.sixup = session.sixup;
        self.timeout_situation = false;
        self.resend_buffer = session.resend_buffer;
        self.construct.clear();
    }

    /// Processes one decoded packet. Returns `false` when it was dropped or
    /// closed the connection; the caller only unpacks chunks on `true`.
    ///
    /// `token` is the token a legacy peer gets when its CONNECT moves an
    /// offline connection to `Pending`.
    pub fn feed(
        &mut self,
        io: &mut Io<'_>,
        packet: &mut PacketConstruct,
        addr: SocketAddr,
        token: SecurityToken,
    ) -> bool {
        let accepts_any = matches!(
            self.state,
            ConnState::Offline | ConnState::Connect | ConnState::WantToken
        );
        if !accepts_any && self.peer_addr != Some(addr) {
            return false;
        }

        if self.sixup {
            if packet.security_token != self.sixup_token {
                log::debug!(
                    "Token mismatch from {}: expected {:?}, got {:?}",
                    addr,
                    self.sixup_token,
                    packet.security_token
                );
                return false;
            }
        } else if self.security_token.is_concrete() {
            let Some(split) = packet.data.len().checked_sub(TOKEN_SIZE) else {
                return false;
            };
            let mut trailing = [0u8; TOKEN_SIZE];
            trailing.copy_from_slice(&packet.data[split..]);
            let received = SecurityToken::from_be_bytes(trailing);
            if received != self.security_token {
                log::debug!(
                    "Token mismatch from {}: expected {:?}, got {:?}",
                    addr,
                    self.security_token,
                    received
                );
                return false;
            }
            packet.data.truncate(split);
        }

        if self.sequence >= self.peer_ack {
            if packet.ack < self.peer_ack || packet.ack > self.sequence {
                return false;
            }
        } else if packet.ack < self.peer_ack && packet.ack > self.sequence {
            return false;
        }
        self.peer_ack = packet.ack;
        self.stats.record_received(packet.data.len());

        if packet.flags.contains(PacketFlags::RESEND) {
            self.resend(io);
        }

        if packet.is_connless() {
            return true;
        }

        if let Some(ctrl) = packet.control_msg() {
            if ctrl == CTRL_CLOSE {
                self.on_close(packet, addr);
                return false;
            }
            if !self.on_control(io, ctrl, packet, addr, token) {
                return false;
            }
        } else if self.state == ConnState::Pending {
            self.last_recv_time = io.now;
            self.state = ConnState::Online;
            log::debug!("Connection from {} online", addr);
        }

        if self.state == ConnState::Online {
            self.last_recv_time = io.now;
            self.ack_chunks(packet.ack);
        }

        true
    }

    /// Queues one chunk on the packet under construction. Vital chunks get
    /// the next sequence number and a resend entry; when the resend buffer
    /// cannot take them nothing is queued.
    pub fn queue_chunk(&mut self, io: &mut Io<'_>, flags: ChunkFlags, data: &[u8]) -> Result<()> {
        if matches!(self.state, ConnState::Offline | ConnState::Error) {
            return Err(NetError::NotConnected);
        }
        if data.len() > ChunkHeader::max_size(self.sixup)
            || data.len() + MAX_CHUNK_HEADER_SIZE > CONSTRUCT_CAPACITY
        {
            return Err(NetError::PayloadTooLarge(data.len()));
        }

        let vital = flags.contains(ChunkFlags::VITAL);
        let footprint = data.len() + RESEND_ENTRY_OVERHEAD;
        if vital && !self.resend_buffer.can_fit(footprint) {
            log::debug!(
                "Resend buffer full for {:?} ({} bytes queued)",
                self.peer_addr,
                self.resend_buffer.bytes_used()
            );
            return Err(NetError::ResendBufferFull);
        }

        let sequence = if vital {
            next_sequence(self.sequence)
        } else {
            self.sequence
        };
        self.queue_chunk_ex(io, flags, data, sequence)?;

        if vital {
            self.sequence = sequence;
            let entry = ResendEntry {
                flags,
                data: data.to_vec(),
                sequence,
                first_send: io.now,
                last_send: io.now,
            };
            self.resend_buffer
                .push(entry, footprint)
                .map_err(|_| NetError::ResendBufferFull)?;
        }
        Ok(())
    }

    /// Sends the packet under construction. Returns the number of chunks sent.
    pub fn flush(&mut self, io: &mut Io<'_>) -> usize {
        let num_chunks = self.construct.num_chunks;
        if num_chunks == 0 && self.construct.flags.is_empty() {
            return 0;
        }

        self.construct.ack = self.ack;
        if let Some(addr) = self.peer_addr {
            match io
                .codec
                .pack(&self.construct, self.security_token, self.sixup, false)
            {
                Ok(bytes) => {
                    io.sink.send_datagram(addr, &bytes);
                    self.stats.record_sent(bytes.len());
                }
                Err(e) => log::warn!("Failed to pack packet for {}: {}", addr, e),
            }
        }

        self.last_send_time = io.now;
        self.construct.clear();
        num_chunks
    }

    /// Drives timers. Call once per tick.
    pub fn update(&mut self, io: &mut Io<'_>) {
        let now = io.now;

        if self.state == ConnState::Error
            && self.timeout_situation
            && now.saturating_duration_since(self.last_recv_time) >= self.config.timeout_protection
        {
            self.timeout_situation = false;
            self.set_error("Timeout Protection over");
        }

        if matches!(self.state, ConnState::Offline | ConnState::Error) {
            return;
        }

        self.timeout_situation = false;

        let waiting = matches!(self.state, ConnState::Connect | ConnState::WantToken);
        if !waiting && now.saturating_duration_since(self.last_recv_time) >= self.config.timeout {
            self.state = ConnState::Error;
            self.set_error("Timeout");
            self.timeout_situation = true;
            return;
        }

        if let Some(first) = self.resend_buffer.first() {
            if now.saturating_duration_since(first.first_send) > self.config.timeout {
                self.state = ConnState::Error;
                let reason = format!(
                    "Too weak connection (not acked for {} seconds)",
                    self.config.timeout.as_secs()
                );
                self.set_error(&reason);
                self.timeout_situation = true;
                return;
            }
            if now.saturating_duration_since(first.last_send) > self.config.resend_interval {
                self.resend_first(io);
            }
        }

        let idle = now.saturating_duration_since(self.last_send_time);
        match self.state {
            ConnState::Online => {
                if idle > self.config.flush_interval {
                    let flushed = self.flush(io);
                    if flushed > 0 {
                        log::trace!("Flushed {} idle chunks to {:?}", flushed, self.peer_addr);
                    }
                }
                if now.saturating_duration_since(self.last_send_time)
                    > self.config.keepalive_interval
                {
                    self.send_control(io, CTRL_KEEPALIVE, &[]);
                }
            }
            ConnState::Connect if idle > self.config.connect_resend => self.send_connect(io),
            ConnState::WantToken if idle > self.config.connect_resend => {
                self.send_token_request(io)
            }
            ConnState::Pending if idle > self.config.connect_resend => {
                self.send_control(io, CTRL_CONNECTACCEPT, &SECURITY_TOKEN_MAGIC)
            }
            _ => {}
        }
    }

    /// Requests a full resend from the peer with the next packet.
    pub fn signal_resend(&mut self) {
        self.construct.flags |= PacketFlags::RESEND;
    }

    /// Checks an incoming vital sequence against the ack. Returns `true` if
    /// the chunk is the next one in order and should be delivered.
    pub(crate) fn receive_sequence(&mut self, sequence: u16) -> bool {
        if sequence == next_sequence(self.ack) || self.unknown_seq {
            self.unknown_seq = false;
            self.ack = sequence;
            return true;
        }

        if !is_seq_in_backroom(sequence, self.ack) {
            log::debug!(
                "Asking {:?} for resend: got {}, expected {}",
                self.peer_addr,
                sequence,
                next_sequence(self.ack)
            );
            self.signal_resend();
        }
        false
    }

    fn set_error(&mut self, reason: &str) {
        let mut error = sanitize_cc(reason);
        if error.len() > MAX_REASON_LEN {
            let mut end = MAX_REASON_LEN;
            while !error.is_char_boundary(end) {
                end -= 1;
            }
            error.truncate(end);
        }
        self.error = error;
    }

    fn on_close(&mut self, packet: &PacketConstruct, addr: SocketAddr) {
        let from_peer = if self.state == ConnState::Connect || self.state == ConnState::WantToken {
            self.connect_addrs.contains(&addr)
        } else {
            self.peer_addr == Some(addr)
        };
        if !from_peer {
            return;
        }

        self.state = ConnState::Error;
        self.remote_closed = true;

        let body = packet.data.get(1..).unwrap_or_default();
        let end = body
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(body.len())
            .min(MAX_REASON_LEN);
        let reason = sanitize_cc(&String::from_utf8_lossy(&body[..end]));

        if !self.config.block_close_msg {
            self.error = reason.clone();
        }
        log::debug!("Connection closed by {}: '{}'", addr, reason);
    }

    fn on_control(
        &mut self,
        io: &mut Io<'_>,
        ctrl: u8,
        packet: &PacketConstruct,
        addr: SocketAddr,
        token: SecurityToken,
    ) -> bool {
        match (self.state, ctrl) {
            (ConnState::Offline, CTRL_CONNECT) => {
                if let (Some(peer), Some(last)) = (self.peer_addr, self.last_update_time) {
                    if peer.ip() == addr.ip()
                        && io.now.saturating_duration_since(last) < RECONNECT_GRACE
                    {
                        return false;
                    }
                }

                self.reset(false);
                self.state = ConnState::Pending;
                self.peer_addr = Some(addr);
                self.error.clear();
                self.last_send_time = io.now;
                self.last_recv_time = io.now;
                self.last_update_time = Some(io.now);

                if has_token_magic(&packet.data) {
                    self.security_token = token;
                    log::debug!("Generated token {:?} for {}", token, addr);
                } else {
                    self.security_token = SecurityToken::UNSUPPORTED;
                    log::debug!(
                        "Token not supported by {} (packet size {})",
                        addr,
                        packet.data.len()
                    );
                }
                self.send_control(io, CTRL_CONNECTACCEPT, &SECURITY_TOKEN_MAGIC);
                log::debug!("Got connection from {}, sending connect+accept", addr);
            }
            (ConnState::WantToken, CTRL_TOKEN) => {
                let Some(server_token) = read_token(&packet.data, 1) else {
                    return false;
                };
                self.security_token = server_token;
                self.state = ConnState::Connect;
                self.send_connect(io);
                log::debug!("Got token {:?} from {}, sending connect", server_token, addr);
            }
            (ConnState::Connect, CTRL_CONNECTACCEPT) => {
                self.peer_addr = Some(addr);
                if self.security_token == SecurityToken::UNKNOWN && has_token_magic(&packet.data) {
                    if let Some(peer_token) = read_token(&packet.data, 1 + SECURITY_TOKEN_MAGIC.len())
                    {
                        self.security_token = peer_token;
                        log::debug!("Got token {:?} from {}", peer_token, addr);
                    }
                } else if !self.sixup {
                    self.security_token = SecurityToken::UNSUPPORTED;
                    log::debug!("Token not supported by server {}", addr);
                }
                self.last_recv_time = io.now;
                if !self.sixup {
                    self.send_control(io, CTRL_ACCEPT, &[]);
                }
                self.state = ConnState::Online;
                log::debug!("Got connect+accept from {}, connection online", addr);
            }
            _ => {}
        }
        true
    }

    fn queue_chunk_ex(
        &mut self,
        io: &mut Io<'_>,
        flags: ChunkFlags,
        data: &[u8],
        sequence: u16,
    ) -> Result<()> {
        if self.construct.data.len() + data.len() + MAX_CHUNK_HEADER_SIZE > CONSTRUCT_CAPACITY
            || self.construct.num_chunks == MAX_PACKET_CHUNKS
        {
            self.flush(io);
        }

        let mut writer = ByteWriter::with_limit(MAX_CHUNK_HEADER_SIZE + data.len());
        ChunkHeader::new(flags, data.len(), sequence).pack(&mut writer, self.sixup)?;
        writer.write_bytes(data)?;
        self.construct.data.extend_from_slice(writer.as_slice());
        self.construct.num_chunks += 1;
        Ok(())
    }

    fn resend(&mut self, io: &mut Io<'_>) {
        let pending: Vec<(ChunkFlags, Vec<u8>, u16)> = self
            .resend_buffer
            .iter()
            .map(|entry| (entry.flags, entry.data.clone(), entry.sequence))
            .collect();

        for (flags, data, sequence) in &pending {
            if let Err(e) = self.queue_chunk_ex(io, *flags | ChunkFlags::RESEND, data, *sequence) {
                log::warn!("Failed to resend chunk {}: {}", sequence, e);
            }
        }
        for entry in self.resend_buffer.iter_mut() {
            entry.last_send = io.now;
        }
        self.stats.chunks_resent += pending.len() as u64;
    }

    fn resend_first(&mut self, io: &mut Io<'_>) {
        let Some((flags, data, sequence)) = self
            .resend_buffer
            .first()
            .map(|entry| (entry.flags, entry.data.clone(), entry.sequence))
        else {
            return;
        };

        if let Err(e) = self.queue_chunk_ex(io, flags | ChunkFlags::RESEND, &data, sequence) {
            log::warn!("Failed to resend chunk {}: {}", sequence, e);
            return;
        }
        if let Some(entry) = self.resend_buffer.first_mut() {
            entry.last_send = io.now;
        }
        self.stats.chunks_resent += 1;
    }

    fn ack_chunks(&mut self, ack: u16) {
        while let Some(first) = self.resend_buffer.first() {
            if !is_seq_in_backroom(first.sequence, ack) {
                break;
            }
            self.resend_buffer.pop_first();
        }
    }

    /// Sends a standalone control message to the peer.
    pub fn send_control(&mut self, io: &mut Io<'_>, ctrl: u8, extra: &[u8]) {
        self.last_send_time = io.now;
        let Some(addr) = self.peer_addr else {
            return;
        };
        match io
            .codec
            .pack_control(self.ack, ctrl, extra, self.security_token, self.sixup)
        {
            Ok(bytes) => {
                io.sink.send_datagram(addr, &bytes);
                self.stats.record_sent(bytes.len());
            }
            Err(e) => log::warn!("Failed to pack control message {} for {}: {}", ctrl, addr, e),
        }
    }

    fn send_connect(&mut self, io: &mut Io<'_>) {
        self.last_send_time = io.now;
        let packed = if self.sixup {
            io.codec.pack_control_with_token(
                self.security_token,
                self.ack,
                CTRL_CONNECT,
                self.sixup_token,
                true,
            )
        } else {
            io.codec.pack_control(
                self.ack,
                CTRL_CONNECT,
                &SECURITY_TOKEN_MAGIC,
                self.security_token,
                false,
            )
        };
        self.send_to_connect_addrs(io, packed);
    }

    fn send_token_request(&mut self, io: &mut Io<'_>) {
        self.last_send_time = io.now;
        let packed = io.codec.pack_control_with_token(
            SecurityToken::UNKNOWN,
            0,
            CTRL_TOKEN,
            self.sixup_token,
            true,
        );
        self.send_to_connect_addrs(io, packed);
    }

    fn send_to_connect_addrs(
        &mut self,
        io: &mut Io<'_>,
        packed: std::result::Result<Vec<u8>, crate::error::PacketError>,
    ) {
        match packed {
            Ok(bytes) => {
                for addr in &self.connect_addrs {
                    io.sink.send_datagram(*addr, &bytes);
                    self.stats.record_sent(bytes.len());
                }
            }
            Err(e) => log::warn!("Failed to pack connect message: {}", e),
        }
    }
}

fn has_token_magic(data: &[u8]) -> bool {
    data.len() >= 1 + SECURITY_TOKEN_MAGIC.len() + TOKEN_SIZE
        && data[1..1 + SECURITY_TOKEN_MAGIC.len()] == SECURITY_TOKEN_MAGIC
}

fn read_token(data: &[u8], offset: usize) -> Option<SecurityToken> {
    let bytes = data.get(offset..offset + TOKEN_SIZE)?;
    let mut token = [0u8; TOKEN_SIZE];
    token.copy_from_slice(bytes);
    Some(SecurityToken::from_be_bytes(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteReader;
    use crate::protocol::{PACKET_HEADER_SIZE_SIXUP, TOKEN_REQUEST_DATA_SIZE};

    struct Harness {
        codec: Codec,
        sent: Vec<(SocketAddr, Vec<u8>)>,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                codec: Codec::new(),
                sent: Vec::new(),
                now: Instant::now(),
            }
        }

        fn io(&mut self) -> Io<'_> {
            Io::new(&self.codec, &mut self.sent, self.now)
        }

        fn advance(&mut self, millis: u64) {
            self.now += Duration::from_millis(millis);
        }

        /// Feeds everything sent so far into `to`, as if it came from `from`.
        fn deliver(&mut self, from: SocketAddr, to: &mut NetConnection, token: SecurityToken) -> usize {
            let datagrams: Vec<_> = self.sent.drain(..).collect();
            let mut fed = 0;
            for (_, bytes) in datagrams {
                let mut packet = self.codec.unpack(&bytes, to.is_sixup()).unwrap();
                if to.feed(&mut self.io(), &mut packet, from, token) {
                    fed += 1;
                }
            }
            fed
        }

        fn take_packets(&mut self, sixup: bool) -> Vec<PacketConstruct> {
            self.sent
                .drain(..)
                .map(|(_, bytes)| self.codec.unpack(&bytes, sixup).unwrap())
                .collect()
        }
    }

    fn client_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 8303))
    }

    fn online_pair(h: &mut Harness) -> NetConnection {
        let mut conn = NetConnection::new(ConnConfig::default());
        conn.direct_init(
            h.now,
            client_addr(),
            SecurityToken::UNSUPPORTED,
            SecurityToken::UNKNOWN,
            false,
        );
        conn
    }

    fn chunk_sequences(packet: &PacketConstruct) -> Vec<(u16, ChunkFlags, usize)> {
        let mut reader = ByteReader::new(&packet.data);
        let mut out = Vec::new();
        for _ in 0..packet.num_chunks {
            let header = ChunkHeader::unpack(&mut reader, packet.sixup).unwrap();
            reader.read_bytes(header.size).unwrap();
            out.push((header.sequence, header.flags, header.size));
        }
        out
    }

    #[test]
    fn test_legacy_handshake_negotiates_token() {
        let mut h = Harness::new();
        let token = SecurityToken(0x1234_5678);
        let mut client = NetConnection::new(ConnConfig::default());
        let mut server = NetConnection::new(ConnConfig::default());

        client.connect(&mut h.io(), &[server_addr()]).unwrap();
        assert_eq!(client.state(), ConnState::Connect);
        assert_eq!(h.sent[0].1.len(), 3 + 1 + 4 + 4);

        h.deliver(client_addr(), &mut server, token);
        assert_eq!(server.state(), ConnState::Pending);
        assert_eq!(server.security_token(), token);

        h.deliver(server_addr(), &mut client, SecurityToken::UNKNOWN);
        assert_eq!(client.state(), ConnState::Online);
        assert_eq!(client.security_token(), token);

        // ACCEPT carries the token appended
        let accept = &h.sent[0].1;
        assert_eq!(accept.len(), 3 + 1 + 4);
        h.deliver(client_addr(), &mut server, token);
        assert_eq!(server.state(), ConnState::Pending);

        client
            .queue_chunk(&mut h.io(), ChunkFlags::VITAL, b"ready")
            .unwrap();
        client.flush(&mut h.io());
        h.deliver(client_addr(), &mut server, token);
        assert_eq!(server.state(), ConnState::Online);
    }

    #[test]
    fn test_connect_without_magic_is_unsupported() {
        let mut h = Harness::new();
        let mut server = NetConnection::new(ConnConfig::default());
        let bytes = h
            .codec
            .pack_control(0, CTRL_CONNECT, &[], SecurityToken::UNSUPPORTED, false)
            .unwrap();
        let mut packet = h.codec.unpack(&bytes, false).unwrap();
        assert!(server.feed(&mut h.io(), &mut packet, client_addr(), SecurityToken(9)));
        assert_eq!(server.state(), ConnState::Pending);
        assert_eq!(server.security_token(), SecurityToken::UNSUPPORTED);
    }

    #[test]
    fn test_reconnect_from_same_ip_is_deduplicated() {
        let mut h = Harness::new();
        let mut server = online_pair(&mut h);
        server.disconnect(&mut h.io(), "bye");
        h.sent.clear();

        let bytes = h
            .codec
            .pack_control(0, CTRL_CONNECT, &SECURITY_TOKEN_MAGIC, SecurityToken::UNKNOWN, false)
            .unwrap();
        let mut other_port = client_addr();
        other_port.set_port(50001);

        h.advance(1000);
        let mut packet = h.codec.unpack(&bytes, false).unwrap();
        assert!(!server.feed(&mut h.io(), &mut packet, other_port, SecurityToken(5)));
        assert_eq!(server.state(), ConnState::Offline);

        h.advance(2500);
        let mut packet = h.codec.unpack(&bytes, false).unwrap();
        assert!(server.feed(&mut h.io(), &mut packet, other_port, SecurityToken(5)));
        assert_eq!(server.state(), ConnState::Pending);
    }

    #[test]
    fn test_overflowing_chunk_flushes_previous_three() {
        let mut h = Harness::new();
        let mut conn = online_pair(&mut h);
        let payload: Vec<u8> = (0..400).map(|i| (i * 7) as u8).collect();

        for _ in 0..3 {
            conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, &payload)
                .unwrap();
        }
        assert!(h.sent.is_empty());

        conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, &payload)
            .unwrap();
        let packets = h.take_packets(false);
        assert_eq!(packets.len(), 1);
        let chunks = chunk_sequences(&packets[0]);
        assert_eq!(
            chunks.iter().map(|c| c.0).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        assert_eq!(conn.flush(&mut h.io()), 1);
        let packets = h.take_packets(false);
        assert_eq!(chunk_sequences(&packets[0])[0].0, 4);
        assert_eq!(conn.resend_buffer().len(), 4);
    }

    #[test]
    fn test_update_resends_only_the_stale_entry() {
        let mut h = Harness::new();
        let start = h.now;
        let mut conn = online_pair(&mut h);

        conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, b"first")
            .unwrap();
        conn.flush(&mut h.io());
        h.advance(600);
        conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, b"second")
            .unwrap();
        conn.flush(&mut h.io());
        h.sent.clear();

        h.advance(600);
        conn.update(&mut h.io());

        let entries: Vec<_> = conn.resend_buffer().iter().collect();
        assert_eq!(entries[0].last_send, start + Duration::from_millis(1200));
        assert_eq!(entries[1].last_send, start + Duration::from_millis(600));

        let packets = h.take_packets(false);
        assert_eq!(packets.len(), 1);
        let chunks = chunk_sequences(&packets[0]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, 1);
        assert!(chunks[0].1.contains(ChunkFlags::RESEND));
    }

    #[test]
    fn test_timeout_fires_exactly_at_deadline() {
        let mut h = Harness::new();
        let config = ConnConfig {
            timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let mut conn = NetConnection::new(config);
        conn.direct_init(
            h.now,
            client_addr(),
            SecurityToken::UNSUPPORTED,
            SecurityToken::UNKNOWN,
            false,
        );

        h.advance(9_999);
        conn.update(&mut h.io());
        assert_eq!(conn.state(), ConnState::Online);

        h.advance(1);
        conn.update(&mut h.io());
        assert_eq!(conn.state(), ConnState::Error);
        assert_eq!(conn.error_string(), "Timeout");
        assert!(conn.in_timeout_situation());
    }

    #[test]
    fn test_timeout_protection_expires() {
        let mut h = Harness::new();
        let config = ConnConfig {
            timeout: Duration::from_secs(5),
            timeout_protection: Duration::from_secs(20),
            ..Default::default()
        };
        let mut conn = NetConnection::new(config);
        conn.direct_init(
            h.now,
            client_addr(),
            SecurityToken::UNSUPPORTED,
            SecurityToken::UNKNOWN,
            false,
        );
        conn.set_timeout_protected(true);

        h.advance(5_000);
        conn.update(&mut h.io());
        assert!(conn.in_timeout_situation());

        h.advance(15_000);
        conn.update(&mut h.io());
        assert!(!conn.in_timeout_situation());
        assert_eq!(conn.error_string(), "Timeout Protection over");
    }

    #[test]
    fn test_stale_resend_entry_is_fatal() {
        let mut h = Harness::new();
        let config = ConnConfig {
            timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let mut conn = NetConnection::new(config);
        conn.direct_init(
            h.now,
            client_addr(),
            SecurityToken::UNSUPPORTED,
            SecurityToken::UNKNOWN,
            false,
        );
        conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, b"lost")
            .unwrap();

        // keep the receive side alive with keepalives from the peer
        for _ in 0..4 {
            h.advance(900);
            let bytes = h
                .codec
                .pack_control(0, CTRL_KEEPALIVE, &[], SecurityToken::UNSUPPORTED, false)
                .unwrap();
            let mut packet = h.codec.unpack(&bytes, false).unwrap();
            conn.feed(&mut h.io(), &mut packet, client_addr(), SecurityToken::UNKNOWN);
            conn.update(&mut h.io());
        }
        assert_eq!(conn.state(), ConnState::Error);
        assert_eq!(
            conn.error_string(),
            "Too weak connection (not acked for 3 seconds)"
        );
    }

    #[test]
    fn test_ack_never_regresses() {
        let mut conn = NetConnection::new(ConnConfig::default());
        assert!(conn.receive_sequence(1));
        assert!(conn.receive_sequence(2));
        assert!(!conn.receive_sequence(1));
        assert_eq!(conn.ack(), 2);

        assert!(!conn.receive_sequence(5));
        assert_eq!(conn.ack(), 2);
        assert!(conn.construct.flags.contains(PacketFlags::RESEND));

        conn.ack = 1023;
        assert!(conn.receive_sequence(0));
        assert_eq!(conn.ack(), 0);
        assert!(!conn.receive_sequence(1000));
        assert_eq!(conn.ack(), 0);
    }

    #[test]
    fn test_unknown_sequence_adopts_first_vital() {
        let mut conn = NetConnection::new(ConnConfig::default());
        conn.set_unknown_seq();
        assert!(conn.receive_sequence(7));
        assert_eq!(conn.ack(), 7);
        assert!(!conn.receive_sequence(20));
    }

    #[test]
    fn test_resend_buffer_holds_each_sequence_once() {
        let mut h = Harness::new();
        let mut conn = online_pair(&mut h);
        for i in 0..50u8 {
            conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, &[i; 20])
                .unwrap();
        }
        conn.resend(&mut h.io());
        conn.resend(&mut h.io());
        conn.flush(&mut h.io());

        let mut sequences: Vec<u16> = conn.resend_buffer().iter().map(|e| e.sequence).collect();
        let total = sequences.len();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(total, 50);
        assert_eq!(sequences.len(), 50);
    }

    #[test]
    fn test_unreliable_chunks_skip_resend_buffer() {
        let mut h = Harness::new();
        let mut conn = online_pair(&mut h);
        conn.queue_chunk(&mut h.io(), ChunkFlags::empty(), b"input")
            .unwrap();
        assert!(conn.resend_buffer().is_empty());
        assert_eq!(conn.sequence(), 0);
    }

    #[test]
    fn test_full_resend_buffer_rejects_without_side_effects() {
        let mut h = Harness::new();
        let mut conn = online_pair(&mut h);
        let payload = vec![0xaa; 1000];
        let mut accepted = 0;
        loop {
            match conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, &payload) {
                Ok(()) => accepted += 1,
                Err(NetError::ResendBufferFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(accepted, CONN_BUFFER_SIZE / (1000 + RESEND_ENTRY_OVERHEAD));
        assert_eq!(conn.sequence(), accepted as u16);
        let queued = conn.construct.num_chunks;

        assert!(conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, &payload).is_err());
        assert_eq!(conn.construct.num_chunks, queued);
        assert_eq!(conn.sequence(), accepted as u16);
    }

    #[test]
    fn test_acks_prune_resend_buffer() {
        let mut h = Harness::new();
        let mut conn = online_pair(&mut h);
        for _ in 0..3 {
            conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, b"x").unwrap();
        }
        conn.flush(&mut h.io());
        h.sent.clear();

        let ack = PacketConstruct {
            ack: 2,
            flags: PacketFlags::CONTROL,
            data: vec![CTRL_KEEPALIVE],
            ..Default::default()
        };
        let bytes = h.codec.pack(&ack, SecurityToken::UNSUPPORTED, false, true).unwrap();
        let mut packet = h.codec.unpack(&bytes, false).unwrap();
        assert!(conn.feed(&mut h.io(), &mut packet, client_addr(), SecurityToken::UNKNOWN));
        assert_eq!(conn.resend_buffer().len(), 1);
        assert_eq!(conn.peer_ack(), 2);

        // ack beyond our own sequence is out of window
        let mut bogus = h.codec.unpack(&bytes, false).unwrap();
        bogus.ack = 9;
        assert!(!conn.feed(&mut h.io(), &mut bogus, client_addr(), SecurityToken::UNKNOWN));
        assert_eq!(conn.peer_ack(), 2);
    }

    #[test]
    fn test_token_mismatch_is_dropped() {
        let mut h = Harness::new();
        let mut conn = NetConnection::new(ConnConfig::default());
        conn.direct_init(
            h.now,
            client_addr(),
            SecurityToken(77),
            SecurityToken::UNKNOWN,
            false,
        );
        let bytes = h
            .codec
            .pack_control(0, CTRL_KEEPALIVE, &[], SecurityToken(78), false)
            .unwrap();
        let mut packet = h.codec.unpack(&bytes, false).unwrap();
        assert!(!conn.feed(&mut h.io(), &mut packet, client_addr(), SecurityToken::UNKNOWN));

        let bytes = h
            .codec
            .pack_control(0, CTRL_KEEPALIVE, &[], SecurityToken(77), false)
            .unwrap();
        let mut packet = h.codec.unpack(&bytes, false).unwrap();
        assert!(conn.feed(&mut h.io(), &mut packet, client_addr(), SecurityToken::UNKNOWN));
        assert_eq!(packet.data, vec![CTRL_KEEPALIVE]);
    }

    #[test]
    fn test_token_is_immutable_once_negotiated() {
        let mut h = Harness::new();
        let mut client = NetConnection::new(ConnConfig::default());
        client.connect(&mut h.io(), &[server_addr()]).unwrap();
        h.sent.clear();

        let mut extra = SECURITY_TOKEN_MAGIC.to_vec();
        let accept = h
            .codec
            .pack_control(0, CTRL_CONNECTACCEPT, &extra, SecurityToken(1000), false)
            .unwrap();
        let mut packet = h.codec.unpack(&accept, false).unwrap();
        client.feed(&mut h.io(), &mut packet, server_addr(), SecurityToken::UNKNOWN);
        assert_eq!(client.security_token(), SecurityToken(1000));

        // a second connect+accept with another token changes nothing
        extra.extend_from_slice(&SecurityToken(2000).to_be_bytes());
        let replay = h
            .codec
            .pack_control(0, CTRL_CONNECTACCEPT, &extra, SecurityToken(1000), false)
            .unwrap();
        let mut packet = h.codec.unpack(&replay, false).unwrap();
        client.feed(&mut h.io(), &mut packet, server_addr(), SecurityToken::UNKNOWN);
        assert_eq!(client.security_token(), SecurityToken(1000));
        assert_eq!(client.state(), ConnState::Online);
    }

    #[test]
    fn test_close_records_sanitized_reason() {
        let mut h = Harness::new();
        let mut conn = online_pair(&mut h);
        let bytes = h
            .codec
            .pack_control(
                0,
                CTRL_CLOSE,
                b"kicked\nby admin\0junk",
                SecurityToken::UNSUPPORTED,
                false,
            )
            .unwrap();
        let mut packet = h.codec.unpack(&bytes, false).unwrap();
        assert!(!conn.feed(&mut h.io(), &mut packet, client_addr(), SecurityToken::UNKNOWN));
        assert_eq!(conn.state(), ConnState::Error);
        assert_eq!(conn.error_string(), "kicked by admin");

        // the peer already closed, so no CLOSE goes back
        conn.disconnect(&mut h.io(), "whatever");
        assert!(h.sent.is_empty());
        assert_eq!(conn.state(), ConnState::Offline);
        assert_eq!(conn.error_string(), "kicked by admin");
    }

    #[test]
    fn test_block_close_msg_keeps_error_empty() {
        let mut h = Harness::new();
        let config = ConnConfig {
            block_close_msg: true,
            ..Default::default()
        };
        let mut conn = NetConnection::new(config);
        conn.direct_init(
            h.now,
            client_addr(),
            SecurityToken::UNSUPPORTED,
            SecurityToken::UNKNOWN,
            false,
        );
        let bytes = h
            .codec
            .pack_control(0, CTRL_CLOSE, b"spam\0", SecurityToken::UNSUPPORTED, false)
            .unwrap();
        let mut packet = h.codec.unpack(&bytes, false).unwrap();
        conn.feed(&mut h.io(), &mut packet, client_addr(), SecurityToken::UNKNOWN);
        assert_eq!(conn.state(), ConnState::Error);
        assert_eq!(conn.error_string(), "");
    }

    #[test]
    fn test_disconnect_sends_close_with_reason() {
        let mut h = Harness::new();
        let mut conn = online_pair(&mut h);
        conn.disconnect(&mut h.io(), "shutdown");
        let packets = h.take_packets(false);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].control_msg(), Some(CTRL_CLOSE));
        assert_eq!(&packets[0].data[1..], b"shutdown\0");
        assert_eq!(conn.state(), ConnState::Offline);
    }

    #[test]
    fn test_connect_and_accept_are_retried() {
        let mut h = Harness::new();
        let mut client = NetConnection::new(ConnConfig::default());
        client.connect(&mut h.io(), &[server_addr()]).unwrap();
        h.sent.clear();

        h.advance(400);
        client.update(&mut h.io());
        assert!(h.sent.is_empty());
        h.advance(200);
        client.update(&mut h.io());
        assert_eq!(h.take_packets(false)[0].control_msg(), Some(CTRL_CONNECT));

        let mut server = NetConnection::new(ConnConfig::default());
        let connect = h
            .codec
            .pack_control(0, CTRL_CONNECT, &SECURITY_TOKEN_MAGIC, SecurityToken::UNKNOWN, false)
            .unwrap();
        let mut packet = h.codec.unpack(&connect, false).unwrap();
        server.feed(&mut h.io(), &mut packet, client_addr(), SecurityToken(3));
        h.sent.clear();
        h.advance(600);
        server.update(&mut h.io());
        assert_eq!(
            h.take_packets(false)[0].control_msg(),
            Some(CTRL_CONNECTACCEPT)
        );
    }

    #[test]
    fn test_keepalive_after_idle_second() {
        let mut h = Harness::new();
        let mut conn = online_pair(&mut h);
        h.advance(1001);
        conn.update(&mut h.io());
        let packets = h.take_packets(false);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].control_msg(), Some(CTRL_KEEPALIVE));
    }

    #[test]
    fn test_sixup_token_handshake() {
        let mut h = Harness::new();
        let mut client = NetConnection::new(ConnConfig::default());
        client.connect_sixup(&mut h.io(), server_addr()).unwrap();
        assert_eq!(client.state(), ConnState::WantToken);
        let request = h.sent.remove(0).1;
        assert_eq!(
            request.len(),
            PACKET_HEADER_SIZE_SIXUP + 1 + TOKEN_REQUEST_DATA_SIZE
        );
        let client_token = client.sixup_token();
        assert!(client_token.is_concrete());

        let server_token = SecurityToken(0xabcd_0001);
        let reply = h
            .codec
            .pack_control_with_token(client_token, 0, CTRL_TOKEN, server_token, false)
            .unwrap();
        let mut packet = h.codec.unpack(&reply, true).unwrap();
        assert!(client.feed(&mut h.io(), &mut packet, server_addr(), SecurityToken::UNKNOWN));
        assert_eq!(client.state(), ConnState::Connect);
        assert_eq!(client.security_token(), server_token);

        let connect = h.take_packets(true);
        assert_eq!(connect[0].control_msg(), Some(CTRL_CONNECT));
        assert_eq!(connect[0].security_token, server_token);
        assert_eq!(connect[0].response_token, client_token);

        let accept = h
            .codec
            .pack_control(0, CTRL_CONNECTACCEPT, &[], client_token, true)
            .unwrap();
        let mut packet = h.codec.unpack(&accept, true).unwrap();
        assert!(client.feed(&mut h.io(), &mut packet, server_addr(), SecurityToken::UNKNOWN));
        assert_eq!(client.state(), ConnState::Online);
        assert!(h.sent.is_empty());
    }

    #[test]
    fn test_set_timed_out_moves_session() {
        let mut h = Harness::new();
        let mut fresh = NetConnection::new(ConnConfig::default());
        fresh.direct_init(
            h.now,
            client_addr(),
            SecurityToken(55),
            SecurityToken::UNKNOWN,
            false,
        );
        fresh
            .queue_chunk(&mut h.io(), ChunkFlags::VITAL, b"pending")
            .unwrap();

        let mut old = NetConnection::new(ConnConfig::default());
        old.set_timeout_protected(true);
        let session = fresh.take_session().unwrap();
        h.advance(10);
        old.set_timed_out(h.now, session);

        assert_eq!(fresh.state(), ConnState::Offline);
        assert_eq!(old.state(), ConnState::Online);
        assert_eq!(old.peer_addr(), Some(client_addr()));
        assert_eq!(old.security_token(), SecurityToken(55));
        assert_eq!(old.sequence(), 1);
        assert_eq!(old.resend_buffer().len(), 1);
        assert!(old.is_timeout_protected());
    }

    #[test]
    fn test_queue_requires_connection() {
        let mut h = Harness::new();
        let mut conn = NetConnection::new(ConnConfig::default());
        assert!(matches!(
            conn.queue_chunk(&mut h.io(), ChunkFlags::VITAL, b"x"),
            Err(NetError::NotConnected)
        ));
    }
}
