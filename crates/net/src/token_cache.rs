//! Connectionless token cache of the sixup dialect.
//!
//! Sixup servers only answer connectionless packets that carry the token
//! they handed out for our address. Sends to a peer whose token is unknown
//! trigger a token request and are parked until the reply arrives.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::codec::Codec;
use crate::connection::Io;
use crate::error::{NetError, Result};
use crate::protocol::{CONNLESS_HEADER_SIZE_SIXUP, CTRL_TOKEN, MAX_PACKET_SIZE, SecurityToken};

#[derive(Debug, Clone)]
struct CachedToken {
    addr: SocketAddr,
    token: SecurityToken,
    expiry: Instant,
}

#[derive(Debug, Clone)]
struct PendingPacket {
    addr: SocketAddr,
    data: Vec<u8>,
    expiry: Instant,
}

#[derive(Debug)]
pub struct TokenCache {
    tokens: Vec<CachedToken>,
    pending: Vec<PendingPacket>,
    /// Response token we attach so peers can answer us.
    our_token: SecurityToken,
    packet_expiry: Duration,
    address_expiry: Duration,
}

impl TokenCache {
    pub fn new(our_token: SecurityToken, packet_expiry: Duration, address_expiry: Duration) -> Self {
        Self {
            tokens: Vec::new(),
            pending: Vec::new(),
            our_token,
            packet_expiry,
            address_expiry,
        }
    }

    pub fn our_token(&self) -> SecurityToken {
        self.our_token
    }

    pub fn token(&self, addr: SocketAddr) -> Option<SecurityToken> {
        self.tokens
            .iter()
            .find(|entry| entry.addr == addr)
            .map(|entry| entry.token)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sends right away when the token for `addr` is known, otherwise asks
    /// for it and buffers the payload.
    pub fn send_packet_connless(
        &mut self,
        io: &mut Io<'_>,
        addr: SocketAddr,
        data: &[u8],
    ) -> Result<()> {
        if data.len() > MAX_PACKET_SIZE - CONNLESS_HEADER_SIZE_SIXUP {
            return Err(NetError::PayloadTooLarge(data.len()));
        }

        if let Some(token) = self.token(addr) {
            let bytes = Codec::pack_connless_sixup(data, token, self.our_token)?;
            io.sink.send_datagram(addr, &bytes);
            return Ok(());
        }

        self.fetch_token(io, addr)?;
        self.pending.push(PendingPacket {
            addr,
            data: data.to_vec(),
            expiry: io.now + self.packet_expiry,
        });
        Ok(())
    }

    pub fn fetch_token(&self, io: &mut Io<'_>, addr: SocketAddr) -> Result<()> {
        let bytes = io.codec.pack_control_with_token(
            SecurityToken::UNKNOWN,
            0,
            CTRL_TOKEN,
            self.our_token,
            true,
        )?;
        io.sink.send_datagram(addr, &bytes);
        Ok(())
    }

    /// Records the token a peer gave us and flushes everything parked for
    /// the same host, whatever port it was addressed to.
    pub fn add_token(&mut self, io: &mut Io<'_>, addr: SocketAddr, token: SecurityToken) {
        if token == SecurityToken::UNKNOWN {
            return;
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|packet| packet.addr.ip() == addr.ip());
        self.pending = waiting;

        for packet in ready {
            match Codec::pack_connless_sixup(&packet.data, token, self.our_token) {
                Ok(bytes) => io.sink.send_datagram(packet.addr, &bytes),
                Err(e) => log::warn!("Dropping buffered packet for {}: {}", packet.addr, e),
            }
        }

        let expiry = io.now + self.address_expiry;
        match self.tokens.iter_mut().find(|entry| entry.addr == addr) {
            Some(entry) => {
                entry.token = token;
                entry.expiry = expiry;
            }
            None => self.tokens.push(CachedToken {
                addr,
                token,
                expiry,
            }),
        }
    }

    pub fn update(&mut self, now: Instant) {
        self.pending.retain(|packet| packet.expiry > now);
        self.tokens.retain(|entry| entry.expiry > now);
    }
}
