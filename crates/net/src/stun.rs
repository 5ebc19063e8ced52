//! STUN binding probe used to learn our external address.
//!
//! Requests go out over the game socket itself so the discovered mapping is
//! the one peers will see. Each IP family is probed independently.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::codec::ByteReader;
use crate::socket::PacketSink;

pub const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
pub const STUN_HEADER_SIZE: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
/// Attributes below this value must be understood by the receiver.
const COMPREHENSION_OPTIONAL: u16 = 0x8000;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

const MAX_BACKOFF_EXPONENT: u32 = 9;
const UNREACHABLE_TRIES: u32 = 5;
const UNREACHABLE_SILENCE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StunError {
    #[error("STUN message too short ({0} bytes)")]
    TooShort(usize),
    #[error("Unexpected STUN message type {0:#06x}")]
    UnexpectedType(u16),
    #[error("Invalid STUN message length")]
    InvalidLength,
    #[error("STUN magic cookie mismatch")]
    CookieMismatch,
    #[error("STUN transaction id mismatch")]
    TransactionMismatch,
    #[error("Malformed XOR-MAPPED-ADDRESS attribute")]
    InvalidAddress,
    #[error("Unknown comprehension-required attribute {0:#06x}")]
    UnknownAttribute(u16),
    #[error("Success response without a mapped address")]
    MissingAddress,
}

/// Transaction secret of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunData {
    pub secret: [u8; 12],
}

impl StunData {
    pub fn random() -> Self {
        Self {
            secret: rand::random(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunResponse {
    pub success: bool,
    pub addr: Option<SocketAddr>,
}

pub fn prepare_message(data: &StunData) -> [u8; STUN_HEADER_SIZE] {
    let mut message = [0u8; STUN_HEADER_SIZE];
    message[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    message[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    message[8..20].copy_from_slice(&data.secret);
    message
}

/// Cheap check used to route datagrams to the probe before the game codec.
pub fn is_stun_packet(msg: &[u8]) -> bool {
    msg.len() >= STUN_HEADER_SIZE
        && msg[0] & 0xc0 == 0
        && msg[4..8] == STUN_MAGIC_COOKIE.to_be_bytes()
}

pub fn parse_message(msg: &[u8], data: &StunData) -> Result<StunResponse, StunError> {
    if msg.len() < STUN_HEADER_SIZE {
        return Err(StunError::TooShort(msg.len()));
    }

    let kind = u16::from_be_bytes([msg[0], msg[1]]);
    let length = u16::from_be_bytes([msg[2], msg[3]]) as usize;
    let cookie = u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]);
    let transaction = &msg[8..STUN_HEADER_SIZE];

    let success = match kind {
        BINDING_SUCCESS => true,
        BINDING_ERROR => false,
        other => return Err(StunError::UnexpectedType(other)),
    };
    if STUN_HEADER_SIZE + length > msg.len() || length % 4 != 0 {
        return Err(StunError::InvalidLength);
    }
    if cookie != STUN_MAGIC_COOKIE {
        return Err(StunError::CookieMismatch);
    }
    if transaction != data.secret {
        return Err(StunError::TransactionMismatch);
    }

    // bytes past the declared length are ignored
    let mut reader = ByteReader::new(&msg[STUN_HEADER_SIZE..STUN_HEADER_SIZE + length]);
    let mut addr = None;
    while !reader.is_empty() {
        let attr_type = reader.read_u16_be().map_err(|_| StunError::InvalidLength)?;
        let attr_len = reader.read_u16_be().map_err(|_| StunError::InvalidLength)? as usize;
        let value = reader
            .read_bytes(attr_len)
            .map_err(|_| StunError::InvalidLength)?;
        let padding = (4 - attr_len % 4) % 4;
        reader
            .read_bytes(padding.min(reader.remaining()))
            .map_err(|_| StunError::InvalidLength)?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS if success => {
                if addr.is_none() {
                    addr = Some(decode_xor_mapped_address(value, data)?);
                }
            }
            other if other < COMPREHENSION_OPTIONAL => {
                return Err(StunError::UnknownAttribute(other));
            }
            _ => {}
        }
    }

    if !success {
        return Ok(StunResponse {
            success,
            addr: None,
        });
    }
    match addr {
        Some(addr) => Ok(StunResponse {
            success,
            addr: Some(addr),
        }),
        None => Err(StunError::MissingAddress),
    }
}

fn xor_key(data: &StunData) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(&data.secret);
    key
}

fn decode_xor_mapped_address(value: &[u8], data: &StunData) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAddress);
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    let key = xor_key(data);

    let ip = match (family, value.len()) {
        (FAMILY_IPV4, 8) => {
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (FAMILY_IPV6, 20) => {
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAddress),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Encodes `addr` as the value of an XOR-MAPPED-ADDRESS attribute.
pub fn encode_xor_mapped_address(addr: SocketAddr, data: &StunData) -> Vec<u8> {
    let key = xor_key(data);
    let octets = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    let family = if addr.is_ipv4() { FAMILY_IPV4 } else { FAMILY_IPV6 };

    let mut value = vec![0, family];
    value.extend_from_slice(&(addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    value.extend(octets.iter().zip(key.iter()).map(|(a, b)| a ^ b));
    value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: SocketAddr) -> Self {
        if addr.is_ipv4() { Self::V4 } else { Self::V6 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Unknown,
    Checking,
    Unreachable,
    Reachable,
    AddressKnown,
}

#[derive(Debug)]
struct StunProtocol {
    server: Option<SocketAddr>,
    data: StunData,
    next_try: Option<Instant>,
    tries: u32,
    last_response: Option<Instant>,
    addr: Option<SocketAddr>,
}

impl StunProtocol {
    fn new() -> Self {
        Self {
            server: None,
            data: StunData::random(),
            next_try: None,
            tries: 0,
            last_response: None,
            addr: None,
        }
    }

    fn feed_stun_server(&mut self, server: SocketAddr, now: Instant) {
        self.server = Some(server);
        self.data = StunData::random();
        self.next_try = Some(now);
        self.tries = 0;
        self.last_response = None;
        self.addr = None;
    }

    fn refresh(&mut self, now: Instant) {
        if self.server.is_some() {
            self.next_try = Some(now);
        }
    }

    fn update(&mut self, sink: &mut dyn PacketSink, now: Instant) {
        let (Some(server), Some(next_try)) = (self.server, self.next_try) else {
            return;
        };
        if now < next_try {
            return;
        }

        let backoff = 1u64 << self.tries.min(MAX_BACKOFF_EXPONENT);
        self.next_try = Some(now + Duration::from_secs(backoff));
        self.tries += 1;
        sink.send_datagram(server, &prepare_message(&self.data));
        log::debug!("Sent STUN request #{} to {}", self.tries, server);
    }

    fn on_packet(&mut self, from: SocketAddr, msg: &[u8], now: Instant) -> bool {
        if self.server != Some(from) || !is_stun_packet(msg) {
            return false;
        }

        match parse_message(msg, &self.data) {
            Ok(response) => {
                self.last_response = Some(now);
                self.next_try = None;
                if response.success {
                    if self.addr != response.addr {
                        if let Some(addr) = response.addr {
                            log::info!("STUN server {} reports our address as {}", from, addr);
                        }
                    }
                    self.addr = response.addr;
                } else {
                    log::debug!("STUN server {} returned an error response", from);
                }
            }
            Err(e) => log::debug!("Ignoring STUN packet from {}: {}", from, e),
        }
        true
    }

    fn connectivity(&self, now: Instant) -> (Connectivity, Option<SocketAddr>) {
        if self.server.is_none() {
            return (Connectivity::Unknown, None);
        }

        let silent = self
            .last_response
            .is_none_or(|last| now.saturating_duration_since(last) >= UNREACHABLE_SILENCE);
        if self.tries >= UNREACHABLE_TRIES && silent {
            return (Connectivity::Unreachable, None);
        }
        match (self.last_response, self.addr) {
            (None, _) => (Connectivity::Checking, None),
            (Some(_), None) => (Connectivity::Reachable, None),
            (Some(_), Some(addr)) => (Connectivity::AddressKnown, Some(addr)),
        }
    }
}

/// One probe per IP family.
#[derive(Debug)]
pub struct Stun {
    ipv4: StunProtocol,
    ipv6: StunProtocol,
}

impl Default for Stun {
    fn default() -> Self {
        Self::new()
    }
}

impl Stun {
    pub fn new() -> Self {
        Self {
            ipv4: StunProtocol::new(),
            ipv6: StunProtocol::new(),
        }
    }

    fn protocol_mut(&mut self, family: IpFamily) -> &mut StunProtocol {
        match family {
            IpFamily::V4 => &mut self.ipv4,
            IpFamily::V6 => &mut self.ipv6,
        }
    }

    pub fn feed_stun_server(&mut self, server: SocketAddr, now: Instant) {
        self.protocol_mut(IpFamily::of(server))
            .feed_stun_server(server, now);
    }

    pub fn refresh(&mut self, now: Instant) {
        self.ipv4.refresh(now);
        self.ipv6.refresh(now);
    }

    pub fn update(&mut self, sink: &mut dyn PacketSink, now: Instant) {
        self.ipv4.update(sink, now);
        self.ipv6.update(sink, now);
    }

    /// Returns `true` when the datagram was a STUN reply and got consumed.
    pub fn on_packet(&mut self, from: SocketAddr, msg: &[u8], now: Instant) -> bool {
        self.protocol_mut(IpFamily::of(from)).on_packet(from, msg, now)
    }

    pub fn connectivity(&self, family: IpFamily, now: Instant) -> (Connectivity, Option<SocketAddr>) {
        match family {
            IpFamily::V4 => self.ipv4.connectivity(now),
            IpFamily::V6 => self.ipv6.connectivity(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(kind: u16, data: &StunData, attributes: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (attr_type, value) in attributes {
            body.extend_from_slice(&attr_type.to_be_bytes());
            body.extend_from_slice(&(value.len() as u16).to_be_bytes());
            body.extend_from_slice(value);
            body.resize(body.len().div_ceil(4) * 4, 0);
        }
        let mut msg = Vec::new();
        msg.extend_from_slice(&kind.to_be_bytes());
        msg.extend_from_slice(&(body.len() as u16).to_be_bytes());
        msg.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&data.secret);
        msg.extend_from_slice(&body);
        msg
    }

    fn mapped(addr: SocketAddr, data: &StunData) -> Vec<u8> {
        response(
            BINDING_SUCCESS,
            data,
            &[(ATTR_XOR_MAPPED_ADDRESS, encode_xor_mapped_address(addr, data))],
        )
    }

    #[test]
    fn test_prepare_message_layout() {
        let data = StunData { secret: [7; 12] };
        let msg = prepare_message(&data);
        assert_eq!(&msg[0..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&msg[4..8], &[0x21, 0x12, 0xa4, 0x42]);
        assert_eq!(&msg[8..], &[7; 12]);
        assert!(is_stun_packet(&msg));
    }

    #[test]
    fn test_parse_ipv4_address() {
        let data = StunData::random();
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let parsed = parse_message(&mapped(addr, &data), &data).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.addr, Some(addr));
    }

    #[test]
    fn test_parse_ipv6_address() {
        let data = StunData::random();
        let addr: SocketAddr = "[2001:db8::1234]:8303".parse().unwrap();
        let parsed = parse_message(&mapped(addr, &data), &data).unwrap();
        assert_eq!(parsed.addr, Some(addr));
    }

    #[test]
    fn test_known_ipv4_vector() {
        let data = StunData { secret: [0; 12] };
        // 192.0.2.1:32853 from RFC 5769
        let value = vec![0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43];
        let msg = response(BINDING_SUCCESS, &data, &[(ATTR_XOR_MAPPED_ADDRESS, value)]);
        let parsed = parse_message(&msg, &data).unwrap();
        assert_eq!(parsed.addr, Some("192.0.2.1:32853".parse().unwrap()));
    }

    #[test]
    fn test_first_address_wins() {
        let data = StunData::random();
        let first: SocketAddr = "198.51.100.1:1000".parse().unwrap();
        let second: SocketAddr = "198.51.100.2:2000".parse().unwrap();
        let msg = response(
            BINDING_SUCCESS,
            &data,
            &[
                (ATTR_XOR_MAPPED_ADDRESS, encode_xor_mapped_address(first, &data)),
                (ATTR_XOR_MAPPED_ADDRESS, encode_xor_mapped_address(second, &data)),
            ],
        );
        assert_eq!(parse_message(&msg, &data).unwrap().addr, Some(first));
    }

    #[test]
    fn test_rejects_malformed_messages() {
        let data = StunData::random();
        let addr: SocketAddr = "198.51.100.1:1000".parse().unwrap();

        assert_eq!(parse_message(&[0u8; 19], &data), Err(StunError::TooShort(19)));

        let request = prepare_message(&data);
        assert_eq!(
            parse_message(&request, &data),
            Err(StunError::UnexpectedType(BINDING_REQUEST))
        );

        let mut bad_length = mapped(addr, &data);
        bad_length[3] += 4;
        assert_eq!(parse_message(&bad_length, &data), Err(StunError::InvalidLength));

        let mut bad_cookie = mapped(addr, &data);
        bad_cookie[4] ^= 0xff;
        assert_eq!(parse_message(&bad_cookie, &data), Err(StunError::CookieMismatch));

        let other = StunData {
            secret: data.secret.map(|b| b ^ 1),
        };
        assert_eq!(
            parse_message(&mapped(addr, &data), &other),
            Err(StunError::TransactionMismatch)
        );

        let unknown = response(BINDING_SUCCESS, &data, &[(0x0001, vec![0; 4])]);
        assert_eq!(
            parse_message(&unknown, &data),
            Err(StunError::UnknownAttribute(0x0001))
        );

        let empty = response(BINDING_SUCCESS, &data, &[(0x8022, b"soft".to_vec())]);
        assert_eq!(parse_message(&empty, &data), Err(StunError::MissingAddress));

        let short_v6 = response(
            BINDING_SUCCESS,
            &data,
            &[(ATTR_XOR_MAPPED_ADDRESS, vec![0, FAMILY_IPV6, 0, 0, 1, 2, 3, 4])],
        );
        assert_eq!(parse_message(&short_v6, &data), Err(StunError::InvalidAddress));
    }

    #[test]
    fn test_error_response_without_attributes() {
        let data = StunData::random();
        let parsed = parse_message(&response(BINDING_ERROR, &data, &[]), &data).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.addr, None);
    }

    #[test]
    fn test_error_code_attribute_is_rejected() {
        let data = StunData::random();
        let msg = response(BINDING_ERROR, &data, &[(0x0009, vec![0, 0, 4, 0])]);
        assert_eq!(parse_message(&msg, &data), Err(StunError::UnknownAttribute(0x0009)));

        let addr: SocketAddr = "198.51.100.1:1000".parse().unwrap();
        let msg = response(
            BINDING_ERROR,
            &data,
            &[(ATTR_XOR_MAPPED_ADDRESS, encode_xor_mapped_address(addr, &data))],
        );
        assert_eq!(
            parse_message(&msg, &data),
            Err(StunError::UnknownAttribute(ATTR_XOR_MAPPED_ADDRESS))
        );
    }

    #[test]
    fn test_error_code_response_leaves_probe_checking() {
        let server: SocketAddr = "192.0.2.50:3478".parse().unwrap();
        let mut stun = Stun::new();
        let mut sent: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let now = Instant::now();
        stun.feed_stun_server(server, now);
        stun.update(&mut sent, now);

        let secret: [u8; 12] = sent[0].1[8..20].try_into().unwrap();
        let error_code = (0x0009, vec![0, 0, 4, 0]);
        let reply = response(BINDING_ERROR, &StunData { secret }, &[error_code]);
        stun.on_packet(server, &reply, now);
        assert_eq!(stun.connectivity(IpFamily::V4, now).0, Connectivity::Checking);

        stun.update(&mut sent, now + Duration::from_secs(1));
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let data = StunData::random();
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let mut msg = mapped(addr, &data);
        msg.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x01]);
        assert_eq!(parse_message(&msg, &data).unwrap().addr, Some(addr));
    }

    #[test]
    fn test_backoff_and_unreachable() {
        let server: SocketAddr = "192.0.2.50:3478".parse().unwrap();
        let mut stun = Stun::new();
        let mut sent: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let start = Instant::now();

        assert_eq!(
            stun.connectivity(IpFamily::V4, start),
            (Connectivity::Unknown, None)
        );

        stun.feed_stun_server(server, start);
        stun.update(&mut sent, start);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, server);
        assert_eq!(stun.connectivity(IpFamily::V4, start).0, Connectivity::Checking);

        stun.update(&mut sent, start + Duration::from_millis(999));
        assert_eq!(sent.len(), 1);

        // 1s, 2s, 4s, 8s between tries
        let mut now = start;
        for backoff in [1, 2, 4, 8] {
            now += Duration::from_secs(backoff);
            stun.update(&mut sent, now);
        }
        assert_eq!(sent.len(), 5);
        assert_eq!(stun.connectivity(IpFamily::V4, now).0, Connectivity::Unreachable);
        assert_eq!(stun.connectivity(IpFamily::V6, now).0, Connectivity::Unknown);
    }

    #[test]
    fn test_response_from_server_records_address() {
        let server: SocketAddr = "192.0.2.50:3478".parse().unwrap();
        let mut stun = Stun::new();
        let mut sent: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let now = Instant::now();
        stun.feed_stun_server(server, now);
        stun.update(&mut sent, now);

        let secret: [u8; 12] = sent[0].1[8..20].try_into().unwrap();
        let data = StunData { secret };
        let external: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        let reply = mapped(external, &data);

        let stranger: SocketAddr = "192.0.2.51:3478".parse().unwrap();
        assert!(!stun.on_packet(stranger, &reply, now));
        assert!(!stun.on_packet(server, b"not stun at all", now));

        assert!(stun.on_packet(server, &reply, now));
        assert_eq!(
            stun.connectivity(IpFamily::V4, now),
            (Connectivity::AddressKnown, Some(external))
        );

        // no more retries after a response
        stun.update(&mut sent, now + Duration::from_secs(600));
        assert_eq!(sent.len(), 1);

        stun.refresh(now + Duration::from_secs(600));
        stun.update(&mut sent, now + Duration::from_secs(600));
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_error_response_means_reachable() {
        let server: SocketAddr = "192.0.2.50:3478".parse().unwrap();
        let mut stun = Stun::new();
        let mut sent: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let now = Instant::now();
        stun.feed_stun_server(server, now);
        stun.update(&mut sent, now);

        let secret: [u8; 12] = sent[0].1[8..20].try_into().unwrap();
        let reply = response(BINDING_ERROR, &StunData { secret }, &[]);
        assert!(stun.on_packet(server, &reply, now));
        assert_eq!(stun.connectivity(IpFamily::V4, now), (Connectivity::Reachable, None));
    }
}
