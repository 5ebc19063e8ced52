//! Anti-spoof handshake for legacy clients without token support.
//!
//! The client gets a tiny map plus three empty snapshots whose tick is a
//! per-address nonce. A real client acknowledges that tick in its first
//! input message; a spoofed source never sees it.

use std::time::{Duration, Instant};

use crate::codec::varint::{MsgPacker, unpack_int, unpack_msg_id};
use crate::codec::{ByteReader, ByteWriter, ChunkHeader, Codec, PacketConstruct};
use crate::config::BootstrapMap;
use crate::error::PacketError;
use crate::protocol::{ChunkFlags, MAX_PAYLOAD, SecurityToken};

pub const NETMSG_MAP_CHANGE: i32 = 2;
pub const NETMSG_MAP_DATA: i32 = 3;
pub const NETMSG_CON_READY: i32 = 4;
pub const NETMSG_SNAPEMPTY: i32 = 6;
pub const NETMSG_INPUT: i32 = 16;

pub const FALLBACK_MAP_NAME: &str = "dm1";
pub const FALLBACK_MAP_CRC: u32 = 0xf215_9e6e;
pub const FALLBACK_MAP_SIZE: i32 = 5805;

const SNAPEMPTY_COUNT: usize = 3;
const FLOOD_WINDOW: Duration = Duration::from_secs(1);

/// Counts handshakes per second.
#[derive(Debug, Default)]
pub struct FloodGuard {
    first: Option<Instant>,
    count: u32,
}

impl FloodGuard {
    /// Records one handshake and reports whether the server was already
    /// flooded before it. A zero limit disables detection.
    pub fn register(&mut self, now: Instant, per_second: u32) -> bool {
        if per_second == 0 {
            return false;
        }

        let expired = self
            .first
            .is_none_or(|first| now.saturating_duration_since(first) > FLOOD_WINDOW);
        if expired {
            self.first = Some(now);
            self.count = 0;
        }

        let flooding = self.count > per_second;
        self.count += 1;
        flooding
    }
}

/// Builds the single datagram carrying the six vital handshake chunks.
/// `map` is `None` under flood or when no bootstrap map is configured.
pub fn build_handshake(
    codec: &Codec,
    map: Option<&BootstrapMap>,
    token: i32,
) -> Result<Vec<u8>, PacketError> {
    let (map_change, map_data) = match map {
        Some(map) => {
            let size = map.data.len() as i32;
            (
                MsgPacker::new(NETMSG_MAP_CHANGE, true, MAX_PAYLOAD)?
                    .add_string(&map.name)?
                    .add_int(map.crc as i32)?
                    .add_int(size)?,
                MsgPacker::new(NETMSG_MAP_DATA, true, MAX_PAYLOAD)?
                    .add_int(1)?
                    .add_int(map.crc as i32)?
                    .add_int(0)?
                    .add_int(size)?
                    .add_raw(&map.data)?,
            )
        }
        None => (
            MsgPacker::new(NETMSG_MAP_CHANGE, true, MAX_PAYLOAD)?
                .add_string(FALLBACK_MAP_NAME)?
                .add_int(FALLBACK_MAP_CRC as i32)?
                .add_int(FALLBACK_MAP_SIZE)?,
            MsgPacker::new(NETMSG_MAP_DATA, true, MAX_PAYLOAD)?
                .add_int(1)?
                .add_int(0)?
                .add_int(0)?
                .add_int(0)?,
        ),
    };
    let con_ready = MsgPacker::new(NETMSG_CON_READY, true, MAX_PAYLOAD)?;
    let snap = MsgPacker::new(NETMSG_SNAPEMPTY, true, MAX_PAYLOAD)?
        .add_int(token)?
        .add_int(token.wrapping_add(1))?;

    let mut messages = vec![map_change, map_data, con_ready];
    messages.extend(std::iter::repeat_n(snap, SNAPEMPTY_COUNT));

    let mut writer = ByteWriter::with_limit(MAX_PAYLOAD);
    for (sequence, message) in (1u16..).zip(&messages) {
        let data = message.data();
        if data.len() > ChunkHeader::max_size(false) {
            return Err(PacketError::TooLarge {
                size: data.len(),
                max: ChunkHeader::max_size(false),
            });
        }
        ChunkHeader::new(ChunkFlags::VITAL, data.len(), sequence).pack(&mut writer, false)?;
        writer.write_bytes(data)?;
    }

    let packet = PacketConstruct {
        num_chunks: messages.len(),
        data: writer.into_inner(),
        ..Default::default()
    };
    codec.pack(&packet, SecurityToken::UNSUPPORTED, false, false)
}

/// Tick acknowledged by the first chunk, if it is a system input message.
pub fn input_ack_token(packet: &PacketConstruct) -> Option<i32> {
    let mut reader = ByteReader::new(&packet.data);
    let header = ChunkHeader::unpack(&mut reader, false).ok()?;
    let body = reader.read_bytes(header.size).ok()?;

    let mut reader = ByteReader::new(body);
    match unpack_msg_id(&mut reader).ok()? {
        (NETMSG_INPUT, true) => unpack_int(&mut reader).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(codec: &Codec, datagram: &[u8]) -> Vec<(ChunkHeader, Vec<u8>)> {
        let packet = codec.unpack(datagram, false).unwrap();
        let mut reader = ByteReader::new(&packet.data);
        let mut out = Vec::new();
        for _ in 0..packet.num_chunks {
            let header = ChunkHeader::unpack(&mut reader, false).unwrap();
            out.push((header, reader.read_bytes(header.size).unwrap().to_vec()));
        }
        assert!(reader.is_empty());
        out
    }

    #[test]
    fn test_fallback_handshake_layout() {
        let codec = Codec::new();
        let datagram = build_handshake(&codec, None, 4242).unwrap();
        let chunks = chunks(&codec, &datagram);

        assert_eq!(chunks.len(), 6);
        for (i, (header, _)) in chunks.iter().enumerate() {
            assert!(header.is_vital());
            assert_eq!(header.sequence as usize, i + 1);
        }

        let mut reader = ByteReader::new(&chunks[0].1);
        assert_eq!(unpack_msg_id(&mut reader).unwrap(), (NETMSG_MAP_CHANGE, true));
        assert_eq!(reader.read_bytes(4).unwrap(), b"dm1\0");
        assert_eq!(unpack_int(&mut reader).unwrap(), FALLBACK_MAP_CRC as i32);
        assert_eq!(unpack_int(&mut reader).unwrap(), FALLBACK_MAP_SIZE);

        let mut reader = ByteReader::new(&chunks[2].1);
        assert_eq!(unpack_msg_id(&mut reader).unwrap(), (NETMSG_CON_READY, true));
        assert!(reader.is_empty());

        for (_, body) in &chunks[3..] {
            let mut reader = ByteReader::new(body);
            assert_eq!(unpack_msg_id(&mut reader).unwrap(), (NETMSG_SNAPEMPTY, true));
            assert_eq!(unpack_int(&mut reader).unwrap(), 4242);
            assert_eq!(unpack_int(&mut reader).unwrap(), 4243);
        }
    }

    #[test]
    fn test_configured_map_is_sent() {
        let codec = Codec::new();
        let map = BootstrapMap {
            name: "tiny".to_string(),
            crc: 0xdead_beef,
            data: vec![7u8; 200],
        };
        let datagram = build_handshake(&codec, Some(&map), 1).unwrap();
        let chunks = chunks(&codec, &datagram);

        let mut reader = ByteReader::new(&chunks[1].1);
        assert_eq!(unpack_msg_id(&mut reader).unwrap(), (NETMSG_MAP_DATA, true));
        assert_eq!(unpack_int(&mut reader).unwrap(), 1);
        assert_eq!(unpack_int(&mut reader).unwrap(), 0xdead_beef_u32 as i32);
        assert_eq!(unpack_int(&mut reader).unwrap(), 0);
        assert_eq!(unpack_int(&mut reader).unwrap(), 200);
        assert_eq!(reader.rest(), &[7u8; 200][..]);
    }

    #[test]
    fn test_oversized_map_is_rejected() {
        let codec = Codec::new();
        let map = BootstrapMap {
            name: "huge".to_string(),
            crc: 0,
            data: vec![0u8; 1100],
        };
        assert!(build_handshake(&codec, Some(&map), 1).is_err());
    }

    #[test]
    fn test_input_token_extraction() {
        let input = MsgPacker::new(NETMSG_INPUT, true, 64)
            .and_then(|m| m.add_int(-77))
            .and_then(|m| m.add_int(3))
            .unwrap();
        let mut writer = ByteWriter::with_limit(128);
        ChunkHeader::new(ChunkFlags::VITAL, input.data().len(), 1)
            .pack(&mut writer, false)
            .unwrap();
        writer.write_bytes(input.data()).unwrap();
        let packet = PacketConstruct {
            num_chunks: 1,
            data: writer.into_inner(),
            ..Default::default()
        };
        assert_eq!(input_ack_token(&packet), Some(-77));

        let other = MsgPacker::new(NETMSG_INPUT, false, 64)
            .and_then(|m| m.add_int(-77))
            .unwrap();
        let mut writer = ByteWriter::with_limit(128);
        ChunkHeader::new(ChunkFlags::empty(), other.data().len(), 0)
            .pack(&mut writer, false)
            .unwrap();
        writer.write_bytes(other.data()).unwrap();
        let packet = PacketConstruct {
            num_chunks: 1,
            data: writer.into_inner(),
            ..Default::default()
        };
        assert_eq!(input_ack_token(&packet), None);
    }

    #[test]
    fn test_flood_guard() {
        let mut guard = FloodGuard::default();
        let now = Instant::now();

        for _ in 0..4 {
            assert!(!guard.register(now, 3));
        }
        assert!(guard.register(now, 3));
        assert!(!guard.register(now + Duration::from_secs(2), 3));
        assert!(!guard.register(now, 0));
    }
}
