//! Datagram framing shared by both dialects.
//!
//! Legacy connection-oriented packets carry a 3-byte header followed by the
//! (optionally Huffman-compressed) chunk data, with the security token
//! appended to the data before compression. Sixup packets move the token into
//! bytes 3..7 of a 7-byte header. Connectionless datagrams use one of three
//! framings: six `0xff` bytes, `"xe"` plus four extra bytes, or the sixup
//! flag byte followed by two tokens.

mod chunk;
mod cursor;
mod huffman;
mod packet;
pub mod varint;

pub use chunk::ChunkHeader;
pub use cursor::{ByteReader, ByteWriter};
pub use huffman::{FREQUENCY_TABLE, Huffman};
pub use packet::PacketConstruct;

use crate::error::PacketError;
use crate::protocol::{
    CONNLESS_EXTENDED_MAGIC, CONNLESS_HEADER_SIZE, CONNLESS_HEADER_SIZE_SIXUP, CTRL_CONNECT,
    CTRL_TOKEN, MAX_PACKET_CHUNKS, MAX_PACKET_SIZE, MAX_PAYLOAD, PACKET_HEADER_SIZE,
    PACKET_HEADER_SIZE_SIXUP, PacketFlags, SecurityToken, TOKEN_REQUEST_DATA_SIZE,
};

const TOKEN_SIZE: usize = 4;

/// Stateless packer/unpacker. Holds the Huffman tables, which never change
/// after construction, so one instance is shared by every socket.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    huffman: Huffman,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn huffman(&self) -> &Huffman {
        &self.huffman
    }

    pub fn pack(
        &self,
        packet: &PacketConstruct,
        token: SecurityToken,
        sixup: bool,
        skip_compression: bool,
    ) -> Result<Vec<u8>, PacketError> {
        if packet.num_chunks > MAX_PACKET_CHUNKS {
            return Err(PacketError::InvalidChunkCount(packet.num_chunks));
        }
        let header_size = if sixup {
            PACKET_HEADER_SIZE_SIXUP
        } else {
            PACKET_HEADER_SIZE
        };

        let mut payload = Vec::with_capacity(packet.data.len() + TOKEN_SIZE);
        payload.extend_from_slice(&packet.data);
        if !sixup && token != SecurityToken::UNSUPPORTED {
            // an unknown token is appended too, it advertises token support
            payload.extend_from_slice(&token.to_be_bytes());
        }

        let mut flags = packet.flags - PacketFlags::COMPRESSION - PacketFlags::EXTENDED;
        let compressed = if skip_compression || packet.is_control() {
            None
        } else {
            self.huffman
                .compress(&payload, MAX_PACKET_SIZE - header_size)
                .filter(|compressed| !compressed.is_empty() && compressed.len() < payload.len())
        };
        let body = match compressed {
            Some(compressed) => {
                flags |= PacketFlags::COMPRESSION;
                compressed
            }
            None => payload,
        };

        let size = header_size + body.len();
        if size > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge {
                size,
                max: MAX_PACKET_SIZE,
            });
        }

        let wire_flags = if sixup {
            flags.to_sixup()
        } else {
            flags.bits() & 0x3f
        };
        let mut writer = ByteWriter::with_limit(MAX_PACKET_SIZE);
        writer.write_u8(((wire_flags << 2) & 0xfc) | ((packet.ack >> 8) & 0x3) as u8)?;
        writer.write_u8((packet.ack & 0xff) as u8)?;
        writer.write_u8(packet.num_chunks as u8)?;
        if sixup {
            writer.write_u32_be(token.0)?;
        }
        writer.write_bytes(&body)?;
        Ok(writer.into_inner())
    }

    pub fn unpack(&self, datagram: &[u8], sixup_hint: bool) -> Result<PacketConstruct, PacketError> {
        if datagram.len() < PACKET_HEADER_SIZE || datagram.len() > MAX_PACKET_SIZE {
            return Err(PacketError::InvalidSize(datagram.len()));
        }

        let mut reader = ByteReader::new(datagram);
        let first = reader.read_u8()?;
        let raw_flags = (first & 0xfc) >> 2;
        let mut packet = PacketConstruct::default();

        if raw_flags & PacketFlags::CONNLESS.bits() != 0 {
            let sixup = first & 0x3 == 1;
            let offset = if sixup {
                CONNLESS_HEADER_SIZE_SIXUP
            } else {
                CONNLESS_HEADER_SIZE
            };
            if datagram.len() < offset {
                return Err(PacketError::InvalidSize(datagram.len()));
            }

            packet.flags = PacketFlags::CONNLESS;
            packet.sixup = sixup;
            if sixup {
                packet.security_token = SecurityToken(reader.read_u32_be()?);
                packet.response_token = SecurityToken(reader.read_u32_be()?);
            } else if datagram[..2] == CONNLESS_EXTENDED_MAGIC {
                packet.flags |= PacketFlags::EXTENDED;
                packet.extra.copy_from_slice(&datagram[2..6]);
            }
            packet.data = datagram[offset..].to_vec();
            return Ok(packet);
        }

        let sixup = sixup_hint || raw_flags & PacketFlags::UNUSED.bits() != 0;
        let header_size = if sixup {
            PACKET_HEADER_SIZE_SIXUP
        } else {
            PACKET_HEADER_SIZE
        };
        if datagram.len() < header_size {
            return Err(PacketError::InvalidSize(datagram.len()));
        }

        packet.sixup = sixup;
        packet.flags = if sixup {
            PacketFlags::from_sixup(raw_flags)
        } else {
            PacketFlags::from_bits_retain(raw_flags)
        };
        packet.ack = (((first & 0x3) as u16) << 8) | reader.read_u8()? as u16;
        packet.num_chunks = reader.read_u8()? as usize;
        if sixup {
            packet.security_token = SecurityToken(reader.read_u32_be()?);
        }

        let body = reader.rest();
        if packet.flags.contains(PacketFlags::COMPRESSION) {
            if packet.is_control() {
                return Err(PacketError::InvalidControl);
            }
            packet.data = self.huffman.decompress(body, MAX_PAYLOAD)?;
        } else {
            packet.data = body.to_vec();
        }

        validate_connection_oriented(&packet)?;

        if packet.is_control() && packet.data.len() >= 1 + TOKEN_SIZE {
            let ctrl = packet.data[0];
            if ctrl == CTRL_CONNECT || (sixup && ctrl == CTRL_TOKEN) {
                let mut token = [0u8; TOKEN_SIZE];
                token.copy_from_slice(&packet.data[1..1 + TOKEN_SIZE]);
                packet.response_token = SecurityToken::from_be_bytes(token);
            }
        }

        Ok(packet)
    }

    pub fn pack_control(
        &self,
        ack: u16,
        ctrl: u8,
        extra: &[u8],
        token: SecurityToken,
        sixup: bool,
    ) -> Result<Vec<u8>, PacketError> {
        let packet = PacketConstruct::control(ack, ctrl, extra);
        self.pack(&packet, token, sixup, true)
    }

    /// Sixup control message whose body is our own token, padded to the
    /// token request size when `extended` is set.
    pub fn pack_control_with_token(
        &self,
        token: SecurityToken,
        ack: u16,
        ctrl: u8,
        my_token: SecurityToken,
        extended: bool,
    ) -> Result<Vec<u8>, PacketError> {
        let mut body = vec![0u8; if extended { TOKEN_REQUEST_DATA_SIZE } else { TOKEN_SIZE }];
        body[..TOKEN_SIZE].copy_from_slice(&my_token.to_be_bytes());
        self.pack_control(ack, ctrl, &body, token, true)
    }

    pub fn pack_connless(data: &[u8], extended: Option<[u8; 4]>) -> Result<Vec<u8>, PacketError> {
        let mut writer = ByteWriter::with_limit(MAX_PACKET_SIZE);
        match extended {
            Some(extra) => {
                writer.write_bytes(&CONNLESS_EXTENDED_MAGIC)?;
                writer.write_bytes(&extra)?;
            }
            None => writer.write_bytes(&[0xff; CONNLESS_HEADER_SIZE])?,
        }
        writer.write_bytes(data)?;
        Ok(writer.into_inner())
    }

    pub fn pack_connless_sixup(
        data: &[u8],
        token: SecurityToken,
        response_token: SecurityToken,
    ) -> Result<Vec<u8>, PacketError> {
        let mut writer = ByteWriter::with_limit(MAX_PACKET_SIZE);
        writer.write_u8((PacketFlags::CONNLESS.to_sixup() << 2) | 1)?;
        writer.write_u32_be(token.0)?;
        writer.write_u32_be(response_token.0)?;
        writer.write_bytes(data)?;
        Ok(writer.into_inner())
    }
}

fn validate_connection_oriented(packet: &PacketConstruct) -> Result<(), PacketError> {
    let allowed = PacketFlags::CONTROL | PacketFlags::RESEND | PacketFlags::COMPRESSION;
    if !allowed.contains(packet.flags) {
        return Err(PacketError::InvalidFlags(packet.flags.bits()));
    }

    if packet.is_control() {
        if packet.num_chunks != 0 || packet.data.is_empty() {
            return Err(PacketError::InvalidControl);
        }
        return Ok(());
    }

    let min_chunks = if packet.flags.contains(PacketFlags::RESEND) {
        0
    } else {
        1
    };
    if packet.num_chunks < min_chunks || packet.num_chunks > MAX_PACKET_CHUNKS {
        return Err(PacketError::InvalidChunkCount(packet.num_chunks));
    }
    Ok(())
}
