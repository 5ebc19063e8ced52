//! Variable-length integers and the message framing legacy game clients
//! expect inside chunks.
//!
//! The first byte holds an extension bit, a sign bit and six value bits;
//! every following byte holds an extension bit and seven value bits.
//! Negative numbers are stored as their bitwise complement.

use crate::error::PacketError;

use super::cursor::{ByteReader, ByteWriter};

const MAX_BYTES: usize = 5;

pub fn pack_int(writer: &mut ByteWriter, value: i32) -> Result<(), PacketError> {
    let mut first = 0u8;
    let mut rest = if value < 0 {
        first |= 0x40;
        !value as u32
    } else {
        value as u32
    };

    first |= (rest & 0x3f) as u8;
    rest >>= 6;
    let mut bytes = [0u8; MAX_BYTES];
    bytes[0] = first;
    let mut len = 1;
    while rest != 0 {
        bytes[len - 1] |= 0x80;
        bytes[len] = (rest & 0x7f) as u8;
        rest >>= 7;
        len += 1;
    }
    writer.write_bytes(&bytes[..len])
}

pub fn unpack_int(reader: &mut ByteReader<'_>) -> Result<i32, PacketError> {
    let first = reader.read_u8()?;
    let negative = first & 0x40 != 0;
    let mut value = (first & 0x3f) as u32;
    let mut byte = first;
    let mut shift = 6;
    for _ in 1..MAX_BYTES {
        if byte & 0x80 == 0 {
            break;
        }
        byte = reader.read_u8()?;
        value |= ((byte & 0x7f) as u32) << shift;
        shift += 7;
    }
    let value = value as i32;
    Ok(if negative { !value } else { value })
}

/// Builds one message: the id with the system bit, then fields.
#[derive(Debug, Clone)]
pub struct MsgPacker {
    writer: ByteWriter,
}

impl MsgPacker {
    pub fn new(msg_id: i32, system: bool, limit: usize) -> Result<Self, PacketError> {
        let mut writer = ByteWriter::with_limit(limit);
        pack_int(&mut writer, (msg_id << 1) | system as i32)?;
        Ok(Self { writer })
    }

    pub fn add_int(mut self, value: i32) -> Result<Self, PacketError> {
        pack_int(&mut self.writer, value)?;
        Ok(self)
    }

    pub fn add_string(mut self, value: &str) -> Result<Self, PacketError> {
        self.writer.write_bytes(value.as_bytes())?;
        self.writer.write_u8(0)?;
        Ok(self)
    }

    pub fn add_raw(mut self, data: &[u8]) -> Result<Self, PacketError> {
        self.writer.write_bytes(data)?;
        Ok(self)
    }

    pub fn data(&self) -> &[u8] {
        self.writer.as_slice()
    }
}

/// Splits the message id word into `(id, system)`.
pub fn unpack_msg_id(reader: &mut ByteReader<'_>) -> Result<(i32, bool), PacketError> {
    let word = unpack_int(reader)?;
    Ok((word >> 1, word & 1 != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: i32) -> Vec<u8> {
        let mut writer = ByteWriter::with_limit(8);
        pack_int(&mut writer, value).unwrap();
        writer.into_inner()
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(-1), vec![0x40]);
        assert_eq!(encode(63), vec![0x3f]);
        assert_eq!(encode(64), vec![0x80, 0x01]);
        assert_eq!(encode(-65), vec![0xc0, 0x01]);
    }

    #[test]
    fn test_extremes_decode() {
        for value in [i32::MIN, i32::MAX, 0x1234_5678, -0x0765_4321, 1 << 20] {
            let bytes = encode(value);
            let mut reader = ByteReader::new(&bytes);
            assert_eq!(unpack_int(&mut reader).unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_msg_packer_layout() {
        let msg = MsgPacker::new(2, true, 64)
            .and_then(|m| m.add_string("dm1"))
            .and_then(|m| m.add_int(5805))
            .unwrap();
        let mut reader = ByteReader::new(msg.data());
        assert_eq!(unpack_msg_id(&mut reader).unwrap(), (2, true));
        assert_eq!(reader.read_bytes(4).unwrap(), b"dm1\0");
        assert_eq!(unpack_int(&mut reader).unwrap(), 5805);
    }
}
