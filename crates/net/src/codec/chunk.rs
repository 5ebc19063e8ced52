use crate::error::PacketError;
use crate::protocol::{ChunkFlags, SEQUENCE_MASK};

use super::cursor::{ByteReader, ByteWriter};

/// Header preceding every chunk inside a packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: ChunkFlags,
    pub size: usize,
    pub sequence: u16,
}

impl ChunkHeader {
    pub fn new(flags: ChunkFlags, size: usize, sequence: u16) -> Self {
        Self {
            flags,
            size,
            sequence,
        }
    }

    /// Bits of the size stored in the second byte; the rest go in the first.
    pub fn size_split(sixup: bool) -> u32 {
        if sixup { 6 } else { 4 }
    }

    pub fn max_size(sixup: bool) -> usize {
        (1 << (6 + Self::size_split(sixup))) - 1
    }

    pub fn is_vital(&self) -> bool {
        self.flags.contains(ChunkFlags::VITAL)
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_vital() { 3 } else { 2 }
    }

    pub fn pack(&self, writer: &mut ByteWriter, sixup: bool) -> Result<(), PacketError> {
        let split = Self::size_split(sixup);
        let low_mask = (1u16 << split) - 1;
        if self.size > Self::max_size(sixup) {
            return Err(PacketError::InvalidChunkSize(self.size));
        }
        let size = self.size as u16;

        writer.write_u8(((self.flags.bits() & 3) << 6) | ((size >> split) & 0x3f) as u8)?;
        let mut second = (size & low_mask) as u8;
        if self.is_vital() {
            second |= ((self.sequence >> 2) & !low_mask) as u8;
            writer.write_u8(second)?;
            writer.write_u8((self.sequence & 0xff) as u8)?;
        } else {
            writer.write_u8(second)?;
        }
        Ok(())
    }

    pub fn unpack(reader: &mut ByteReader<'_>, sixup: bool) -> Result<Self, PacketError> {
        let split = Self::size_split(sixup);
        let low_mask = (1u16 << split) - 1;

        let first = reader.read_u8()? as u16;
        let second = reader.read_u8()? as u16;
        let flags = ChunkFlags::from_bits_truncate(((first >> 6) & 3) as u8);
        let size = (((first & 0x3f) << split) | (second & low_mask)) as usize;

        let mut sequence = 0;
        if flags.contains(ChunkFlags::VITAL) {
            let low = reader.read_u8()? as u16;
            sequence = (((second & !low_mask & 0xff) << 2) | low) & SEQUENCE_MASK;
        }

        Ok(Self {
            flags,
            size,
            sequence,
        })
    }
}
