use crate::error::PacketError;

/// Bounds-checked reader over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, PacketError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, PacketError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < len {
            return Err(PacketError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.pos..];
        self.pos = self.data.len();
        bytes
    }
}

/// Writer that refuses to grow past a fixed capacity.
#[derive(Debug, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
    limit: usize,
}

impl ByteWriter {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), PacketError> {
        self.write_bytes(&[value])
    }

    pub fn write_u16_be(&mut self, value: u16) -> Result<(), PacketError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u32_be(&mut self, value: u32) -> Result<(), PacketError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        if bytes.len() > self.remaining() {
            return Err(PacketError::Overflow(bytes.len()));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
