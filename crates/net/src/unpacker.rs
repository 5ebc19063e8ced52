use std::net::SocketAddr;

use crate::codec::{ByteReader, ChunkHeader, PacketConstruct};
use crate::connection::NetConnection;
use crate::protocol::{SecurityToken, SendFlags};

/// One message travelling between the application and the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetChunk {
    /// Slot the chunk belongs to; `None` for connectionless traffic.
    pub client_id: Option<usize>,
    pub addr: SocketAddr,
    pub flags: SendFlags,
    pub data: Vec<u8>,
    /// Extra bytes of the extended connectionless framing.
    pub extra: Option<[u8; 4]>,
    /// Token a sixup peer wants its connectionless replies stamped with.
    pub response_token: Option<SecurityToken>,
}

impl NetChunk {
    pub fn connless(addr: SocketAddr, data: impl Into<Vec<u8>>) -> Self {
        Self {
            client_id: None,
            addr,
            flags: SendFlags::CONNLESS,
            data: data.into(),
            extra: None,
            response_token: None,
        }
    }

    pub fn to_client(client_id: usize, addr: SocketAddr, flags: SendFlags, data: impl Into<Vec<u8>>) -> Self {
        Self {
            client_id: Some(client_id),
            addr,
            flags,
            data: data.into(),
            extra: None,
            response_token: None,
        }
    }

    pub fn is_connless(&self) -> bool {
        self.flags.contains(SendFlags::CONNLESS)
    }

    pub fn is_vital(&self) -> bool {
        self.flags.contains(SendFlags::VITAL)
    }
}

/// Yields the chunks of the last packet fed to a connection, enforcing
/// in-order delivery of vital chunks.
#[derive(Debug, Default)]
pub struct RecvUnpacker {
    valid: bool,
    data: Vec<u8>,
    num_chunks: usize,
    current_chunk: usize,
    offset: usize,
    sixup: bool,
    addr: Option<SocketAddr>,
    client_id: Option<usize>,
}

impl RecvUnpacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.valid = false;
    }

    pub fn is_active(&self) -> bool {
        self.valid
    }

    pub fn client_id(&self) -> Option<usize> {
        self.client_id
    }

    pub fn start(
        &mut self,
        addr: SocketAddr,
        packet: PacketConstruct,
        client_id: Option<usize>,
        sixup: bool,
    ) {
        self.addr = Some(addr);
        self.client_id = client_id;
        self.num_chunks = packet.num_chunks;
        self.data = packet.data;
        self.current_chunk = 0;
        self.offset = 0;
        self.sixup = sixup;
        self.valid = true;
    }

    /// Next deliverable chunk. Vital chunks are checked against `conn`:
    /// duplicates are skipped silently and gaps make the connection ask for
    /// a resend.
    pub fn fetch_chunk(&mut self, mut conn: Option<&mut NetConnection>) -> Option<NetChunk> {
        loop {
            if !self.valid || self.current_chunk >= self.num_chunks {
                self.clear();
                return None;
            }
            let addr = self.addr?;

            let mut reader = ByteReader::new(&self.data[self.offset..]);
            let Ok(header) = ChunkHeader::unpack(&mut reader, self.sixup) else {
                self.clear();
                return None;
            };
            self.current_chunk += 1;

            let start = self.offset + reader.position();
            let end = start + header.size;
            if end > self.data.len() {
                self.clear();
                return None;
            }
            self.offset = end;

            let mut flags = SendFlags::empty();
            if header.is_vital() {
                flags |= SendFlags::VITAL;
                if let Some(conn) = conn.as_deref_mut() {
                    if !conn.receive_sequence(header.sequence) {
                        continue;
                    }
                }
            }

            return Some(NetChunk {
                client_id: self.client_id,
                addr,
                flags,
                data: self.data[start..end].to_vec(),
                extra: None,
                response_token: None,
            });
        }
    }
}
