use std::io;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Datagram of {0} bytes is outside the legal size range")]
    InvalidSize(usize),
    #[error("Unexpected end of buffer: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("Buffer overflow: {0} bytes do not fit")]
    Overflow(usize),
    #[error("Invalid packet flags {0:#04x}")]
    InvalidFlags(u8),
    #[error("Invalid chunk count {0}")]
    InvalidChunkCount(usize),
    #[error("Chunk of {0} bytes does not fit its header")]
    InvalidChunkSize(usize),
    #[error("Malformed control packet")]
    InvalidControl,
    #[error("Huffman stream is corrupt")]
    Decompression,
    #[error("Packet would exceed {max} bytes ({size})")]
    TooLarge { size: usize, max: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("Payload of {0} bytes is too big")]
    PayloadTooLarge(usize),
    #[error("Connection is not established")]
    NotConnected,
    #[error("Connection is already in use")]
    AlreadyConnected,
    #[error("Resend buffer is full")]
    ResendBufferFull,
    #[error("No such client slot: {0}")]
    InvalidClient(usize),
    #[error("No address to connect to")]
    NoAddress,
    #[error("No free slot available")]
    NoFreeSlot,
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, NetError>;
