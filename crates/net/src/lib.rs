pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod netban;
pub mod protocol;
pub mod ringbuffer;
pub mod server;
pub mod socket;
pub mod stats;
pub mod stun;
pub mod token_cache;
pub mod unpacker;

pub use client::{ClientState, NetClient};
pub use codec::{ByteReader, ByteWriter, ChunkHeader, Codec, Huffman, PacketConstruct};
pub use config::{BootstrapMap, ClientConfig, ConnConfig, EconConfig, ServerConfig};
pub use connection::{ConnState, Io, MigratedSession, NetConnection};
pub use console::{
    ConsoleConnection, ConsoleEvent, ConsoleExecutor, ConsoleState, Econ, EconClientState,
    NetConsole,
};
pub use error::{NetError, PacketError, Result};
pub use netban::{BanEntry, NetBan, SharedBans};
pub use protocol::{
    ChunkFlags, DEFAULT_PORT, MAX_CLIENTS, MAX_CONSOLE_CLIENTS, MAX_PACKET_SIZE, MAX_PAYLOAD,
    PacketFlags, SecurityToken, SendFlags,
};
pub use ringbuffer::RingBuffer;
pub use server::{NetServer, ServerHooks};
pub use socket::{NetSocket, PacketSink};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use stun::{Connectivity, IpFamily, Stun};
pub use token_cache::TokenCache;
pub use unpacker::{NetChunk, RecvUnpacker};
