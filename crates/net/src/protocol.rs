use std::fmt;

use bitflags::bitflags;

pub const MAX_PACKET_SIZE: usize = 1400;
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - 6;
pub const MAX_CHUNK_HEADER_SIZE: usize = 5;
pub const PACKET_HEADER_SIZE: usize = 3;
pub const PACKET_HEADER_SIZE_SIXUP: usize = 7;
pub const MAX_PACKET_CHUNKS: usize = 255;
pub const MAX_CLIENTS: usize = 64;
pub const MAX_CONSOLE_CLIENTS: usize = 4;
pub const MAX_SEQUENCE: u16 = 1 << 10;
pub const SEQUENCE_MASK: u16 = MAX_SEQUENCE - 1;
pub const CONN_BUFFER_SIZE: usize = 32 * 1024;
pub const CONNLIMIT_IPS: usize = 16;
pub const TOKEN_REQUEST_DATA_SIZE: usize = 512;
pub const DEFAULT_PORT: u16 = 8303;

pub const CONNLESS_HEADER_SIZE: usize = 6;
pub const CONNLESS_HEADER_SIZE_SIXUP: usize = 9;
pub const CONNLESS_EXTENDED_MAGIC: [u8; 2] = *b"xe";
pub const SECURITY_TOKEN_MAGIC: [u8; 4] = *b"TKEN";

pub const CTRL_KEEPALIVE: u8 = 0;
pub const CTRL_CONNECT: u8 = 1;
pub const CTRL_CONNECTACCEPT: u8 = 2;
pub const CTRL_ACCEPT: u8 = 3;
pub const CTRL_CLOSE: u8 = 4;
pub const CTRL_TOKEN: u8 = 5;

const HALF_WINDOW: i32 = (MAX_SEQUENCE / 2) as i32;

bitflags! {
    /// Packet header flags as they appear in the upper six bits of byte 0.
    /// `UNUSED` marks a sixup control packet. `EXTENDED` never travels on the
    /// wire; it selects the `"xe"` framing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const UNUSED = 1 << 0;
        const CONTROL = 1 << 2;
        const CONNLESS = 1 << 3;
        const RESEND = 1 << 4;
        const COMPRESSION = 1 << 5;
        const EXTENDED = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChunkFlags: u8 {
        const VITAL = 1 << 0;
        const RESEND = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u8 {
        const VITAL = 1 << 0;
        const CONNLESS = 1 << 1;
        const FLUSH = 1 << 2;
        const EXTENDED = 1 << 3;
    }
}

const SIXUP_CONTROL: u8 = 1;
const SIXUP_RESEND: u8 = 2;
const SIXUP_COMPRESSION: u8 = 4;
const SIXUP_CONNLESS: u8 = 8;

impl PacketFlags {
    pub fn to_sixup(self) -> u8 {
        let mut flags = 0;
        if self.contains(Self::CONTROL) {
            flags |= SIXUP_CONTROL;
        }
        if self.contains(Self::RESEND) {
            flags |= SIXUP_RESEND;
        }
        if self.contains(Self::COMPRESSION) {
            flags |= SIXUP_COMPRESSION;
        }
        if self.contains(Self::CONNLESS) {
            flags |= SIXUP_CONNLESS;
        }
        flags
    }

    pub fn from_sixup(raw: u8) -> Self {
        let mut flags = Self::empty();
        if raw & SIXUP_CONTROL != 0 {
            flags |= Self::CONTROL;
        }
        if raw & SIXUP_RESEND != 0 {
            flags |= Self::RESEND;
        }
        if raw & SIXUP_COMPRESSION != 0 {
            flags |= Self::COMPRESSION;
        }
        if raw & SIXUP_CONNLESS != 0 {
            flags |= Self::CONNLESS;
        }
        flags
    }
}

/// 32-bit anti-spoof token, big-endian on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SecurityToken(pub u32);

impl SecurityToken {
    /// Not negotiated yet. Also the "no token" value of the sixup dialect.
    pub const UNKNOWN: Self = Self(u32::MAX);
    /// The peer does not speak tokens.
    pub const UNSUPPORTED: Self = Self(0);

    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn is_concrete(self) -> bool {
        self != Self::UNKNOWN && self != Self::UNSUPPORTED
    }

    /// Random concrete token.
    pub fn random() -> Self {
        let token = Self(rand::random());
        if token.is_concrete() { token } else { Self(1) }
    }

    /// Token as the signed integer legacy clients echo back in game messages.
    pub fn vanilla(self) -> i32 {
        (self.0 as i32).wrapping_abs()
    }
}

impl fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNKNOWN => f.write_str("SecurityToken(unknown)"),
            Self::UNSUPPORTED => f.write_str("SecurityToken(unsupported)"),
            Self(value) => write!(f, "SecurityToken({:#010x})", value),
        }
    }
}

/// True if `seq` was already acknowledged by `ack`, looking back half a window.
pub fn is_seq_in_backroom(seq: u16, ack: u16) -> bool {
    let seq = seq as i32;
    let ack = ack as i32;
    let bottom = ack - HALF_WINDOW;
    if bottom < 0 {
        seq <= ack || seq >= bottom + MAX_SEQUENCE as i32
    } else {
        seq <= ack && seq >= bottom
    }
}

#[inline]
pub fn next_sequence(seq: u16) -> u16 {
    (seq + 1) % MAX_SEQUENCE
}

/// Replaces control characters with spaces.
pub fn sanitize_cc(text: &str) -> String {
    text.chars()
        .map(|c| if (c as u32) < 32 { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backroom_without_wrap() {
        assert!(is_seq_in_backroom(600, 700));
        assert!(is_seq_in_backroom(700, 700));
        assert!(is_seq_in_backroom(188, 700));
        assert!(!is_seq_in_backroom(187, 700));
        assert!(!is_seq_in_backroom(701, 700));
    }

    #[test]
    fn test_backroom_with_wrap() {
        assert!(is_seq_in_backroom(5, 10));
        assert!(is_seq_in_backroom(1000, 10));
        assert!(is_seq_in_backroom(522, 10));
        assert!(!is_seq_in_backroom(521, 10));
        assert!(!is_seq_in_backroom(11, 10));
    }

    #[test]
    fn test_sequence_wraps() {
        assert_eq!(next_sequence(5), 6);
        assert_eq!(next_sequence(1023), 0);
    }

    #[test]
    fn test_sixup_flag_mapping() {
        let flags = PacketFlags::CONTROL | PacketFlags::COMPRESSION;
        assert_eq!(flags.to_sixup(), 5);
        assert_eq!(PacketFlags::from_sixup(5), flags);
        assert_eq!(PacketFlags::from_sixup(8), PacketFlags::CONNLESS);
    }

    #[test]
    fn test_token_sentinels() {
        assert!(!SecurityToken::UNKNOWN.is_concrete());
        assert!(!SecurityToken::UNSUPPORTED.is_concrete());
        assert!(SecurityToken(42).is_concrete());
        assert_eq!(SecurityToken::from_be_bytes([0, 0, 1, 2]), SecurityToken(258));
        assert_eq!(SecurityToken(0xffff_fffe).vanilla(), 2);
    }

    #[test]
    fn test_sanitize_cc() {
        assert_eq!(sanitize_cc("bye\nnow\t!"), "bye now !");
    }
}
