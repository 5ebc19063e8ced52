use crate::protocol::{PacketFlags, SecurityToken};

/// One datagram in decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketConstruct {
    pub flags: PacketFlags,
    pub ack: u16,
    pub num_chunks: usize,
    pub data: Vec<u8>,
    pub extra: [u8; 4],
    /// Set when the datagram used the sixup framing.
    pub sixup: bool,
    /// Inline header token of the sixup dialect.
    pub security_token: SecurityToken,
    /// Token the peer wants us to answer with.
    pub response_token: SecurityToken,
}

impl Default for PacketConstruct {
    fn default() -> Self {
        Self {
            flags: PacketFlags::empty(),
            ack: 0,
            num_chunks: 0,
            data: Vec::new(),
            extra: [0; 4],
            sixup: false,
            security_token: SecurityToken::UNKNOWN,
            response_token: SecurityToken::UNKNOWN,
        }
    }
}

impl PacketConstruct {
    pub fn control(ack: u16, ctrl: u8, extra: &[u8]) -> Self {
        let mut data = Vec::with_capacity(1 + extra.len());
        data.push(ctrl);
        data.extend_from_slice(extra);
        Self {
            flags: PacketFlags::CONTROL,
            ack,
            data,
            ..Default::default()
        }
    }

    pub fn is_control(&self) -> bool {
        self.flags.contains(PacketFlags::CONTROL)
    }

    pub fn is_connless(&self) -> bool {
        self.flags.contains(PacketFlags::CONNLESS)
    }

    /// Leading control message byte, if this is a control packet.
    pub fn control_msg(&self) -> Option<u8> {
        if self.is_control() {
            self.data.first().copied()
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.flags = PacketFlags::empty();
        self.ack = 0;
        self.num_chunks = 0;
        self.data.clear();
        self.extra = [0; 4];
    }
}
