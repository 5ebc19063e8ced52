use std::collections::VecDeque;

use tnet::ServerHooks;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected { client_id: usize, sixup: bool },
    /// A legacy client passed the anti-spoof handshake.
    ClientConnectedNoAuth { client_id: usize },
    ClientRejoined { client_id: usize },
    ClientDisconnected { client_id: usize, reason: String },
}

impl ServerEvent {
    pub fn describe(&self) -> String {
        match self {
            ServerEvent::ClientConnected { client_id, sixup } => format!(
                "client {} connected{}",
                client_id,
                if *sixup { " (sixup)" } else { "" }
            ),
            ServerEvent::ClientConnectedNoAuth { client_id } => {
                format!("client {} connected (legacy)", client_id)
            }
            ServerEvent::ClientRejoined { client_id } => format!("client {} rejoined", client_id),
            ServerEvent::ClientDisconnected { client_id, reason } => {
                format!("client {} left ({})", client_id, reason)
            }
        }
    }
}

/// Collects slot changes reported by the network layer.
#[derive(Debug, Default)]
pub struct EventQueue {
    pending: VecDeque<ServerEvent>,
}

impl EventQueue {
    pub fn drain(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending.drain(..)
    }
}

impl ServerHooks for EventQueue {
    fn new_client(&mut self, client_id: usize, sixup: bool) {
        self.pending
            .push_back(ServerEvent::ClientConnected { client_id, sixup });
    }

    fn new_client_noauth(&mut self, client_id: usize) {
        self.pending
            .push_back(ServerEvent::ClientConnectedNoAuth { client_id });
    }

    fn client_rejoin(&mut self, client_id: usize) {
        self.pending
            .push_back(ServerEvent::ClientRejoined { client_id });
    }

    fn del_client(&mut self, client_id: usize, reason: &str) {
        self.pending.push_back(ServerEvent::ClientDisconnected {
            client_id,
            reason: reason.to_string(),
        });
    }
}
