use std::net::SocketAddr;
use std::time::Instant;

use super::{ConsoleEvent, NetConsole};
use crate::config::EconConfig;
use crate::error::{NetError, Result};
use crate::netban::SharedBans;
use crate::protocol::MAX_CONSOLE_CLIENTS;

pub const MAX_AUTH_TRIES: u32 = 3;

/// Runs command lines from authenticated console clients.
pub trait ConsoleExecutor {
    /// Executes `line` on behalf of `client_id` and returns the output
    /// lines to send back to it.
    fn execute_line(&mut self, client_id: usize, line: &str) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EconClientState {
    Empty,
    Connected,
    Authed,
}

#[derive(Debug, Clone, Copy)]
struct EconClient {
    state: EconClientState,
    connected_at: Instant,
    auth_tries: u32,
}

impl EconClient {
    fn empty() -> Self {
        Self {
            state: EconClientState::Empty,
            connected_at: Instant::now(),
            auth_tries: 0,
        }
    }
}

/// Password protected external console.
pub struct Econ {
    console: NetConsole,
    clients: [EconClient; MAX_CONSOLE_CLIENTS],
    config: EconConfig,
    bans: SharedBans,
}

impl Econ {
    pub fn open(bind: SocketAddr, config: EconConfig, bans: SharedBans) -> Result<Self> {
        let console = NetConsole::open(bind, Some(bans.clone()))?;
        Ok(Self {
            console,
            clients: [EconClient::empty(); MAX_CONSOLE_CLIENTS],
            config,
            bans,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.console.local_addr()
    }

    pub fn client_state(&self, client_id: usize) -> EconClientState {
        self.clients
            .get(client_id)
            .map_or(EconClientState::Empty, |client| client.state)
    }

    pub fn client_addr(&self, client_id: usize) -> Option<SocketAddr> {
        self.console.client_addr(client_id)
    }

    pub fn update(&mut self, executor: &mut dyn ConsoleExecutor) {
        let now = Instant::now();

        for event in self.console.update() {
            match event {
                ConsoleEvent::Connected(client_id) => self.on_connected(client_id, now),
                ConsoleEvent::Disconnected { client_id, reason } => {
                    log::info!("Econ client {} dropped: {}", client_id, reason);
                    self.clients[client_id] = EconClient::empty();
                }
            }
        }
        self.drop_banned(now);

        while let Some((client_id, line)) = self.console.recv() {
            match self.clients[client_id].state {
                EconClientState::Connected => self.on_password(client_id, &line, now),
                EconClientState::Authed => {
                    log::debug!("Econ cid={} cmd='{}'", client_id, line);
                    for output in executor.execute_line(client_id, &line) {
                        self.send_to(client_id, &output);
                    }
                }
                EconClientState::Empty => {
                    log::warn!("Econ line from empty slot {}", client_id);
                }
            }
        }

        for client_id in 0..MAX_CONSOLE_CLIENTS {
            let client = self.clients[client_id];
            if client.state == EconClientState::Connected
                && now.saturating_duration_since(client.connected_at) > self.config.auth_timeout
            {
                self.disconnect(client_id, "authentication timeout");
            }
        }
    }

    /// Sends `line` to an authenticated client.
    pub fn send(&mut self, client_id: usize, line: &str) -> Result<()> {
        match self.clients.get(client_id) {
            None => Err(NetError::InvalidClient(client_id)),
            Some(client) if client.state != EconClientState::Authed => Err(NetError::NotConnected),
            Some(_) => self.console.send(client_id, line),
        }
    }

    /// Sends `line` to every authenticated client.
    pub fn broadcast(&mut self, line: &str) {
        for client_id in 0..MAX_CONSOLE_CLIENTS {
            if self.clients[client_id].state == EconClientState::Authed {
                self.send_to(client_id, line);
            }
        }
    }

    pub fn logout(&mut self, client_id: usize) -> Result<()> {
        self.drop_client(client_id, "Logout")
    }

    pub fn drop_client(&mut self, client_id: usize, reason: &str) -> Result<()> {
        match self.clients.get(client_id) {
            None => Err(NetError::InvalidClient(client_id)),
            Some(client) if client.state == EconClientState::Empty => Err(NetError::NotConnected),
            Some(_) => {
                self.disconnect(client_id, reason);
                Ok(())
            }
        }
    }

    fn on_connected(&mut self, client_id: usize, now: Instant) {
        log::info!(
            "Econ client accepted. cid={} addr={:?}",
            client_id,
            self.console.client_addr(client_id)
        );
        self.clients[client_id] = EconClient {
            state: EconClientState::Connected,
            connected_at: now,
            auth_tries: 0,
        };
        self.send_to(client_id, "Enter password:");
    }

    fn on_password(&mut self, client_id: usize, line: &str, now: Instant) {
        if line == self.config.password {
            self.clients[client_id].state = EconClientState::Authed;
            self.send_to(
                client_id,
                "Authentication successful. External console access granted.",
            );
            log::info!("Econ cid={} authed", client_id);
            return;
        }

        self.clients[client_id].auth_tries += 1;
        let tries = self.clients[client_id].auth_tries;
        self.send_to(
            client_id,
            &format!("Wrong password {}/{}.", tries, MAX_AUTH_TRIES),
        );
        if tries < MAX_AUTH_TRIES {
            return;
        }

        if self.config.ban_time.is_zero() {
            self.disconnect(client_id, "Too many authentication tries");
        } else if let Some(addr) = self.console.client_addr(client_id) {
            self.bans.borrow_mut().ban_addr(
                addr.ip(),
                self.config.ban_time,
                "Too many authentication tries",
                now,
            );
            self.drop_banned(now);
        }
    }

    fn drop_banned(&mut self, now: Instant) {
        for client_id in 0..MAX_CONSOLE_CLIENTS {
            if self.clients[client_id].state == EconClientState::Empty {
                continue;
            }
            let Some(addr) = self.console.client_addr(client_id) else {
                continue;
            };
            let reason = self.bans.borrow().is_banned(addr.ip(), now);
            if let Some(reason) = reason {
                self.disconnect(client_id, &reason);
            }
        }
    }

    fn send_to(&mut self, client_id: usize, line: &str) {
        if let Err(e) = self.console.send(client_id, line) {
            log::debug!("Econ send to {} failed: {}", client_id, e);
        }
    }

    fn disconnect(&mut self, client_id: usize, reason: &str) {
        if let Err(e) = self.console.drop_client(client_id, reason) {
            log::debug!("Econ drop of {} failed: {}", client_id, e);
        }
        self.clients[client_id] = EconClient::empty();
    }
}
