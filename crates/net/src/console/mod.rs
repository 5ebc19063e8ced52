//! Plain-text remote console over TCP.

mod connection;
mod econ;

pub use connection::{ConsoleConnection, ConsoleState};
pub use econ::{ConsoleExecutor, Econ, EconClientState, MAX_AUTH_TRIES};

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Instant;

use crate::error::{NetError, Result};
use crate::netban::SharedBans;
use crate::protocol::{MAX_CONSOLE_CLIENTS, MAX_PACKET_SIZE};

/// Slot changes observed during [`NetConsole::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Connected(usize),
    Disconnected { client_id: usize, reason: String },
}

/// Accepts console clients into a fixed set of slots and splits their input
/// into lines.
pub struct NetConsole {
    listener: TcpListener,
    slots: Vec<ConsoleConnection>,
    bans: Option<SharedBans>,
}

impl NetConsole {
    pub fn open(bind: SocketAddr, bans: Option<SharedBans>) -> Result<Self> {
        let listener = TcpListener::bind(bind).map_err(|source| NetError::Bind {
            addr: bind.to_string(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        log::info!("Console listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            slots: (0..MAX_CONSOLE_CLIENTS)
                .map(|_| ConsoleConnection::new())
                .collect(),
            bans,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn bans(&self) -> Option<&SharedBans> {
        self.bans.as_ref()
    }

    pub fn client_addr(&self, client_id: usize) -> Option<SocketAddr> {
        self.slots.get(client_id).and_then(|slot| slot.peer_addr())
    }

    pub fn state(&self, client_id: usize) -> ConsoleState {
        self.slots
            .get(client_id)
            .map_or(ConsoleState::Offline, |slot| slot.state())
    }

    /// Accepts pending clients, reads their sockets and drops those whose
    /// connection failed.
    pub fn update(&mut self) -> Vec<ConsoleEvent> {
        let mut events = Vec::new();

        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Some(client_id) = self.accept(stream, addr) {
                        events.push(ConsoleEvent::Connected(client_id));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("Console accept failed: {}", e);
                    break;
                }
            }
        }

        for client_id in 0..self.slots.len() {
            self.slots[client_id].update();
            if self.slots[client_id].state() == ConsoleState::Error {
                let reason = self.slots[client_id].error_string().to_string();
                self.disconnect(client_id, &reason);
                events.push(ConsoleEvent::Disconnected { client_id, reason });
            }
        }

        events
    }

    /// Next complete line from any online client.
    pub fn recv(&mut self) -> Option<(usize, String)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.state() == ConsoleState::Online)
            .find_map(|(client_id, slot)| {
                slot.recv(MAX_PACKET_SIZE - 1).map(|line| (client_id, line))
            })
    }

    pub fn send(&mut self, client_id: usize, line: &str) -> Result<()> {
        self.slots
            .get_mut(client_id)
            .ok_or(NetError::InvalidClient(client_id))?
            .send(line)
    }

    /// Sends `reason` to the client and closes its slot.
    pub fn drop_client(&mut self, client_id: usize, reason: &str) -> Result<()> {
        let state = self
            .slots
            .get(client_id)
            .ok_or(NetError::InvalidClient(client_id))?
            .state();
        if state == ConsoleState::Offline {
            return Err(NetError::NotConnected);
        }
        self.disconnect(client_id, reason);
        Ok(())
    }

    fn disconnect(&mut self, client_id: usize, reason: &str) {
        log::info!(
            "Console client {} ({:?}) dropped: {}",
            client_id,
            self.slots[client_id].peer_addr(),
            reason
        );
        self.slots[client_id].disconnect(reason);
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) -> Option<usize> {
        if let Some(bans) = &self.bans {
            let reason = bans.borrow().is_banned(addr.ip(), Instant::now());
            if let Some(reason) = reason {
                log::debug!("Refusing banned console client {}", addr);
                reject(stream, &reason);
                return None;
            }
        }

        let mut free = None;
        for (client_id, slot) in self.slots.iter().enumerate() {
            match slot.peer_addr() {
                Some(peer) if slot.state() != ConsoleState::Offline => {
                    if peer.ip() == addr.ip() {
                        reject(stream, "only one client per IP allowed");
                        return None;
                    }
                }
                _ => {
                    if free.is_none() {
                        free = Some(client_id);
                    }
                }
            }
        }

        let Some(client_id) = free else {
            reject(stream, "no free slot available");
            return None;
        };
        if let Err(e) = self.slots[client_id].init(stream, addr) {
            log::warn!("Could not set up console client {}: {}", addr, e);
            return None;
        }
        log::info!("Console client {} connected from {}", client_id, addr);
        Some(client_id)
    }
}

fn reject(mut stream: TcpStream, reason: &str) {
    if let Err(e) = stream.write_all(reason.as_bytes()) {
        log::debug!("Could not send console rejection: {}", e);
    }
    let _ = stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use super::*;
    use crate::netban::NetBan;

    fn console(bans: Option<SharedBans>) -> (NetConsole, SocketAddr) {
        let console = NetConsole::open("127.0.0.1:0".parse().unwrap(), bans).unwrap();
        let addr = console.local_addr().unwrap();
        (console, addr)
    }

    fn wait_event(console: &mut NetConsole) -> Vec<ConsoleEvent> {
        for _ in 0..500 {
            let events = console.update();
            if !events.is_empty() {
                return events;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Vec::new()
    }

    fn read_all(mut stream: TcpStream) -> String {
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_accept_and_receive_line() {
        let (mut console, addr) = console(None);
        let mut client = TcpStream::connect(addr).unwrap();
        assert_eq!(wait_event(&mut console), vec![ConsoleEvent::Connected(0)]);
        assert_eq!(console.state(0), ConsoleState::Online);

        client.write_all(b"status\n").unwrap();
        let mut line = None;
        for _ in 0..500 {
            console.update();
            line = console.recv();
            if line.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(line, Some((0, "status".to_string())));
    }

    #[test]
    fn test_one_client_per_ip() {
        let (mut console, addr) = console(None);
        let _first = TcpStream::connect(addr).unwrap();
        assert_eq!(wait_event(&mut console), vec![ConsoleEvent::Connected(0)]);

        let second = TcpStream::connect(addr).unwrap();
        for _ in 0..50 {
            console.update();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(read_all(second), "only one client per IP allowed");
    }

    #[test]
    fn test_banned_client_is_refused() {
        let bans = NetBan::shared();
        bans.borrow_mut().ban_addr(
            "127.0.0.1".parse().unwrap(),
            Duration::ZERO,
            "go away",
            Instant::now(),
        );
        let (mut console, addr) = console(Some(bans));
        let client = TcpStream::connect(addr).unwrap();
        for _ in 0..50 {
            assert!(console.update().is_empty());
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(read_all(client).contains("go away"));
        assert_eq!(console.state(0), ConsoleState::Offline);
    }

    #[test]
    fn test_drop_and_remote_close() {
        let (mut console, addr) = console(None);
        let client = TcpStream::connect(addr).unwrap();
        wait_event(&mut console);

        console.drop_client(0, "kicked").unwrap();
        assert_eq!(read_all(client), "kicked\n");
        assert!(matches!(
            console.drop_client(0, "again"),
            Err(NetError::NotConnected)
        ));
        assert!(matches!(
            console.send(9, "x"),
            Err(NetError::InvalidClient(9))
        ));

        let client = TcpStream::connect(addr).unwrap();
        assert_eq!(wait_event(&mut console), vec![ConsoleEvent::Connected(0)]);
        drop(client);
        assert_eq!(
            wait_event(&mut console),
            vec![ConsoleEvent::Disconnected {
                client_id: 0,
                reason: "remote end closed the connection".to_string(),
            }]
        );
    }
}
