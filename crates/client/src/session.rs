use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use tnet::{ClientState, Connectivity, IpFamily, NetChunk, NetClient, SendFlags};

const TICK: Duration = Duration::from_millis(5);

/// What a line typed by the user asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Send(String),
    Stun,
    Quit,
}

impl Input {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line.trim() {
            "" => None,
            "/quit" => Some(Input::Quit),
            "/stun" => Some(Input::Stun),
            _ => Some(Input::Send(line.to_string())),
        }
    }
}

/// Resolves every `host:port` to its first address.
pub fn resolve(servers: &[String]) -> Result<Vec<SocketAddr>> {
    servers
        .iter()
        .map(|server| {
            server
                .to_socket_addrs()
                .with_context(|| format!("Failed to resolve {}", server))?
                .next()
                .with_context(|| format!("No address for {}", server))
        })
        .collect()
}

/// Reads stdin on a background thread so the network loop never blocks.
pub fn spawn_stdin_reader() -> Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if sender.send(line).is_err() {
                break;
            }
        }
    });
    receiver
}

pub struct Session {
    client: NetClient,
    connect_timeout: Duration,
}

impl Session {
    pub fn new(client: NetClient, connect_timeout: Duration) -> Self {
        Self {
            client,
            connect_timeout,
        }
    }

    /// Runs until the user quits, stdin closes or the server goes away.
    pub fn run(&mut self, input: Receiver<String>) -> Result<()> {
        let started = Instant::now();
        let mut was_online = false;

        loop {
            self.client.wait(TICK)?;
            self.client.update();
            while let Some(chunk) = self.client.recv()? {
                print_chunk(&chunk);
            }

            match self.client.state() {
                ClientState::Online if !was_online => {
                    was_online = true;
                    log::info!("Connected to {:?}", self.client.server_address());
                }
                ClientState::Offline if was_online => {
                    bail!("Disconnected: {}", self.client.error_string());
                }
                ClientState::Offline => {
                    bail!("Connection failed: {}", self.client.error_string());
                }
                ClientState::Connecting if started.elapsed() > self.connect_timeout => {
                    self.client.disconnect("Connection timed out");
                    bail!("No answer from server");
                }
                _ => {}
            }

            loop {
                let line = match input.try_recv() {
                    Ok(line) => line,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.client.disconnect("Leaving");
                        return Ok(());
                    }
                };
                match Input::parse(&line) {
                    Some(Input::Quit) => {
                        self.client.disconnect("Leaving");
                        return Ok(());
                    }
                    Some(Input::Stun) => self.report_stun(),
                    Some(Input::Send(text)) => self.send_line(&text)?,
                    None => {}
                }
            }
        }
    }

    fn send_line(&mut self, text: &str) -> Result<()> {
        if self.client.state() != ClientState::Online {
            log::warn!("Not connected yet, dropping line");
            return Ok(());
        }
        let Some(server) = self.client.server_address() else {
            return Ok(());
        };
        let chunk = NetChunk::to_client(
            0,
            server,
            SendFlags::VITAL | SendFlags::FLUSH,
            text.as_bytes().to_vec(),
        );
        self.client.send(&chunk).context("Failed to send line")
    }

    fn report_stun(&self) {
        for family in [IpFamily::V4, IpFamily::V6] {
            match self.client.connectivity(family) {
                (Connectivity::AddressKnown, Some(addr)) => {
                    println!("{:?}: reachable as {}", family, addr)
                }
                (connectivity, _) => println!("{:?}: {:?}", family, connectivity),
            }
        }
    }
}

fn print_chunk(chunk: &NetChunk) {
    let text = String::from_utf8_lossy(&chunk.data);
    if chunk.is_connless() {
        println!("[{}] {}", chunk.addr, text);
    } else {
        println!("{}", text);
    }
}
