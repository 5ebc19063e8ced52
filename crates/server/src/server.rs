use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use tnet::{
    Codec, ConnState, Econ, EconConfig, NetBan, NetChunk, NetServer, SendFlags, ServerConfig,
    SharedBans,
};

use crate::commands::ConsoleCommands;
use crate::events::EventQueue;

const TICK: Duration = Duration::from_millis(5);

/// Game-less server that echoes every chunk back to its sender.
pub struct EchoServer {
    net: NetServer,
    econ: Option<Econ>,
    bans: SharedBans,
    events: EventQueue,
    running: Arc<AtomicBool>,
    started: Instant,
    logouts: Vec<usize>,
}

impl EchoServer {
    pub fn new(
        bind: SocketAddr,
        config: ServerConfig,
        econ: Option<(SocketAddr, EconConfig)>,
    ) -> Result<Self> {
        let bans = NetBan::shared();
        let net = NetServer::open(bind, Arc::new(Codec::new()), config, Some(bans.clone()))
            .context("Failed to open game socket")?;
        let econ = match econ {
            Some((addr, config)) => Some(
                Econ::open(addr, config, bans.clone()).context("Failed to open remote console")?,
            ),
            None => None,
        };

        Ok(Self {
            net,
            econ,
            bans,
            events: EventQueue::default(),
            running: Arc::new(AtomicBool::new(true)),
            started: Instant::now(),
            logouts: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.net.local_addr()
    }

    pub fn econ_addr(&self) -> Option<SocketAddr> {
        self.econ.as_ref().and_then(|econ| econ.local_addr().ok())
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn run(&mut self) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            self.net.wait(TICK)?;
            self.tick_once()?;
        }
        self.shutdown();
        Ok(())
    }

    pub fn tick_once(&mut self) -> Result<()> {
        self.net.update(&mut self.events);
        while let Some(chunk) = self.net.recv(&mut self.events)? {
            if let Err(e) = self.echo(chunk) {
                log::warn!("Echo failed: {}", e);
            }
        }
        self.report_events();

        if let Some(econ) = self.econ.as_mut() {
            let mut commands = ConsoleCommands {
                net: &mut self.net,
                events: &mut self.events,
                bans: &self.bans,
                running: &self.running,
                started: self.started,
                logouts: &mut self.logouts,
            };
            econ.update(&mut commands);
            for client_id in self.logouts.drain(..) {
                if let Err(e) = econ.logout(client_id) {
                    log::debug!("Logout of console client {} failed: {}", client_id, e);
                }
            }
        }
        self.report_events();
        Ok(())
    }

    /// Drops every client with a shutdown notice.
    pub fn shutdown(&mut self) {
        for client_id in 0..self.net.max_clients() {
            let online = self
                .net
                .slot(client_id)
                .is_some_and(|slot| slot.state() != ConnState::Offline);
            if online {
                let _ = self
                    .net
                    .drop_client(client_id, "Server shutdown", &mut self.events);
            }
        }
        self.report_events();
    }

    fn echo(&mut self, chunk: NetChunk) -> tnet::Result<()> {
        if chunk.is_connless() {
            // only token-checked peers get an answer
            let Some(token) = chunk.response_token else {
                log::debug!("Ignoring connless packet from {}", chunk.addr);
                return Ok(());
            };
            let reply = NetChunk::connless(chunk.addr, chunk.data);
            return self.net.send_connless_sixup(&reply, token);
        }

        let Some(client_id) = chunk.client_id else {
            return Ok(());
        };
        let mut flags = SendFlags::FLUSH;
        if chunk.is_vital() {
            flags |= SendFlags::VITAL;
        }
        log::debug!("Echoing {} bytes to client {}", chunk.data.len(), client_id);
        self.net
            .send(&NetChunk::to_client(client_id, chunk.addr, flags, chunk.data))
    }

    fn report_events(&mut self) {
        for event in self.events.drain() {
            let message = event.describe();
            log::info!("{}", message);
            if let Some(econ) = self.econ.as_mut() {
                econ.broadcast(&message);
            }
        }
    }
}
