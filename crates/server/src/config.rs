use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use tnet::{BootstrapMap, EconConfig, PacketLossSimulation, ServerConfig};

#[derive(Parser)]
#[command(name = "tnet-server")]
#[command(about = "Echo server speaking the tnet protocol")]
pub struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(short, long, default_value_t = tnet::DEFAULT_PORT)]
    pub port: u16,

    #[arg(short, long, default_value_t = 16)]
    pub max_clients: usize,

    #[arg(long, default_value_t = 4)]
    pub max_clients_per_ip: usize,

    #[arg(long, help = "Accept legacy clients without the anti-spoof handshake")]
    pub no_vanilla_anti_spoof: bool,

    #[arg(long, help = "Clients must know a password; disables the anti-spoof handshake")]
    pub password_set: bool,

    #[arg(long, default_value_t = 10, help = "Handshakes per second before the fallback map is used")]
    pub van_conn_per_second: u32,

    #[arg(long, default_value_t = 5, help = "Connection attempts per IP within the window (0 = unlimited)")]
    pub connlimit: u32,

    #[arg(long, default_value_t = 20, help = "Connection limit window in seconds")]
    pub connlimit_time: u64,

    #[arg(long, help = "Refuse sixup connections")]
    pub no_sixup: bool,

    #[arg(long, help = "Map file sent to legacy clients during the anti-spoof handshake")]
    pub bootstrap_map: Option<PathBuf>,

    #[arg(long, value_parser = parse_crc, help = "CRC32 of the bootstrap map, in hex")]
    pub bootstrap_map_crc: Option<u32>,

    #[arg(long, help = "Enable packet loss simulation")]
    pub simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    pub loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Remote console port (0 = disabled)")]
    pub econ_port: u16,

    #[arg(long, default_value = "")]
    pub econ_password: String,

    #[arg(long, default_value_t = 30, help = "Seconds a console client has to log in")]
    pub econ_auth_timeout: u64,

    #[arg(long, default_value_t = 0, help = "Minutes to ban after failed logins (0 = just drop)")]
    pub econ_ban_time: u64,
}

impl Args {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.bind, self.port);
        addr.parse()
            .with_context(|| format!("Invalid bind address {}", addr))
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let packet_loss = self
            .simulate_packet_loss
            .then(|| PacketLossSimulation::new(self.loss_percent));

        Ok(ServerConfig {
            max_clients: self.max_clients,
            max_clients_per_ip: self.max_clients_per_ip,
            vanilla_anti_spoof: !self.no_vanilla_anti_spoof,
            password_set: self.password_set,
            van_conn_per_second: self.van_conn_per_second,
            connlimit: self.connlimit,
            connlimit_time: Duration::from_secs(self.connlimit_time),
            sixup: !self.no_sixup,
            bootstrap_map: self.load_bootstrap_map()?,
            packet_loss,
            ..Default::default()
        })
    }

    /// Console address and settings, or `None` when the console is off.
    pub fn econ_config(&self) -> Result<Option<(SocketAddr, EconConfig)>> {
        if self.econ_port == 0 {
            return Ok(None);
        }
        if self.econ_password.is_empty() {
            log::warn!("Remote console disabled: no password set");
            return Ok(None);
        }

        let addr = format!("{}:{}", self.bind, self.econ_port);
        let addr = addr
            .parse()
            .with_context(|| format!("Invalid console address {}", addr))?;
        Ok(Some((
            addr,
            EconConfig {
                password: self.econ_password.clone(),
                auth_timeout: Duration::from_secs(self.econ_auth_timeout),
                ban_time: Duration::from_secs(self.econ_ban_time * 60),
            },
        )))
    }

    fn load_bootstrap_map(&self) -> Result<Option<BootstrapMap>> {
        let Some(path) = &self.bootstrap_map else {
            return Ok(None);
        };
        let crc = self
            .bootstrap_map_crc
            .context("--bootstrap-map needs --bootstrap-map-crc")?;
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read bootstrap map {}", path.display()))?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .context("Bootstrap map file name is not valid UTF-8")?
            .to_string();

        log::info!("Bootstrap map '{}' ({} bytes, crc {:08x})", name, data.len(), crc);
        Ok(Some(BootstrapMap { name, crc, data }))
    }
}

fn parse_crc(value: &str) -> std::result::Result<u32, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid CRC '{}': {}", value, e))
}
