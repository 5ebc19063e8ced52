use std::time::Duration;

use crate::protocol::MAX_CLIENTS;
use crate::stats::PacketLossSimulation;

/// Timers of a single reliable connection.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub timeout: Duration,
    pub timeout_protection: Duration,
    pub connect_resend: Duration,
    pub flush_interval: Duration,
    pub resend_interval: Duration,
    pub keepalive_interval: Duration,
    /// Keep our own error string when the peer closes with a reason.
    pub block_close_msg: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(100),
            timeout_protection: Duration::from_secs(1000),
            connect_resend: Duration::from_millis(500),
            flush_interval: Duration::from_millis(500),
            resend_interval: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(1),
            block_close_msg: false,
        }
    }
}

/// Map advertised to legacy clients during the anti-spoof handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapMap {
    pub name: String,
    pub crc: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    pub max_clients_per_ip: usize,
    pub vanilla_anti_spoof: bool,
    /// A server password disables the legacy anti-spoof handshake.
    pub password_set: bool,
    pub van_conn_per_second: u32,
    pub connlimit: u32,
    pub connlimit_time: Duration,
    pub sixup: bool,
    pub bootstrap_map: Option<BootstrapMap>,
    pub conn: ConnConfig,
    pub packet_loss: Option<PacketLossSimulation>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: MAX_CLIENTS,
            max_clients_per_ip: 4,
            vanilla_anti_spoof: true,
            password_set: false,
            van_conn_per_second: 10,
            connlimit: 5,
            connlimit_time: Duration::from_secs(20),
            sixup: true,
            bootstrap_map: None,
            conn: ConnConfig::default(),
            packet_loss: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub conn: ConnConfig,
    pub token_packet_expiry: Duration,
    pub token_address_expiry: Duration,
    pub packet_loss: Option<PacketLossSimulation>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            conn: ConnConfig::default(),
            token_packet_expiry: Duration::from_secs(60),
            token_address_expiry: Duration::from_secs(16),
            packet_loss: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EconConfig {
    pub password: String,
    pub auth_timeout: Duration,
    /// Zero drops the client after too many failed logins instead of banning.
    pub ban_time: Duration,
}

impl Default for EconConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            auth_timeout: Duration::from_secs(30),
            ban_time: Duration::ZERO,
        }
    }
}
