use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tnet::{ConnState, ConsoleExecutor, NetServer, SharedBans};

use crate::events::EventQueue;

const DEFAULT_BAN_MINUTES: u64 = 30;
const MAX_BAN_MINUTES: u64 = 525_600;

/// Console command set, borrowing the parts of the server it acts on.
pub struct ConsoleCommands<'a> {
    pub net: &'a mut NetServer,
    pub events: &'a mut EventQueue,
    pub bans: &'a SharedBans,
    pub running: &'a AtomicBool,
    pub started: Instant,
    /// Console clients that asked to log out; handled after the update.
    pub logouts: &'a mut Vec<usize>,
}

impl ConsoleExecutor for ConsoleCommands<'_> {
    fn execute_line(&mut self, client_id: usize, line: &str) -> Vec<String> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Vec::new();
        };
        let args: Vec<&str> = words.collect();

        match command {
            "status" => self.status(),
            "kick" => self.kick(&args),
            "ban" => self.ban(&args),
            "unban" => self.unban(&args),
            "bans" => self.list_bans(),
            "shutdown" => {
                self.running.store(false, Ordering::SeqCst);
                vec!["Shutting down".to_string()]
            }
            "logout" => {
                self.logouts.push(client_id);
                Vec::new()
            }
            "help" => vec!["Commands: status, kick, ban, unban, bans, shutdown, logout".to_string()],
            _ => vec![format!("No such command: {}.", command)],
        }
    }
}

impl ConsoleCommands<'_> {
    fn status(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut online = 0;
        for client_id in 0..self.net.max_clients() {
            let Some(slot) = self.net.slot(client_id) else {
                continue;
            };
            if slot.state() == ConnState::Offline {
                continue;
            }
            online += 1;
            lines.push(format!(
                "id={} addr={} state={:?} sixup={} token={}",
                client_id,
                slot.peer_addr()
                    .map_or_else(|| "-".to_string(), |addr| addr.to_string()),
                slot.state(),
                slot.is_sixup(),
                self.net.has_security_token(client_id)
            ));
        }
        lines.insert(
            0,
            format!(
                "uptime={}s clients={}/{}",
                self.started.elapsed().as_secs(),
                online,
                self.net.max_clients()
            ),
        );
        lines
    }

    fn kick(&mut self, args: &[&str]) -> Vec<String> {
        let Some(client_id) = args.first().and_then(|id| id.parse::<usize>().ok()) else {
            return vec!["Usage: kick <id> [reason]".to_string()];
        };
        let reason = if args.len() > 1 {
            args[1..].join(" ")
        } else {
            "Kicked by console".to_string()
        };

        match self.net.drop_client(client_id, &reason, &mut *self.events) {
            Ok(()) => vec![format!("Kicked client {}", client_id)],
            Err(e) => vec![format!("Kick failed: {}", e)],
        }
    }

    fn ban(&mut self, args: &[&str]) -> Vec<String> {
        let Some(ip) = args.first().and_then(|ip| ip.parse::<IpAddr>().ok()) else {
            return vec!["Usage: ban <ip> [minutes] [reason]".to_string()];
        };
        let minutes = match args.get(1).map(|m| m.parse::<u64>()) {
            None => DEFAULT_BAN_MINUTES,
            Some(Ok(minutes)) => minutes.min(MAX_BAN_MINUTES),
            Some(Err(_)) => return vec!["Invalid ban duration".to_string()],
        };
        let reason = if args.len() > 2 {
            args[2..].join(" ")
        } else {
            "No reason given".to_string()
        };

        let now = Instant::now();
        self.bans
            .borrow_mut()
            .ban_addr(ip, Duration::from_secs(minutes * 60), &reason, now);
        let message = self
            .bans
            .borrow()
            .is_banned(ip, now)
            .unwrap_or_else(|| reason.clone());

        let mut lines = vec![if minutes == 0 {
            format!("Banned {} for life ({})", ip, reason)
        } else {
            format!("Banned {} for {} minutes ({})", ip, minutes, reason)
        }];
        for client_id in 0..self.net.max_clients() {
            let connected = self
                .net
                .slot(client_id)
                .is_some_and(|slot| slot.state() != ConnState::Offline);
            let from_ip = self
                .net
                .client_addr(client_id)
                .is_some_and(|addr| addr.ip() == ip);
            if !(connected && from_ip) {
                continue;
            }
            if self
                .net
                .drop_client(client_id, &message, &mut *self.events)
                .is_ok()
            {
                lines.push(format!("Dropped client {}", client_id));
            }
        }
        lines
    }

    fn unban(&mut self, args: &[&str]) -> Vec<String> {
        let Some(ip) = args.first().and_then(|ip| ip.parse::<IpAddr>().ok()) else {
            return vec!["Usage: unban <ip>".to_string()];
        };
        if self.bans.borrow_mut().unban_addr(ip) {
            vec![format!("Unbanned {}", ip)]
        } else {
            vec![format!("{} is not banned", ip)]
        }
    }

    fn list_bans(&self) -> Vec<String> {
        let now = Instant::now();
        let bans = self.bans.borrow();
        let mut lines: Vec<String> = bans
            .iter()
            .map(|(ip, entry)| match entry.expires {
                Some(expires) => format!(
                    "{} expires in {}s ({})",
                    ip,
                    expires.saturating_duration_since(now).as_secs(),
                    entry.reason
                ),
                None => format!("{} banned for life ({})", ip, entry.reason),
            })
            .collect();
        lines.sort();
        lines.push(format!("{} ban(s)", bans.len()));
        lines
    }
}
