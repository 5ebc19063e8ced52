//! In-memory IP ban list shared by the game server and the console.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type SharedBans = Rc<RefCell<NetBan>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    /// `None` for permanent bans.
    pub expires: Option<Instant>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct NetBan {
    bans: HashMap<IpAddr, BanEntry>,
}

impl NetBan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBans {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Bans `ip`, replacing any existing entry. A zero `duration` is permanent.
    pub fn ban_addr(&mut self, ip: IpAddr, duration: Duration, reason: &str, now: Instant) {
        let expires = if duration.is_zero() {
            None
        } else {
            Some(now + duration)
        };
        log::info!(
            "Banned {} for {} ({})",
            ip,
            match expires {
                Some(_) => format!("{} minutes", duration.as_secs().div_ceil(60)),
                None => "life".to_string(),
            },
            reason
        );
        self.bans.insert(
            ip,
            BanEntry {
                expires,
                reason: reason.to_string(),
            },
        );
    }

    pub fn unban_addr(&mut self, ip: IpAddr) -> bool {
        let removed = self.bans.remove(&ip).is_some();
        if removed {
            log::info!("Unbanned {}", ip);
        }
        removed
    }

    /// Message to show a banned peer, or `None` if `ip` may connect.
    pub fn is_banned(&self, ip: IpAddr, now: Instant) -> Option<String> {
        let entry = self.bans.get(&ip)?;
        match entry.expires {
            Some(expires) if expires <= now => None,
            Some(expires) => {
                let minutes = (expires - now).as_secs().div_ceil(60).max(1);
                Some(format!(
                    "You have been banned for {} minutes ({})",
                    minutes, entry.reason
                ))
            }
            None => Some(format!("You have been banned ({})", entry.reason)),
        }
    }

    /// Drops expired entries.
    pub fn update(&mut self, now: Instant) {
        self.bans.retain(|ip, entry| {
            let keep = entry.expires.is_none_or(|expires| expires > now);
            if !keep {
                log::info!("Ban on {} expired", ip);
            }
            keep
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &BanEntry)> {
        self.bans.iter()
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}
