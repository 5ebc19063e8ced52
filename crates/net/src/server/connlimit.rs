use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::protocol::CONNLIMIT_IPS;

#[derive(Debug, Clone, Copy)]
struct SpamEntry {
    ip: IpAddr,
    time: Instant,
    conns: u32,
}

/// Rate limiter for connection attempts, tracking the most recent IPs in a
/// fixed table. The least recently reset entry is evicted when it is full.
#[derive(Debug)]
pub struct ConnLimiter {
    entries: [Option<SpamEntry>; CONNLIMIT_IPS],
}

impl Default for ConnLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnLimiter {
    pub fn new() -> Self {
        Self {
            entries: [None; CONNLIMIT_IPS],
        }
    }

    /// Counts one attempt from `ip`. Returns `false` when `ip` already made
    /// `limit` attempts within `window`.
    pub fn allow(&mut self, ip: IpAddr, now: Instant, limit: u32, window: Duration) -> bool {
        let mut oldest = 0;
        for i in 0..CONNLIMIT_IPS {
            let Some(entry) = self.entries[i] else {
                if self.entries[oldest].is_some() {
                    oldest = i;
                }
                continue;
            };

            if entry.ip == ip {
                let mut entry = entry;
                if now.saturating_duration_since(entry.time) < window {
                    if entry.conns >= limit {
                        return false;
                    }
                } else {
                    entry.time = now;
                    entry.conns = 0;
                }
                entry.conns += 1;
                self.entries[i] = Some(entry);
                return true;
            }

            if let Some(current) = self.entries[oldest] {
                if entry.time < current.time {
                    oldest = i;
                }
            }
        }

        self.entries[oldest] = Some(SpamEntry {
            ip,
            time: now,
            conns: 1,
        });
        true
    }
}
