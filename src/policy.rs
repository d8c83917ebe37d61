use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::PolicyConfig;

// Ban expiry used when the configured timeout does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Ban and connection-rate decisions consulted by the stratum core
pub trait PolicyGateway: Send + Sync {
    fn is_banned(&self, ip: IpAddr) -> bool;

    /// Returns `false` when the connection from `ip` must be refused
    fn apply_limit_policy(&self, ip: IpAddr) -> bool;

    fn ban_client(&self, ip: IpAddr);

    /// Account one malformed request from `ip`
    fn apply_malformed_policy(&self, ip: IpAddr);
}

/// Per-IP accounting
#[derive(Debug, Clone, Default)]
pub struct PolicyEntry {
    pub connections: Vec<Instant>,
    pub malformed: u32,
    /// Time of the most recent malformed request
    pub last_malformed: Option<Instant>,
}

impl PolicyEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sliding-window connection limit
    pub fn can_connect(&mut self, limit: u32, window: Duration) -> bool {
        let now = Instant::now();
        self.connections
            .retain(|&time| now.duration_since(time) < window);

        if self.connections.len() >= limit as usize {
            return false;
        }

        self.connections.push(now);
        true
    }

    /// Count one malformed request; strikes older than `window` are forgotten first
    pub fn record_malformed(&mut self, window: Duration) -> u32 {
        let now = Instant::now();
        self.expire_malformed(now, window);
        self.malformed += 1;
        self.last_malformed = Some(now);
        self.malformed
    }

    fn expire_malformed(&mut self, now: Instant, window: Duration) {
        if let Some(last) = self.last_malformed {
            if now.duration_since(last) >= window {
                self.malformed = 0;
                self.last_malformed = None;
            }
        }
    }
}

/// In-memory policy engine
pub struct PolicyServer {
    entries: DashMap<IpAddr, PolicyEntry>,
    banned: DashMap<IpAddr, Instant>,
    config: PolicyConfig,
    started_at: Instant,
}

impl PolicyServer {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            entries: DashMap::new(),
            banned: DashMap::new(),
            config,
            started_at: Instant::now(),
        }
    }

    fn in_grace_period(&self) -> bool {
        self.started_at.elapsed() < Duration::from_secs(self.config.connection_grace_secs)
    }

    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.limit_reset_secs);

        self.entries.retain(|_, entry| {
            entry.connections.retain(|&time| now.duration_since(time) < window);
            entry.expire_malformed(now, window);
            !entry.connections.is_empty() || entry.malformed > 0
        });

        self.banned.retain(|_, banned_until| now < *banned_until);

        log::debug!(
            "Cleaned up policy data. Tracked IPs: {}, Banned IPs: {}",
            self.entries.len(),
            self.banned.len()
        );
    }

    pub fn banned_count(&self) -> usize {
        self.banned.len()
    }
}

impl PolicyGateway for PolicyServer {
    fn is_banned(&self, ip: IpAddr) -> bool {
        if let Some(banned_until) = self.banned.get(&ip).map(|until| *until) {
            if Instant::now() < banned_until {
                return true;
            }
            self.banned.remove(&ip);
        }
        false
    }

    fn apply_limit_policy(&self, ip: IpAddr) -> bool {
        if !self.config.enabled || self.in_grace_period() {
            return true;
        }

        let window = Duration::from_secs(self.config.limit_reset_secs);
        let allowed = self
            .entries
            .entry(ip)
            .or_default()
            .can_connect(self.config.connection_limit, window);

        if !allowed {
            log::debug!("Connection limit reached for {}", ip);
        }
        allowed
    }

    fn ban_client(&self, ip: IpAddr) {
        if !self.config.enabled {
            return;
        }
        let now = Instant::now();
        let until = now
            .checked_add(self.config.ban_timeout())
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.banned.insert(ip, until);
        log::warn!("⛔ Banned {} for {}s", ip, self.config.ban_timeout_secs);
    }

    fn apply_malformed_policy(&self, ip: IpAddr) {
        let window = Duration::from_secs(self.config.limit_reset_secs);
        let strikes = self.entries.entry(ip).or_default().record_malformed(window);

        if strikes >= self.config.malformed_limit {
            self.ban_client(ip);
        }
    }
}
