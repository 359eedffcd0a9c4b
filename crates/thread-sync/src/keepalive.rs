//! Probe scheduling and liveness detection for an open channel.

use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Zero disables probing.
    pub interval: Duration,
    /// `None` sends probes without expecting replies.
    pub reply_timeout: Option<Duration>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PROBE_INTERVAL,
            reply_timeout: Some(DEFAULT_REPLY_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    Idle,
    SendProbe,
    LivenessFailure { waited: Duration },
}

/// Tracks probe deadlines for one open channel. Created on open, dropped on close.
#[derive(Debug, Clone)]
pub struct KeepaliveMonitor {
    config: KeepaliveConfig,
    next_probe_at: Option<Instant>,
    awaiting_since: Option<Instant>,
    probes_sent: u64,
    replies_received: u64,
}

impl KeepaliveMonitor {
    #[must_use]
    pub fn new(config: KeepaliveConfig, now: Instant) -> Self {
        let next_probe_at = (!config.interval.is_zero()).then(|| now + config.interval);
        Self {
            config,
            next_probe_at,
            awaiting_since: None,
            probes_sent: 0,
            replies_received: 0,
        }
    }

    #[must_use]
    pub fn poll(&self, now: Instant) -> KeepaliveAction {
        if let (Some(sent), Some(timeout)) = (self.awaiting_since, self.config.reply_timeout) {
            let waited = now.saturating_duration_since(sent);
            if waited >= timeout {
                return KeepaliveAction::LivenessFailure { waited };
            }
        }
        match self.next_probe_at {
            Some(due) if now >= due => KeepaliveAction::SendProbe,
            _ => KeepaliveAction::Idle,
        }
    }

    /// Earliest instant at which [`Self::poll`] may return something other than `Idle`.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let liveness = self
            .awaiting_since
            .zip(self.config.reply_timeout)
            .map(|(sent, timeout)| sent + timeout);
        match (self.next_probe_at, liveness) {
            (Some(probe), Some(liveness)) => Some(probe.min(liveness)),
            (probe, liveness) => probe.or(liveness),
        }
    }

    pub fn record_probe_sent(&mut self, now: Instant) {
        self.probes_sent = self.probes_sent.saturating_add(1);
        self.next_probe_at = (!self.config.interval.is_zero()).then(|| now + self.config.interval);
        if self.config.reply_timeout.is_some() && self.awaiting_since.is_none() {
            self.awaiting_since = Some(now);
        }
    }

    pub fn record_reply(&mut self) {
        self.replies_received = self.replies_received.saturating_add(1);
        self.awaiting_since = None;
    }

    #[must_use]
    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }

    #[must_use]
    pub fn replies_received(&self) -> u64 {
        self.replies_received
    }
}
