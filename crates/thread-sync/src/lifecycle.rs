use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Backoff,
    Gone,
}

impl ChannelState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Backoff => "backoff",
            Self::Gone => "gone",
        }
    }
}

/// Close code the server uses when the thread no longer exists.
pub const CLOSE_CODE_GONE: u16 = 4004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ResourceGone,
    RemoteClosed,
    Network,
    ConnectTimeout,
    LivenessTimeout,
    Unknown,
}

impl DisconnectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResourceGone => "resource_gone",
            Self::RemoteClosed => "remote_closed",
            Self::Network => "network",
            Self::ConnectTimeout => "connect_timeout",
            Self::LivenessTimeout => "liveness_timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Terminal reasons suppress reconnects for the rest of the binding.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ResourceGone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHealth {
    pub state: ChannelState,
    pub connect_attempts: u32,
    pub reconnect_attempts: u32,
    pub next_retry_ms: Option<u64>,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub last_error: Option<String>,
}

impl Default for ChannelHealth {
    fn default() -> Self {
        ChannelLifecycle::default().health()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    pub delay: Duration,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed { delay: Duration },
    Exponential { base: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_millis(3_000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the `attempt`-th consecutive reconnect (1-based).
    #[must_use]
    pub fn delay_for(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max } => {
                let base_ms = duration_ms(base).max(1);
                let exponent = attempt.saturating_sub(1).min(10);
                let scaled = base_ms.saturating_mul(1_u64 << exponent);
                Duration::from_millis(scaled.min(duration_ms(max).max(base_ms)))
            }
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Connection state machine for one binding.
#[derive(Debug, Clone)]
pub struct ChannelLifecycle {
    policy: ReconnectPolicy,
    state: ChannelState,
    connect_attempts: u32,
    reconnect_attempts: u32,
    consecutive_failures: u32,
    next_retry_ms: Option<u64>,
    last_disconnect_reason: Option<DisconnectReason>,
    last_error: Option<String>,
}

impl Default for ChannelLifecycle {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl ChannelLifecycle {
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ChannelState::Disconnected,
            connect_attempts: 0,
            reconnect_attempts: 0,
            consecutive_failures: 0,
            next_retry_ms: None,
            last_disconnect_reason: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.state == ChannelState::Gone
    }

    pub fn mark_connecting(&mut self) {
        self.state = ChannelState::Connecting;
        self.connect_attempts = self.connect_attempts.saturating_add(1);
        self.next_retry_ms = None;
    }

    pub fn mark_open(&mut self) {
        self.state = ChannelState::Open;
        self.consecutive_failures = 0;
        self.next_retry_ms = None;
        self.last_error = None;
    }

    pub fn mark_closing(&mut self) {
        if self.state != ChannelState::Gone {
            self.state = ChannelState::Closing;
        }
    }

    /// Graceful teardown: no reconnect follows.
    pub fn mark_unbound(&mut self) {
        if self.state != ChannelState::Gone {
            self.state = ChannelState::Disconnected;
        }
        self.next_retry_ms = None;
    }

    pub fn mark_gone(&mut self, error: Option<String>) {
        self.state = ChannelState::Gone;
        self.next_retry_ms = None;
        self.last_disconnect_reason = Some(DisconnectReason::ResourceGone);
        if error.is_some() {
            self.last_error = error;
        }
    }

    /// Record an unplanned closure. Returns the reconnect plan, or `None` when the
    /// closure is terminal.
    #[must_use]
    pub fn mark_disconnect(
        &mut self,
        reason: DisconnectReason,
        error: Option<String>,
    ) -> Option<ReconnectPlan> {
        if self.state == ChannelState::Gone {
            return None;
        }
        if reason.is_terminal() {
            self.mark_gone(error);
            return None;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        let delay = self.policy.delay_for(self.consecutive_failures);
        self.state = ChannelState::Backoff;
        self.last_disconnect_reason = Some(reason);
        self.last_error = error;
        self.next_retry_ms = Some(duration_ms(delay));
        Some(ReconnectPlan {
            delay,
            attempt: self.consecutive_failures,
        })
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    #[must_use]
    pub fn health(&self) -> ChannelHealth {
        ChannelHealth {
            state: self.state,
            connect_attempts: self.connect_attempts,
            reconnect_attempts: self.reconnect_attempts,
            next_retry_ms: self.next_retry_ms,
            last_disconnect_reason: self.last_disconnect_reason,
            last_error: self.last_error.clone(),
        }
    }
}

#[must_use]
pub fn classify_close_code(code: u16) -> DisconnectReason {
    if code == CLOSE_CODE_GONE {
        DisconnectReason::ResourceGone
    } else {
        DisconnectReason::RemoteClosed
    }
}

#[must_use]
pub fn classify_disconnect_reason(error: &str) -> DisconnectReason {
    let normalized = error.to_ascii_lowercase();
    if normalized.contains("4004") || normalized.contains("not found") {
        return DisconnectReason::ResourceGone;
    }
    if normalized.contains("timed out") || normalized.contains("timeout") {
        return DisconnectReason::ConnectTimeout;
    }
    if normalized.contains("closed")
        || normalized.contains("connection reset")
        || normalized.contains("connection refused")
        || normalized.contains("broken pipe")
        || normalized.contains("network")
        || normalized.contains("io error")
        || normalized.contains("i/o error")
    {
        return DisconnectReason::Network;
    }
    DisconnectReason::Unknown
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        ChannelLifecycle, ChannelState, DisconnectReason, ReconnectPolicy, classify_close_code,
        classify_disconnect_reason,
    };

    #[test]
    fn fixed_policy_reconnects_after_the_same_delay() {
        let mut lifecycle = ChannelLifecycle::default();
        lifecycle.mark_connecting();
        lifecycle.mark_open();

        for attempt in 1..=3 {
            let plan = lifecycle
                .mark_disconnect(DisconnectReason::Network, Some("socket closed".to_string()))
                .expect("non-terminal closure should reconnect");
            assert_eq!(plan.delay, Duration::from_millis(3_000));
            assert_eq!(plan.attempt, attempt);
        }
        assert_eq!(lifecycle.state(), ChannelState::Backoff);
    }

    #[test]
    fn exponential_policy_grows_caps_and_resets_on_open() {
        let mut lifecycle = ChannelLifecycle::new(ReconnectPolicy::Exponential {
            base: Duration::from_millis(250),
            max: Duration::from_millis(8_000),
        });

        let first = lifecycle
            .mark_disconnect(DisconnectReason::Network, None)
            .expect("plan");
        assert_eq!(first.delay.as_millis(), 250);
        let second = lifecycle
            .mark_disconnect(DisconnectReason::Network, None)
            .expect("plan");
        assert_eq!(second.delay.as_millis(), 500);

        for _ in 0..16 {
            let _ = lifecycle.mark_disconnect(DisconnectReason::Network, None);
        }
        let capped = lifecycle
            .mark_disconnect(DisconnectReason::Network, None)
            .expect("plan");
        assert_eq!(capped.delay.as_millis(), 8_000);

        lifecycle.mark_connecting();
        lifecycle.mark_open();
        let after_open = lifecycle
            .mark_disconnect(DisconnectReason::RemoteClosed, None)
            .expect("plan");
        assert_eq!(after_open.delay.as_millis(), 250);
    }

    #[test]
    fn resource_gone_is_terminal_and_sticky() {
        let mut lifecycle = ChannelLifecycle::default();
        lifecycle.mark_connecting();
        lifecycle.mark_open();

        let plan = lifecycle.mark_disconnect(
            DisconnectReason::ResourceGone,
            Some("close 4004: Thread not found".to_string()),
        );
        assert!(plan.is_none());
        assert!(lifecycle.is_gone());

        assert!(
            lifecycle
                .mark_disconnect(DisconnectReason::Network, None)
                .is_none()
        );
        lifecycle.mark_unbound();
        assert_eq!(lifecycle.state(), ChannelState::Gone);

        let health = lifecycle.health();
        assert_eq!(health.last_disconnect_reason, Some(DisconnectReason::ResourceGone));
        assert_eq!(health.reconnect_attempts, 0);
        assert_eq!(
            health.last_error.as_deref(),
            Some("close 4004: Thread not found")
        );
    }

    #[test]
    fn lifecycle_tracks_connect_and_open_health_state() {
        let mut lifecycle = ChannelLifecycle::default();

        lifecycle.mark_connecting();
        let connecting = lifecycle.health();
        assert_eq!(connecting.state, ChannelState::Connecting);
        assert_eq!(connecting.connect_attempts, 1);
        assert_eq!(connecting.reconnect_attempts, 0);

        let _ = lifecycle.mark_disconnect(DisconnectReason::ConnectTimeout, Some("timeout".into()));
        assert_eq!(lifecycle.health().next_retry_ms, Some(3_000));

        lifecycle.mark_connecting();
        lifecycle.mark_open();
        let open = lifecycle.health();
        assert_eq!(open.state, ChannelState::Open);
        assert_eq!(open.connect_attempts, 2);
        assert_eq!(open.reconnect_attempts, 1);
        assert_eq!(open.next_retry_ms, None);
        assert_eq!(open.last_error, None);
        assert_eq!(open.state.as_str(), "open");
    }

    #[test]
    fn close_codes_and_errors_classify() {
        assert_eq!(classify_close_code(4004), DisconnectReason::ResourceGone);
        assert_eq!(classify_close_code(1000), DisconnectReason::RemoteClosed);
        assert_eq!(classify_close_code(1011), DisconnectReason::RemoteClosed);

        assert_eq!(
            classify_disconnect_reason("HTTP error: 404 Not Found"),
            DisconnectReason::ResourceGone
        );
        assert_eq!(
            classify_disconnect_reason("connect timed out after 10s"),
            DisconnectReason::ConnectTimeout
        );
        assert_eq!(
            classify_disconnect_reason("IO error: Connection refused (os error 111)"),
            DisconnectReason::Network
        );
        assert_eq!(
            classify_disconnect_reason("unexpected failure"),
            DisconnectReason::Unknown
        );
    }
}
