//! Serial link supervision.
//!
//! A serial link can fail silently: the port stays open and reads keep timing
//! out, but nothing decodes. The monitor tracks the time of the last decoded
//! packet and reports a stall once it exceeds the configured timeout; the
//! ingest task then closes the port, backs off and reconnects.

use std::time::{Duration, Instant};

use crate::config::SerialConfig;

/// Longest wait between reconnect attempts after repeated failures.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Stalled { silent_for: Duration },
    NotConnected,
}

#[derive(Debug, Clone)]
pub struct ConnectionHealthMonitor {
    state: ConnectionState,
    last_packet: Option<Instant>,
    last_check: Option<Instant>,
    timeout: Duration,
    check_interval: Duration,
    base_delay: Duration,
    max_attempts: u32,
    failed_attempts: u32,
}

impl ConnectionHealthMonitor {
    pub fn new(
        timeout: Duration,
        check_interval: Duration,
        reconnect_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_packet: None,
            last_check: None,
            timeout,
            check_interval,
            base_delay: reconnect_delay,
            max_attempts,
            failed_attempts: 0,
        }
    }

    pub fn from_config(cfg: &SerialConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.connection_timeout_secs),
            Duration::from_secs(cfg.health_check_secs),
            Duration::from_secs(cfg.reconnect_delay_secs),
            cfg.max_reconnect_attempts,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Link is up. The last-packet clock starts now so a freshly opened but
    /// silent link is still caught.
    pub fn connected(&mut self, now: Instant) {
        self.state = ConnectionState::Connected;
        self.last_packet = Some(now);
        self.last_check = Some(now);
        self.failed_attempts = 0;
    }

    /// A connect attempt failed; returns how long to wait before the next one.
    pub fn connect_failed(&mut self) -> Duration {
        self.state = ConnectionState::Disconnected;
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.reconnect_delay()
    }

    pub fn record_packet(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            self.last_packet = Some(now);
        }
    }

    /// Whether a periodic check is due; callers check between reads.
    pub fn check_due(&self, now: Instant) -> bool {
        match self.last_check {
            Some(at) => now.saturating_duration_since(at) >= self.check_interval,
            None => true,
        }
    }

    pub fn check(&mut self, now: Instant) -> HealthVerdict {
        self.last_check = Some(now);
        if self.state != ConnectionState::Connected {
            return HealthVerdict::NotConnected;
        }
        let silent_for = self
            .last_packet
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        if silent_for > self.timeout {
            HealthVerdict::Stalled { silent_for }
        } else {
            HealthVerdict::Healthy
        }
    }

    pub fn disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.last_packet = None;
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Fixed delay until `max_attempts` consecutive failures, then doubling
    /// per further failure up to [`MAX_RECONNECT_DELAY`].
    pub fn reconnect_delay(&self) -> Duration {
        let over = self.failed_attempts.saturating_sub(self.max_attempts);
        if over == 0 {
            return self.base_delay;
        }
        let factor = 1u32.checked_shl(over.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(MAX_RECONNECT_DELAY)
            .min(MAX_RECONNECT_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ConnectionHealthMonitor {
        ConnectionHealthMonitor::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
            Duration::from_secs(30),
            5,
        )
    }

    #[test]
    fn state_machine_cycle() {
        let mut m = monitor();
        let t0 = Instant::now();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.check(t0), HealthVerdict::NotConnected);
        m.begin_connect();
        assert_eq!(m.state(), ConnectionState::Connecting);
        m.connected(t0);
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.check(t0 + Duration::from_secs(10)), HealthVerdict::Healthy);
        m.disconnected();
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn silence_beyond_timeout_is_a_stall() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.begin_connect();
        m.connected(t0);
        m.record_packet(t0 + Duration::from_secs(100));
        assert_eq!(m.check(t0 + Duration::from_secs(350)), HealthVerdict::Healthy);
        match m.check(t0 + Duration::from_secs(401)) {
            HealthVerdict::Stalled { silent_for } => {
                assert_eq!(silent_for, Duration::from_secs(301))
            }
            other => panic!("expected stall, got {:?}", other),
        }
    }

    #[test]
    fn check_cadence() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.connected(t0);
        assert!(!m.check_due(t0 + Duration::from_secs(29)));
        assert!(m.check_due(t0 + Duration::from_secs(30)));
        m.check(t0 + Duration::from_secs(30));
        assert!(!m.check_due(t0 + Duration::from_secs(45)));
    }

    #[test]
    fn backoff_grows_after_max_attempts_and_caps() {
        let mut m = monitor();
        for _ in 0..5 {
            assert_eq!(m.connect_failed(), Duration::from_secs(30));
        }
        assert_eq!(m.connect_failed(), Duration::from_secs(60));
        assert_eq!(m.connect_failed(), Duration::from_secs(120));
        for _ in 0..10 {
            m.connect_failed();
        }
        assert_eq!(m.reconnect_delay(), MAX_RECONNECT_DELAY);
        m.connected(Instant::now());
        assert_eq!(m.failed_attempts(), 0);
        assert_eq!(m.reconnect_delay(), Duration::from_secs(30));
    }
}
