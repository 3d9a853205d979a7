//! Reconnect state machine.
//!
//! The manager tracks connection lifecycle and decides when the transport
//! should be reopened. It never touches the transport itself: the bridge
//! feeds it transport events and polls it from the control tick, acting on
//! the events it returns. All deadlines are plain instants checked by the
//! poll, so there are no timers to cancel and tests drive time explicitly.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::Rng;

use crate::core::config::ConnectionConfig;
use crate::core::constants::{
    CLOSE_CODE_POLICY_VIOLATION, CLOSE_CODE_TOO_MANY_REQUESTS, MIN_BACKOFF_DELAY,
};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no pending retry.
    Disconnected,

    /// A connection attempt is in flight.
    Connecting,

    /// The transport is open.
    Connected,

    /// A retry became due and the next attempt is about to start.
    Reconnecting,

    /// Waiting out the delay before the next attempt.
    BackingOff,
}

/// How a close event should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseVerdict {
    /// Ordinary close.
    Normal,

    /// The peer closed the connection because we exceeded its rate limits.
    RateLimited,
}

/// Outcome of one supervision poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// Nothing to do.
    Idle,

    /// The in-flight attempt exceeded the connect timeout. The caller
    /// should close the pending transport.
    ConnectTimedOut,

    /// The backoff delay elapsed. The caller should start a new attempt.
    RetryDue,
}

/// Five-state reconnect supervisor with jittered exponential backoff.
pub struct ConnectionManager {
    config: ConnectionConfig,
    state: ConnectionState,
    attempts: u32,
    connect_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    halted: bool,
}

impl ConnectionManager {
    /// A disconnected manager governed by `config`.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            attempts: 0,
            connect_deadline: None,
            retry_at: None,
            halted: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether reconnecting stopped after exhausting the attempt budget.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Reconnect attempts made since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time until the pending retry fires, if one is scheduled.
    pub fn time_until_retry(&self, now: Instant) -> Option<Duration> {
        self.retry_at.map(|at| at.saturating_duration_since(now))
    }

    /// Ask to open a connection now.
    ///
    /// Returns `true` when the caller should open the transport. A request
    /// while an attempt is already in flight is a no-op; a request while
    /// backing off cancels the pending retry and resets the attempt counter
    /// before connecting immediately.
    pub fn request_connect(&mut self, now: Instant) -> bool {
        match self.state {
            ConnectionState::Connecting => {
                warn!("connect requested while an attempt is in flight, ignoring");
                return false;
            }
            ConnectionState::BackingOff => {
                info!("manual connect cancels pending retry");
                self.retry_at = None;
                self.attempts = 0;
            }
            _ => {}
        }
        self.halted = false;
        self.state = ConnectionState::Connecting;
        self.connect_deadline = Some(now + self.config.connect_timeout);
        true
    }

    /// The transport reported a successful connection.
    pub fn on_connected(&mut self) {
        info!("connected");
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.connect_deadline = None;
        self.retry_at = None;
    }

    /// The transport reported a connection error. Returns the scheduled
    /// retry delay, if reconnecting continues.
    pub fn on_connection_error(&mut self, now: Instant) -> Option<Duration> {
        self.state = ConnectionState::Disconnected;
        self.connect_deadline = None;
        if self.config.auto_reconnect {
            self.schedule_retry(now)
        } else {
            None
        }
    }

    /// The transport closed. Classifies the close code and schedules a
    /// retry after unclean closes.
    pub fn on_closed(&mut self, code: u16, clean: bool, now: Instant) -> CloseVerdict {
        self.state = ConnectionState::Disconnected;
        self.connect_deadline = None;
        let verdict = match code {
            CLOSE_CODE_TOO_MANY_REQUESTS | CLOSE_CODE_POLICY_VIOLATION => CloseVerdict::RateLimited,
            _ => CloseVerdict::Normal,
        };
        if verdict == CloseVerdict::RateLimited {
            warn!("connection closed by peer rate limiting (code {code})");
        } else {
            debug!("connection closed (code {code}, clean: {clean})");
        }
        if !clean && self.config.auto_reconnect {
            self.schedule_retry(now);
        }
        verdict
    }

    /// Check deadlines. Called every control tick.
    pub fn poll(&mut self, now: Instant) -> PollEvent {
        match self.state {
            ConnectionState::Connecting => {
                if let Some(deadline) = self.connect_deadline {
                    if now >= deadline {
                        warn!(
                            "connection attempt timed out after {:?}",
                            self.config.connect_timeout
                        );
                        self.state = ConnectionState::Disconnected;
                        self.connect_deadline = None;
                        if self.config.auto_reconnect {
                            self.schedule_retry(now);
                        }
                        return PollEvent::ConnectTimedOut;
                    }
                }
                PollEvent::Idle
            }
            ConnectionState::BackingOff => {
                if let Some(at) = self.retry_at {
                    if now >= at {
                        self.state = ConnectionState::Reconnecting;
                        self.retry_at = None;
                        return PollEvent::RetryDue;
                    }
                }
                PollEvent::Idle
            }
            _ => PollEvent::Idle,
        }
    }

    /// Schedule the next retry with exponential backoff and jitter. Returns
    /// `None` and halts once the attempt budget is spent.
    fn schedule_retry(&mut self, now: Instant) -> Option<Duration> {
        if self.config.max_reconnect_attempts > 0
            && self.attempts >= self.config.max_reconnect_attempts
        {
            error!(
                "giving up after {} reconnect attempts",
                self.config.max_reconnect_attempts
            );
            self.halted = true;
            self.state = ConnectionState::Disconnected;
            self.retry_at = None;
            return None;
        }

        let base = self.config.initial_backoff.as_secs_f32()
            * self.config.backoff_multiplier.powi(self.attempts as i32);
        let mut delay_secs = base.min(self.config.max_backoff.as_secs_f32());
        let jitter = self.config.jitter_percent.clamp(0.0, 100.0);
        if jitter > 0.0 {
            let window = delay_secs * jitter * 0.01;
            let min = (delay_secs - window).max(MIN_BACKOFF_DELAY.as_secs_f32());
            let max = (delay_secs + window).max(min);
            delay_secs = rand::thread_rng().gen_range(min..=max);
        }
        let delay = Duration::from_secs_f32(delay_secs.max(MIN_BACKOFF_DELAY.as_secs_f32()));

        self.attempts += 1;
        self.state = ConnectionState::BackingOff;
        self.retry_at = Some(now + delay);
        info!(
            "reconnect attempt {} scheduled in {:.2}s",
            self.attempts,
            delay.as_secs_f32()
        );
        Some(delay)
    }

    /// Drop all pending deadlines and return to `Disconnected`.
    pub fn shutdown(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.connect_deadline = None;
        self.retry_at = None;
    }
}
