//! The bridge service.
//!
//! [`Bridge`] owns the transport, the inbound queue, the rate limiter and
//! the connection supervisor, and advances all of them from
//! [`tick_at`](Bridge::tick_at). The host wires transport lifecycle events
//! into the `on_transport_*` methods and calls
//! [`queue_message`](Bridge::queue_message) to send.
//!
//! Every time-dependent entry point has an `*_at` form taking an explicit
//! [`Instant`]; the plain forms use wall time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;

use crate::connection::{CloseVerdict, ConnectionManager, ConnectionState, PollEvent};
use crate::core::config::BridgeConfig;
use crate::core::constants::MIN_OUTBOUND_RESCHEDULE;
use crate::core::error::BridgeError;
use crate::core::traits::{MessageProcessor, TickObserver, Transport};
use crate::inbound::{InboundQueue, InboundStats};
use crate::outbound::{MessageKind, Priority, RateLimiter, RateLimiterMetrics};

/// Combined snapshot of bridge state.
#[derive(Debug, Clone)]
pub struct BridgeStats {
    /// Current control frame.
    pub frame: i64,

    /// Connection lifecycle state.
    pub connection: ConnectionState,

    /// Inbound queue counters.
    pub inbound: InboundStats,

    /// Outbound limiter metrics.
    pub outbound: RateLimiterMetrics,
}

/// Frame-scheduled message bridge over a host-supplied transport.
pub struct Bridge<T: Transport, P: MessageProcessor> {
    config: BridgeConfig,
    transport: T,
    processor: P,
    inbound: Arc<InboundQueue>,
    limiter: RateLimiter,
    connection: ConnectionManager,
    /// When the outbound pump next runs. `None` while the queue is idle.
    next_outbound_at: Option<Instant>,
    last_tick_at: Option<Instant>,
    observers: Vec<Box<dyn TickObserver>>,
}

impl<T: Transport, P: MessageProcessor> Bridge<T, P> {
    /// Build a bridge from a validated configuration.
    pub fn new(config: BridgeConfig, transport: T, processor: P) -> Result<Self, BridgeError> {
        config.validate()?;
        let inbound = Arc::new(InboundQueue::new(config.inbound.clone()));
        let limiter = RateLimiter::new(config.limiter.clone());
        let connection = ConnectionManager::new(config.connection.clone());
        Ok(Self {
            config,
            transport,
            processor,
            inbound,
            limiter,
            connection,
            next_outbound_at: None,
            last_tick_at: None,
            observers: Vec::new(),
        })
    }

    /// The bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Handle to the inbound queue, for feeding transport messages from any
    /// thread.
    pub fn inbound(&self) -> Arc<InboundQueue> {
        Arc::clone(&self.inbound)
    }

    /// The rate limiter, for listener registration and direct inspection.
    pub fn limiter_mut(&mut self) -> &mut RateLimiter {
        &mut self.limiter
    }

    /// Connection lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Register an observer invoked at the end of every tick.
    pub fn add_tick_observer(&mut self, observer: Box<dyn TickObserver>) {
        self.observers.push(observer);
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Open the transport toward the configured server.
    pub fn connect(&mut self) {
        self.connect_at(Instant::now());
    }

    /// See [`connect`](Self::connect).
    pub fn connect_at(&mut self, now: Instant) {
        if self.connection.request_connect(now) {
            self.transport.open(&self.config.server_url);
        }
    }

    /// The transport finished connecting.
    pub fn on_transport_connected(&mut self) {
        self.on_transport_connected_at(Instant::now());
    }

    /// See [`on_transport_connected`](Self::on_transport_connected).
    pub fn on_transport_connected_at(&mut self, now: Instant) {
        self.connection.on_connected();
        self.limiter.on_connection_success();
        if self.limiter.queue_len() > 0 {
            self.arm_outbound(now);
        }
    }

    /// The transport failed to connect or dropped with an error.
    pub fn on_transport_error(&mut self, reason: &str) {
        self.on_transport_error_at(reason, Instant::now());
    }

    /// See [`on_transport_error`](Self::on_transport_error).
    pub fn on_transport_error_at(&mut self, reason: &str, now: Instant) {
        warn!("transport error: {reason}");
        self.connection.on_connection_error(now);
        self.limiter.on_connection_error_at(now);
        self.next_outbound_at = None;
    }

    /// The transport closed.
    pub fn on_transport_closed(&mut self, code: u16, clean: bool) {
        self.on_transport_closed_at(code, clean, Instant::now());
    }

    /// See [`on_transport_closed`](Self::on_transport_closed).
    pub fn on_transport_closed_at(&mut self, code: u16, clean: bool, now: Instant) {
        if self.connection.on_closed(code, clean, now) == CloseVerdict::RateLimited {
            self.limiter.on_rate_limit_error_at(None, now);
        }
        self.next_outbound_at = None;
    }

    /// One text frame arrived from the transport. Safe to call from the
    /// transport thread via [`inbound`](Self::inbound) as well.
    pub fn on_transport_message(&self, raw: &str) {
        self.inbound.ingest(raw);
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Queue an outbound message.
    pub fn queue_message(
        &mut self,
        payload: Value,
        priority: Priority,
        kind: MessageKind,
        coalesce_key: Option<&str>,
    ) -> bool {
        self.queue_message_at(payload, priority, kind, coalesce_key, Instant::now())
    }

    /// See [`queue_message`](Self::queue_message).
    pub fn queue_message_at(
        &mut self,
        payload: Value,
        priority: Priority,
        kind: MessageKind,
        coalesce_key: Option<&str>,
        now: Instant,
    ) -> bool {
        if !self.config.enable_rate_limiting {
            return match serde_json::to_string(&payload) {
                Ok(text) => self.send_direct(&text),
                Err(err) => {
                    warn!("failed to serialize outbound message: {err}");
                    false
                }
            };
        }
        let accepted = self
            .limiter
            .enqueue_at(payload, priority, kind, coalesce_key, now);
        if accepted && self.connection.is_connected() {
            self.arm_outbound(now);
        }
        accepted
    }

    /// Send one already-serialized frame, skipping the limiter. Fails when
    /// not connected.
    pub fn send_direct(&mut self, text: &str) -> bool {
        if !self.connection.is_connected() {
            debug!("dropping direct send while not connected");
            return false;
        }
        self.transport.send(text)
    }

    fn arm_outbound(&mut self, now: Instant) {
        let due = now + self.config.outbound_process_interval;
        self.next_outbound_at.get_or_insert(due);
    }

    /// Run the outbound pump if it is due, then re-arm or disarm it.
    fn pump_outbound(&mut self, now: Instant) {
        let Some(due) = self.next_outbound_at else {
            return;
        };
        if now < due {
            return;
        }
        if !self.connection.is_connected() {
            self.next_outbound_at = None;
            return;
        }

        let limiter = &mut self.limiter;
        let transport = &mut self.transport;
        limiter.process_queue_at(now, &mut |text| {
            transport.send(text);
        });

        self.next_outbound_at = if self.limiter.queue_len() == 0 {
            None
        } else if self.limiter.is_backing_off() {
            let remaining = self.limiter.backoff_remaining_at(now);
            Some(now + remaining.max(MIN_OUTBOUND_RESCHEDULE))
        } else {
            Some(now + self.config.outbound_process_interval)
        };
    }

    // =========================================================================
    // CONTROL TICK
    // =========================================================================

    /// Advance one control tick at wall time.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Advance one control tick: bump the frame, dispatch due inbound
    /// messages, supervise the connection, pump the outbound queue, and
    /// notify observers.
    pub fn tick_at(&mut self, now: Instant) {
        let frame = self.inbound.advance_frame();
        let due = self
            .inbound
            .drain_due(frame, self.config.inbound.max_messages_per_tick);
        for msg in &due {
            self.processor.process(&msg.raw, msg.parsed.as_ref());
        }

        match self.connection.poll(now) {
            PollEvent::ConnectTimedOut => {
                self.transport.close();
                self.next_outbound_at = None;
            }
            PollEvent::RetryDue => {
                self.connect_at(now);
            }
            PollEvent::Idle => {}
        }

        self.pump_outbound(now);

        let delta = self
            .last_tick_at
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::ZERO);
        self.last_tick_at = Some(now);
        for observer in &mut self.observers {
            observer.on_tick(delta);
        }
    }

    /// Combined state snapshot.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            frame: self.inbound.current_frame(),
            connection: self.connection.state(),
            inbound: self.inbound.stats(),
            outbound: self.limiter.metrics(),
        }
    }

    /// Close the transport and drop all queued work.
    pub fn shutdown(&mut self) {
        self.transport.close();
        self.connection.shutdown();
        self.limiter.clear();
        self.inbound.clear();
        self.next_outbound_at = None;
    }
}
