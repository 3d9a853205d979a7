//! Frame-scheduled inbound message queue.
//!
//! Messages are admitted from the transport thread, assigned an apply frame,
//! and held in a bounded queue ordered by `(apply_frame, sequence)`. The
//! control tick advances the frame counter and drains the due prefix. The
//! queue is the only piece of bridge state shared across threads, so all of
//! it sits behind one mutex.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use log::{debug, warn};
use serde_json::Value;

use crate::core::config::InboundPolicy;
use crate::core::constants::COMPACT_MIN_HEAD;
use crate::core::error::DropCause;
use crate::inbound::filter;

/// Callback invoked for every message the authority node admits, so the host
/// can replicate it to follower nodes. Receives the raw envelope and the
/// assigned apply frame.
pub type ReplicationObserver = Box<dyn Fn(&str, i64) + Send + Sync>;

/// One admitted inbound message.
#[derive(Debug)]
pub struct QueuedInbound {
    /// Admission order, starting at 1. Tie-breaker within an apply frame.
    pub sequence: u64,

    /// Control frame on which this message becomes due.
    pub apply_frame: i64,

    /// When the message was admitted.
    pub enqueued_at: Instant,

    /// Raw envelope text.
    pub raw: String,

    /// Parsed envelope, when it was valid JSON.
    pub parsed: Option<Value>,
}

/// Counters describing queue activity since construction.
#[derive(Debug, Clone, Default)]
pub struct InboundStats {
    /// Messages currently queued.
    pub queue_length: usize,

    /// Messages admitted.
    pub enqueued: u64,

    /// Messages dispatched on their apply frame.
    pub applied: u64,

    /// Oldest entries evicted to admit newer ones.
    pub evicted: u64,

    /// Messages addressed to a different node.
    pub target_filtered: u64,

    /// Messages rejected by the authority gate.
    pub authority_filtered: u64,

    /// Messages that missed their exact apply frame.
    pub stale_exact_frame: u64,

    /// Running mean of admission-to-dispatch latency in milliseconds.
    pub avg_apply_latency_ms: f64,
}

struct Inner {
    entries: Vec<QueuedInbound>,
    /// Consumed prefix length. Entries below this index are dead.
    head: usize,
    frame: i64,
    next_sequence: u64,
    stats: InboundStats,
    total_latency_ms: f64,
    warned_eviction: bool,
    warned_authority: bool,
    warned_stale: bool,
}

impl Inner {
    fn active(&self) -> usize {
        self.entries.len() - self.head
    }

    /// Drop the consumed prefix once it outweighs the live entries.
    fn maybe_compact(&mut self) {
        let active = self.active();
        if active == 0 {
            self.entries.clear();
            self.head = 0;
        } else if self.head > COMPACT_MIN_HEAD.max(active / 2) {
            self.entries.drain(..self.head);
            self.head = 0;
        }
    }
}

/// Bounded, frame-ordered inbound queue.
///
/// Producers call [`ingest`](Self::ingest) (or [`enqueue`](Self::enqueue)
/// for pre-parsed envelopes) from any thread; the control tick calls
/// [`advance_frame`](Self::advance_frame) and [`drain_due`](Self::drain_due).
pub struct InboundQueue {
    policy: InboundPolicy,
    inner: Mutex<Inner>,
    observer: Mutex<Option<ReplicationObserver>>,
}

impl InboundQueue {
    /// Create an empty queue governed by `policy`.
    pub fn new(policy: InboundPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                head: 0,
                frame: 0,
                next_sequence: 1,
                stats: InboundStats::default(),
                total_latency_ms: 0.0,
                warned_eviction: false,
                warned_authority: false,
                warned_stale: false,
            }),
            observer: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the authority replication observer. Replaces any previous
    /// observer.
    pub fn set_replication_observer(&self, observer: ReplicationObserver) {
        *self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Admit one raw envelope from the transport.
    ///
    /// Parses the text, extracts any explicit apply frame, and hands off
    /// to [`enqueue`](Self::enqueue).
    pub fn ingest(&self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let parsed: Option<Value> = serde_json::from_str(raw).ok();
        let target_frame = parsed.as_ref().and_then(filter::extract_apply_frame);
        self.enqueue(raw, parsed, target_frame, false);
    }

    /// Admit one envelope with pre-extracted scheduling metadata.
    ///
    /// `target_frame` is the explicit apply frame, if the envelope carried
    /// one. `bypass_gate` skips the target filter and the authority gate,
    /// for messages replicated to this node by the authority.
    pub fn enqueue(
        &self,
        raw: &str,
        mut parsed: Option<Value>,
        target_frame: Option<i64>,
        bypass_gate: bool,
    ) {
        if raw.is_empty() {
            return;
        }

        if !bypass_gate {
            if parsed.is_none() {
                parsed = serde_json::from_str(raw).ok();
            }
            if !filter::message_targets_node(parsed.as_ref(), &self.policy.node_id) {
                let mut inner = self.lock();
                inner.stats.target_filtered += 1;
                debug!(
                    "inbound message {}: node {}",
                    DropCause::TargetFiltered,
                    self.policy.node_id
                );
                return;
            }
        }

        let mut admitted_frame = None;
        {
            let mut inner = self.lock();

            if self.policy.authority_only && !self.policy.is_authority() && !bypass_gate {
                inner.stats.authority_filtered += 1;
                if !inner.warned_authority {
                    inner.warned_authority = true;
                    warn!(
                        "inbound message {}; node {} is not authority (logged once)",
                        DropCause::AuthorityFiltered,
                        self.policy.node_id
                    );
                }
                return;
            }

            if self.policy.require_exact_frame {
                if let Some(frame) = target_frame {
                    if frame <= inner.frame {
                        inner.stats.stale_exact_frame += 1;
                        if !inner.warned_stale {
                            inner.warned_stale = true;
                            warn!(
                                "inbound message {}: frame {} already passed at {} (logged once)",
                                DropCause::StaleExactFrame,
                                frame,
                                inner.frame
                            );
                        }
                        return;
                    }
                }
            }

            while self.policy.max_queue_length > 0 && inner.active() >= self.policy.max_queue_length
            {
                inner.head += 1;
                inner.stats.evicted += 1;
                if !inner.warned_eviction {
                    inner.warned_eviction = true;
                    warn!(
                        "inbound message {}: capacity {} (logged once)",
                        DropCause::CapacityEvicted,
                        self.policy.max_queue_length
                    );
                }
            }

            let lead = self.policy.lead_frames.max(1);
            let apply_frame = match target_frame {
                Some(frame) => frame.max(inner.frame + lead),
                None => inner.frame + lead,
            };

            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            let entry = QueuedInbound {
                sequence,
                apply_frame,
                enqueued_at: Instant::now(),
                raw: raw.to_string(),
                parsed,
            };

            let head = inner.head;
            let idx = inner.entries[head..]
                .partition_point(|e| (e.apply_frame, e.sequence) < (apply_frame, sequence));
            inner.entries.insert(head + idx, entry);
            inner.stats.enqueued += 1;
            inner.maybe_compact();
            admitted_frame = Some(apply_frame);
        }

        // Observer runs outside the queue lock so it may re-enter the bridge.
        if let Some(frame) = admitted_frame {
            if !bypass_gate && self.policy.authority_only && self.policy.is_authority() {
                let observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(observer) = observer.as_ref() {
                    observer(raw, frame);
                }
            }
        }
    }

    /// Advance the control frame counter and return the new frame.
    pub fn advance_frame(&self) -> i64 {
        let mut inner = self.lock();
        inner.frame += 1;
        inner.frame
    }

    /// The current control frame.
    pub fn current_frame(&self) -> i64 {
        self.lock().frame
    }

    /// Remove and return messages due at `frame`, oldest scheduling order
    /// first, up to `max` of them. Later messages stay queued for the next
    /// tick.
    pub fn drain_due(&self, frame: i64, max: usize) -> Vec<QueuedInbound> {
        let now = Instant::now();
        let mut inner = self.lock();

        let candidates = inner.active().min(max);
        let mut count = 0;
        while count < candidates {
            if inner.entries[inner.head + count].apply_frame > frame {
                break;
            }
            count += 1;
        }
        if count == 0 {
            return Vec::new();
        }

        let head = inner.head;
        let mut out = Vec::with_capacity(count);
        for slot in &mut inner.entries[head..head + count] {
            out.push(QueuedInbound {
                sequence: slot.sequence,
                apply_frame: slot.apply_frame,
                enqueued_at: slot.enqueued_at,
                raw: std::mem::take(&mut slot.raw),
                parsed: slot.parsed.take(),
            });
        }
        inner.head += count;

        for msg in &out {
            let latency_ms = now.duration_since(msg.enqueued_at).as_secs_f64() * 1000.0;
            inner.total_latency_ms += latency_ms;
        }
        inner.stats.applied += out.len() as u64;
        if inner.stats.applied > 0 {
            inner.stats.avg_apply_latency_ms =
                inner.total_latency_ms / inner.stats.applied as f64;
        }

        inner.maybe_compact();
        out
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.lock().active()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of queue counters.
    pub fn stats(&self) -> InboundStats {
        let inner = self.lock();
        let mut stats = inner.stats.clone();
        stats.queue_length = inner.active();
        stats
    }

    /// Drop all queued messages. Counters are preserved.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.head = 0;
    }
}
