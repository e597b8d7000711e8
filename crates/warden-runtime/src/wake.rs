use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use warden_core::{Criticality, WardenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    ManualCall,
    EmergencySignal,
    ScheduledWarmup,
}

impl std::fmt::Display for WakeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ManualCall => write!(f, "manual_call"),
            Self::EmergencySignal => write!(f, "emergency_signal"),
            Self::ScheduledWarmup => write!(f, "scheduled_warmup"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WakeRequest {
    pub component_id: String,
    pub reason: WakeReason,
    pub requested_at: DateTime<Utc>,
    /// Past this instant the requester no longer waits.
    pub deadline: Instant,
}

impl WakeRequest {
    pub fn new(component_id: impl Into<String>, reason: WakeReason, within: Duration) -> Self {
        Self {
            component_id: component_id.into(),
            reason,
            requested_at: Utc::now(),
            deadline: Instant::now() + within,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Outcome of a served request; `None` if it expired before dispatch.
pub type WakeReply = Option<Result<(), WardenError>>;

const EMERGENCY: u8 = 3;

/// Emergency signals first, then Critical components waiting for budget,
/// then warmups, then everything else.
fn priority(reason: WakeReason, criticality: Criticality) -> u8 {
    match (reason, criticality) {
        (WakeReason::EmergencySignal, _) => EMERGENCY,
        (_, Criticality::Critical) => 2,
        (WakeReason::ScheduledWarmup, _) => 1,
        (WakeReason::ManualCall, _) => 0,
    }
}

#[derive(Debug)]
struct Queued {
    priority: u8,
    seq: Reverse<u64>,
    pending: PendingWake,
}

/// A request taken off the queue, with the channel its submitter waits on.
#[derive(Debug)]
pub struct PendingWake {
    pub request: WakeRequest,
    reply: Option<oneshot::Sender<WakeReply>>,
}

impl PendingWake {
    /// Hand the outcome to whoever queued the request, if anyone waits.
    pub fn respond(self, outcome: WakeReply) {
        if let Some(reply) = self.reply {
            let _ = reply.send(outcome);
        }
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Pending wake requests, highest priority first, FIFO within a class.
#[derive(Debug, Default)]
pub struct WakeQueue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

impl WakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request. The returned ticket identifies it.
    pub fn push(&mut self, request: WakeRequest, criticality: Criticality) -> u64 {
        self.enqueue(request, criticality, None)
    }

    /// Enqueue a request whose outcome is sent on `reply` once served.
    pub fn push_with_reply(
        &mut self,
        request: WakeRequest,
        criticality: Criticality,
        reply: oneshot::Sender<WakeReply>,
    ) -> u64 {
        self.enqueue(request, criticality, Some(reply))
    }

    fn enqueue(
        &mut self,
        request: WakeRequest,
        criticality: Criticality,
        reply: Option<oneshot::Sender<WakeReply>>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            priority: priority(request.reason, criticality),
            seq: Reverse(seq),
            pending: PendingWake { request, reply },
        });
        seq
    }

    pub fn pop(&mut self) -> Option<PendingWake> {
        self.heap.pop().map(|q| q.pending)
    }

    /// Pop only if the head of the queue is an emergency signal.
    pub fn pop_emergency(&mut self) -> Option<PendingWake> {
        if self.heap.peek()?.priority < EMERGENCY {
            return None;
        }
        self.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
