//! Ordered holding area for callers awaiting a response.
//!
//! Pure state machine, no I/O. The dispatcher drives it:
//!
//! ```text
//!            begin_dispatch            mark_written
//!   Idle ─────────────────▶ Dispatching ─────────────▶ AwaitingResponse
//!    ▲                                                       │
//!    └──────────────────── settle_head ◀─────────────────────┘
//! ```
//!
//! The head stays in the queue until its response is settled. Identity is
//! positional: the next decoded response always belongs to the head, so
//! at most one request may be written and unanswered at any time.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::error::LookupError;

pub type LookupResult = Result<Vec<String>, LookupError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Nothing written and unanswered.
    Idle,
    /// The head is being written to the process.
    Dispatching,
    /// The head was written; its response has not arrived.
    AwaitingResponse,
}

/// A caller waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    seq: u64,
    word: String,
    responder: oneshot::Sender<LookupResult>,
    enqueued_at: Instant,
}

impl PendingRequest {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn word(&self) -> &str {
        &self.word
    }

    /// The caller dropped its future.
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }
}

/// What happened to the head when a response was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Delivered { seq: u64, elapsed: Duration },
    /// Consumed to keep the stream aligned, but nobody was listening.
    Abandoned { seq: u64 },
    /// No request was awaiting a response.
    Unsolicited,
}

#[derive(Debug)]
pub struct LookupQueue {
    state: DispatchState,
    pending: VecDeque<PendingRequest>,
    next_seq: u64,
    dispatched_at: Option<Instant>,
}

impl Default for LookupQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LookupQueue {
    pub fn new() -> Self {
        Self {
            state: DispatchState::Idle,
            pending: VecDeque::new(),
            // 0 is reserved for the readiness probe.
            next_seq: 1,
            dispatched_at: None,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Writes started minus responses settled. Always 0 or 1.
    pub fn in_flight(&self) -> usize {
        match self.state {
            DispatchState::Idle => 0,
            DispatchState::Dispatching | DispatchState::AwaitingResponse => 1,
        }
    }

    /// When the in-flight request was selected for writing. The write and
    /// the wait for its response share one deadline counted from here.
    pub fn dispatched_at(&self) -> Option<Instant> {
        self.dispatched_at
    }

    /// Sequence number of the request whose response is expected next.
    pub fn awaiting_seq(&self) -> Option<u64> {
        match self.state {
            DispatchState::AwaitingResponse => self.pending.front().map(PendingRequest::seq),
            _ => None,
        }
    }

    /// Append a caller to the tail. Returns its sequence number.
    pub fn push(
        &mut self,
        word: String,
        responder: oneshot::Sender<LookupResult>,
        enqueued_at: Instant,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(PendingRequest {
            seq,
            word,
            responder,
            enqueued_at,
        });
        seq
    }

    /// If idle, select the head for writing and move to `Dispatching`.
    ///
    /// Callers that gave up before their request was written are dropped
    /// here; they never reach the pipe.
    pub fn begin_dispatch(&mut self, at: Instant) -> Option<&PendingRequest> {
        if self.state != DispatchState::Idle {
            return None;
        }
        while self.pending.front().is_some_and(PendingRequest::is_abandoned) {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::debug!(seq = dropped.seq, "Caller abandoned before dispatch, skipping");
            }
        }
        let head = self.pending.front()?;
        self.state = DispatchState::Dispatching;
        self.dispatched_at = Some(at);
        Some(head)
    }

    /// The head has been fully written.
    pub fn mark_written(&mut self) {
        debug_assert_eq!(self.state, DispatchState::Dispatching);
        self.state = DispatchState::AwaitingResponse;
    }

    /// Pop the head and hand it `result`. Only valid while awaiting a response.
    pub fn settle_head(&mut self, result: LookupResult) -> Settled {
        if self.state != DispatchState::AwaitingResponse {
            return Settled::Unsolicited;
        }
        self.state = DispatchState::Idle;
        self.dispatched_at = None;

        let Some(head) = self.pending.pop_front() else {
            return Settled::Unsolicited;
        };
        let seq = head.seq;
        let elapsed = head.enqueued_at.elapsed();
        if head.responder.send(result).is_err() {
            Settled::Abandoned { seq }
        } else {
            Settled::Delivered { seq, elapsed }
        }
    }

    /// Fail the head regardless of state. Returns false if the queue was empty.
    pub fn fail_head(&mut self, error: LookupError) -> bool {
        self.state = DispatchState::Idle;
        self.dispatched_at = None;
        match self.pending.pop_front() {
            Some(head) => {
                let _ = head.responder.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending caller. Returns how many were failed.
    pub fn fail_all(&mut self, error: LookupError) -> usize {
        self.state = DispatchState::Idle;
        self.dispatched_at = None;
        let count = self.pending.len();
        for request in self.pending.drain(..) {
            let _ = request.responder.send(Err(error.clone()));
        }
        count
    }
}
