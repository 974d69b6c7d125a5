//! Deferred work for the single-threaded engine loop.
//!
//! Nothing that reacts to a host event runs inside the event handler when it
//! would call back into the host; it is queued here and executed from
//! [`SyncEngine::tick`](crate::SyncEngine::tick) once due.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use traffic_model::{Callsign, Entity, Lights};

use host_protocol::ObjectId;

use crate::registry::FailureCounters;

/// Engine time in milliseconds. The caller owns the clock.
pub type Millis = u64;

/// Why an entity is being added, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    ExternalCall,
    ByTimer,
    AfterAdded,
    AfterRemoved,
}

impl AddMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AddMode::ExternalCall => "external call",
            AddMode::ByTimer => "by timer",
            AddMode::AfterAdded => "after added",
            AddMode::AfterRemoved => "after removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Deferred {
    /// Re-check a freshly confirmed proxy.
    VerifyAdded { callsign: Callsign, object_id: ObjectId },
    /// Physically add an entity taken from the pending queue or add-again map.
    AddEntity { entity: Entity, mode: AddMode, counters: FailureCounters },
    /// Put a failed entity back into the pending queue.
    Requeue { entity: Entity, counters: FailureCounters },
    RetryRemoval { callsign: Callsign },
    ResendLights { callsign: Callsign, lights: Lights },
}

struct Entry {
    due: Millis,
    seq: u64,
    task: Deferred,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap, we want the earliest entry on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Tasks ordered by due time, then by insertion order.
#[derive(Default)]
pub struct Scheduler {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, now: Millis, delay_ms: Millis, task: Deferred) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { due: now.saturating_add(delay_ms), seq, task });
    }

    /// Next task due at or before `now`.
    pub fn pop_due(&mut self, now: Millis) -> Option<Deferred> {
        if self.heap.peek()?.due > now {
            return None;
        }
        self.heap.pop().map(|e| e.task)
    }

    pub fn next_due(&self) -> Option<Millis> {
        self.heap.peek().map(|e| e.due)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Drop every queued task matching `f`. Returns how many were dropped.
    pub fn cancel(&mut self, mut f: impl FnMut(&Deferred) -> bool) -> usize {
        let before = self.heap.len();
        self.heap.retain(|e| !f(&e.task));
        before - self.heap.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Deferred> {
        self.heap.iter().map(|e| &e.task)
    }
}
