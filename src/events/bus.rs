// src/events/bus.rs
//! Broadcast bus for task events
//!
//! Publishing never blocks. A slow subscriber that falls more than the
//! buffer size behind sees a `Lagged` error and skips ahead. Events
//! published with no live subscriber are counted as dropped.

use crate::dispatcher::task::{TaskId, TaskState};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Output stream of a process-like engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged { from: Option<TaskState>, to: TaskState },
    Output { stream: StreamKind, data: Bytes },
    Message { text: String },
}

/// Event attributed to a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,

    /// Per-task sequence number, starting at 0
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: EventKind,
}

impl TaskEvent {
    pub fn is_terminal_transition(&self) -> bool {
        matches!(&self.kind, EventKind::StateChanged { to, .. } if to.is_terminal())
    }
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Event bus owned by the dispatcher
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
    counters: Arc<BusCounters>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            counters: Arc::new(BusCounters::default()),
            capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Publisher scoped to one task
    pub fn publisher(&self, task_id: TaskId) -> EventPublisher {
        EventPublisher {
            task_id,
            sender: self.sender.clone(),
            counters: Arc::clone(&self.counters),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
            capacity: self.capacity,
        }
    }
}

/// Cheap, cloneable handle engines use to emit events for their task
#[derive(Clone)]
pub struct EventPublisher {
    task_id: TaskId,
    sender: broadcast::Sender<TaskEvent>,
    counters: Arc<BusCounters>,
    seq: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Publisher wired to nothing, for callers that invoke engines directly
    pub fn detached(task_id: TaskId) -> Self {
        EventBus::new(1).publisher(task_id)
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn publish(&self, kind: EventKind) {
        let event = TaskEvent {
            task_id: self.task_id,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
        };
        match self.sender.send(event) {
            Ok(_) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn output(&self, stream: StreamKind, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.publish(EventKind::Output {
            stream,
            data: Bytes::copy_from_slice(data),
        });
    }

    pub fn state(&self, from: Option<TaskState>, to: TaskState) {
        self.publish(EventKind::StateChanged { from, to });
    }

    pub fn message(&self, text: impl Into<String>) {
        self.publish(EventKind::Message { text: text.into() });
    }
}

/// Bus statistics
#[derive(Debug, Clone)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
    pub subscribers: usize,
    pub capacity: usize,
}

impl BusStats {
    pub fn drop_rate(&self) -> f64 {
        let total = self.published + self.dropped;
        if total == 0 {
            0.0
        } else {
            (self.dropped as f64 / total as f64) * 100.0
        }
    }
}
