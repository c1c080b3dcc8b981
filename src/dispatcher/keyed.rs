// src/dispatcher/keyed.rs
//! Per-resource-key ordering
//!
//! Every task registers its keys synchronously at dispatch. For each key it
//! becomes the new tail and remembers the previous tail; it may only start
//! once all of those predecessors have finished. Tasks with disjoint keys
//! never wait on each other.
//!
//! ```text
//! key "fs:/ws/a.txt":   T1 ◄── T3 ◄── T4
//! key "micro:vm:vm-1":  T2 ◄── T5
//! ```
//!
//! Registration happens under one lock for all of a task's keys, so the
//! wait graph only points backwards in submission order and cannot cycle.

use crate::dispatcher::task::TaskId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub(crate) struct KeyedSerializer {
    tails: Mutex<HashMap<String, (TaskId, CancellationToken)>>,
}

impl KeyedSerializer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `task` as the newest holder of each key
    pub fn enqueue(self: &Arc<Self>, task: TaskId, keys: &[String]) -> KeyTicket {
        let done = CancellationToken::new();
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let predecessors = {
            let mut tails = self.tails.lock();
            keys.iter()
                .filter_map(|key| {
                    tails
                        .insert(key.clone(), (task, done.clone()))
                        .map(|(_, previous)| previous)
                })
                .collect()
        };

        KeyTicket {
            task,
            keys,
            predecessors,
            done,
            serializer: Arc::clone(self),
        }
    }

    /// Keys with a registered tail
    pub fn active_keys(&self) -> usize {
        self.tails.lock().len()
    }
}

/// A task's place in the per-key queues.
///
/// Dropping the ticket releases its successors, whether the task finished,
/// failed, or was aborted.
pub(crate) struct KeyTicket {
    task: TaskId,
    keys: Vec<String>,
    predecessors: Vec<CancellationToken>,
    done: CancellationToken,
    serializer: Arc<KeyedSerializer>,
}

impl KeyTicket {
    /// Resolves once every earlier task sharing a key has finished
    pub async fn ready(&self) {
        for predecessor in &self.predecessors {
            predecessor.cancelled().await;
        }
    }
}

impl Drop for KeyTicket {
    fn drop(&mut self) {
        self.done.cancel();
        let mut tails = self.serializer.tails.lock();
        for key in &self.keys {
            if tails.get(key).is_some_and(|(owner, _)| *owner == self.task) {
                tails.remove(key);
            }
        }
    }
}
