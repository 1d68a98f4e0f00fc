use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tabrelay_common::protocol::TargetId;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub instruction: Value,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub target: TargetId,
    pub pending: usize,
    pub oldest_age_ms: u64,
}

/// Per-target FIFO of raw instruction payloads.
///
/// Payloads stay opaque here; contexts parse them when they run. A target
/// whose queue empties is forgotten.
#[derive(Debug, Default)]
pub struct InstructionQueue {
    queues: Mutex<HashMap<TargetId, VecDeque<QueueEntry>>>,
}

impl InstructionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TargetId, VecDeque<QueueEntry>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, target: &TargetId, instructions: Vec<Value>) -> usize {
        if instructions.is_empty() {
            return 0;
        }
        let now = Instant::now();
        let count = instructions.len();
        self.lock()
            .entry(target.clone())
            .or_default()
            .extend(instructions.into_iter().map(|instruction| QueueEntry {
                instruction,
                enqueued_at: now,
            }));
        count
    }

    pub fn drain_all(&self, target: &TargetId) -> Vec<Value> {
        self.lock()
            .remove(target)
            .map(|entries| entries.into_iter().map(|e| e.instruction).collect())
            .unwrap_or_default()
    }

    pub fn drain_first(&self, target: &TargetId) -> Option<Value> {
        let mut queues = self.lock();
        let queue = queues.get_mut(target)?;
        let first = queue.pop_front().map(|e| e.instruction);
        if queue.is_empty() {
            queues.remove(target);
        }
        first
    }

    pub fn count(&self, target: &TargetId) -> usize {
        self.lock().get(target).map_or(0, VecDeque::len)
    }

    pub fn total_pending(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    /// Drop a target's queue, returning how many entries it held.
    pub fn clear(&self, target: &TargetId) -> usize {
        self.lock().remove(target).map_or(0, |q| q.len())
    }

    /// Non-empty queues, ordered by target.
    pub fn stats_all(&self) -> Vec<QueueStats> {
        let now = Instant::now();
        let mut stats: Vec<QueueStats> = self
            .lock()
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(target, queue)| QueueStats {
                target: target.clone(),
                pending: queue.len(),
                oldest_age_ms: queue
                    .front()
                    .map(|e| millis(now.saturating_duration_since(e.enqueued_at)))
                    .unwrap_or(0),
            })
            .collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target));
        stats
    }

    /// Remove entries at least `max_age` old; returns how many went.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        self.sweep_expired_at(Instant::now(), max_age)
    }

    pub fn sweep_expired_at(&self, now: Instant, max_age: Duration) -> usize {
        let mut removed = 0;
        let mut queues = self.lock();
        queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|e| now.saturating_duration_since(e.enqueued_at) < max_age);
            removed += before - queue.len();
            !queue.is_empty()
        });
        removed
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
