use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tabrelay_common::protocol::TargetId;

/// What the dispatcher knows about one attached execution context.
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub target: TargetId,
    pub index: u32,
    pub url: String,
    pub connected_at: u64,
    pub last_seen_at: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: Mutex<HashMap<TargetId, ConnectionRecord>>,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TargetId, ConnectionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert a record. A reconnecting target keeps its first `connected_at`.
    pub fn record(&self, target: &TargetId, index: u32, url: &str) {
        self.record_at(target, index, url, now_millis());
    }

    pub fn record_at(&self, target: &TargetId, index: u32, url: &str, at: u64) {
        let mut records = self.lock();
        let connected_at = records.get(target).map_or(at, |r| r.connected_at);
        records.insert(
            target.clone(),
            ConnectionRecord {
                target: target.clone(),
                index,
                url: url.to_string(),
                connected_at,
                last_seen_at: at,
            },
        );
    }

    /// Note activity from `target`; unknown targets are ignored.
    pub fn touch(&self, target: &TargetId) -> bool {
        self.touch_at(target, now_millis())
    }

    pub fn touch_at(&self, target: &TargetId, at: u64) -> bool {
        match self.lock().get_mut(target) {
            Some(record) => {
                record.last_seen_at = record.last_seen_at.max(at);
                true
            }
            None => false,
        }
    }

    pub fn update_url(&self, target: &TargetId, url: &str) -> bool {
        match self.lock().get_mut(target) {
            Some(record) => {
                record.url = url.to_string();
                record.last_seen_at = record.last_seen_at.max(now_millis());
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, target: &TargetId) -> Option<ConnectionRecord> {
        self.lock().remove(target)
    }

    pub fn is_connected(&self, target: &TargetId) -> bool {
        self.lock().contains_key(target)
    }

    pub fn get(&self, target: &TargetId) -> Option<ConnectionRecord> {
        self.lock().get(target).cloned()
    }

    pub fn list_connected(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self.lock().keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn find_by_index(&self, index: u32) -> Option<ConnectionRecord> {
        self.lock().values().find(|r| r.index == index).cloned()
    }

    /// Every record, ordered by context index.
    pub fn stats(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.target.cmp(&b.target)));
        records
    }
}
