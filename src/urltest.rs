//! URL-test history: latency measurements per outbound tag plus an update
//! signal consumed by the control channel.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UrlTestHistory {
    /// Unix seconds of the measurement.
    pub time: i64,
    /// Measured delay in milliseconds.
    pub delay: u32,
}

pub struct HistoryStorage {
    entries: Mutex<HashMap<String, UrlTestHistory>>,
    update: broadcast::Sender<()>,
}

impl HistoryStorage {
    pub fn new() -> Self {
        let (update, _) = broadcast::channel(16);
        Self {
            entries: Mutex::new(HashMap::new()),
            update,
        }
    }

    pub fn load(&self, tag: &str) -> Option<UrlTestHistory> {
        self.entries.lock().get(tag).copied()
    }

    pub fn store(&self, tag: impl Into<String>, history: UrlTestHistory) {
        self.entries.lock().insert(tag.into(), history);
        let _ = self.update.send(());
    }

    pub fn delete(&self, tag: &str) {
        self.entries.lock().remove(tag);
        let _ = self.update.send(());
    }

    /// Fires after every store/delete; used to gate provider-list pushes.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.update.subscribe()
    }
}

impl Default for HistoryStorage {
    fn default() -> Self {
        Self::new()
    }
}
