use std::collections::HashMap;
use tokio::time::Instant;

use grange_core::{CallError, MessageId};
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};

/// Shard count for the pending map. The id counter occupies the high bits
/// of a message id, so consecutive ids spread across shards.
const SHARDS: usize = 16;

/// One outstanding call awaiting its response, timeout, or cancellation.
pub(crate) struct PendingEntry {
    pub deadline: Instant,
    pub server_id: String,
    pub interface: String,
    pub method: String,
    pub tx: oneshot::Sender<Result<Vec<u8>, CallError>>,
}

/// Sharded pending-request table.
///
/// The timer task and the ingress decoder hit this concurrently; one lock
/// per shard keeps them off each other. Per-server counts enforce the
/// back-pressure ceiling, and `sweep_notify` wakes the timer whenever an
/// earlier deadline appears.
pub(crate) struct PendingMap {
    shards: Vec<Mutex<HashMap<u128, PendingEntry>>>,
    counts: Mutex<HashMap<String, u32>>,
    pub sweep_notify: Notify,
}

impl PendingMap {
    pub fn new() -> Self {
        PendingMap {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            counts: Mutex::new(HashMap::new()),
            sweep_notify: Notify::new(),
        }
    }

    fn shard(&self, id: MessageId) -> &Mutex<HashMap<u128, PendingEntry>> {
        &self.shards[(id.counter() as usize) % SHARDS]
    }

    /// Installs a pending entry, enforcing the per-connection ceiling.
    ///
    /// `DuplicateRequestId` here means the id generator is broken; the
    /// entry already present is left untouched.
    pub fn insert(
        &self,
        id: MessageId,
        entry: PendingEntry,
        max_per_connection: u32,
    ) -> Result<(), CallError> {
        {
            let mut counts = self.counts.lock();
            let count = counts.entry(entry.server_id.clone()).or_insert(0);
            if *count >= max_per_connection {
                return Err(CallError::Overloaded);
            }
            *count += 1;
        }

        let server_id = entry.server_id.clone();
        let mut shard = self.shard(id).lock();
        if shard.contains_key(&id.0) {
            drop(shard);
            self.decrement(&server_id);
            return Err(CallError::DuplicateRequestId(id));
        }
        shard.insert(id.0, entry);
        drop(shard);

        // Wake the sweeper; this deadline may now be the earliest.
        self.sweep_notify.notify_waiters();
        Ok(())
    }

    fn decrement(&self, server_id: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(server_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(server_id);
            }
        }
    }

    /// Removes an entry, e.g. for cancellation. The caller decides what,
    /// if anything, to resolve the completion with.
    pub fn remove(&self, id: MessageId) -> Option<PendingEntry> {
        let entry = self.shard(id).lock().remove(&id.0)?;
        self.decrement(&entry.server_id);
        Some(entry)
    }

    /// Resolves an entry with a result. Returns `false` when the id is
    /// unknown (a late response to drop).
    pub fn complete(&self, id: MessageId, result: Result<Vec<u8>, CallError>) -> bool {
        match self.remove(id) {
            Some(entry) => {
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Fails every entry dispatched to `server_id`. Returns how many were
    /// failed.
    pub fn fail_server(&self, server_id: &str, err: CallError) -> usize {
        let mut failed = 0;
        for shard in &self.shards {
            let drained: Vec<PendingEntry> = {
                let mut shard = shard.lock();
                let ids: Vec<u128> = shard
                    .iter()
                    .filter(|(_, e)| e.server_id == server_id)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter().filter_map(|id| shard.remove(&id)).collect()
            };
            for entry in drained {
                let _ = entry.tx.send(Err(err.clone()));
                failed += 1;
            }
        }
        self.counts.lock().remove(server_id);
        failed
    }

    /// Expires every entry whose deadline has passed, resolving each with
    /// `Timeout`. Returns how many expired.
    pub fn expire(&self, now: Instant) -> usize {
        let mut expired = 0;
        for shard in &self.shards {
            let drained: Vec<PendingEntry> = {
                let mut shard = shard.lock();
                let ids: Vec<u128> = shard
                    .iter()
                    .filter(|(_, e)| e.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter().filter_map(|id| shard.remove(&id)).collect()
            };
            for entry in drained {
                self.decrement(&entry.server_id);
                tracing::debug!(
                    interface = %entry.interface,
                    method = %entry.method,
                    "request deadline expired"
                );
                let _ = entry.tx.send(Err(CallError::Timeout));
                expired += 1;
            }
        }
        expired
    }

    /// Earliest outstanding deadline, for the sweeper's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shards
            .iter()
            .filter_map(|shard| shard.lock().values().map(|e| e.deadline).min())
            .min()
    }

    pub fn count_for(&self, server_id: &str) -> u32 {
        self.counts.lock().get(server_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}
