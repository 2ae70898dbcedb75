use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use grange_core::{
    CallError, CatalogMetrics, CatalogMetricsSnapshot, GrainId, UserIdentity, with_identity,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{Grain, GrainInstance, GrainTypeEntry, RawHandler, ServiceContainer};

const CATALOG_SHARDS: usize = 16;

/// One invocation bound for an activation's mailbox.
pub struct InvokeJob {
    pub handler: RawHandler,
    pub args: Vec<u8>,
    pub identity: Arc<UserIdentity>,
    /// Consumes the outcome: sends the response frame, or just releases
    /// the in-flight permit for one-way calls.
    pub respond: Box<dyn FnOnce(Result<Vec<u8>, CallError>) + Send>,
}

impl std::fmt::Debug for InvokeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeJob")
            .field("args_len", &self.args.len())
            .finish()
    }
}

/// A live grain instance with its serialized mailbox.
///
/// All calls to one activation run on its worker task in enqueue order;
/// activations of distinct grains run concurrently.
pub struct Activation {
    grain_id: GrainId,
    jobs: mpsc::UnboundedSender<InvokeJob>,
    last_access: Mutex<Instant>,
}

impl Activation {
    pub fn grain_id(&self) -> &GrainId {
        &self.grain_id
    }

    /// Hands a job to the worker. Fails with the job when the worker is
    /// gone (evicted or failed activation); the caller re-activates.
    pub fn enqueue(&self, job: InvokeJob) -> Result<(), InvokeJob> {
        *self.last_access.lock() = Instant::now();
        self.jobs.send(job).map_err(|e| e.0)
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }
}

/// Server-side registry of live activations, keyed by grain id.
///
/// At most one activation per grain id exists at a time; creation is lazy
/// on the first inbound request.
pub struct GrainCatalog {
    shards: Vec<Mutex<HashMap<GrainId, Arc<Activation>>>>,
    metrics: Arc<CatalogMetrics>,
}

impl GrainCatalog {
    pub fn new() -> Self {
        GrainCatalog {
            shards: (0..CATALOG_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            metrics: Arc::new(CatalogMetrics::default()),
        }
    }

    fn shard(&self, grain_id: &GrainId) -> &Mutex<HashMap<GrainId, Arc<Activation>>> {
        let mut hasher = DefaultHasher::new();
        grain_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % CATALOG_SHARDS]
    }

    /// Returns the existing activation or creates one: resolve the
    /// constructor through the service container, spawn the worker, run
    /// the activation callback before the first call.
    pub fn get_or_activate(
        &self,
        grain_id: &GrainId,
        entry: &GrainTypeEntry,
        services: &ServiceContainer,
    ) -> Result<Arc<Activation>, CallError> {
        let shard = self.shard(grain_id);
        let mut map = shard.lock();
        if let Some(activation) = map.get(grain_id) {
            *activation.last_access.lock() = Instant::now();
            return Ok(activation.clone());
        }

        let (instance, lifecycle) = (entry.factory)(grain_id, services)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let activation = Arc::new(Activation {
            grain_id: grain_id.clone(),
            jobs: tx,
            last_access: Mutex::new(Instant::now()),
        });
        map.insert(grain_id.clone(), activation.clone());
        drop(map);

        self.metrics
            .activations
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tokio::spawn(activation_worker(
            grain_id.clone(),
            instance,
            lifecycle,
            rx,
            self.metrics.clone(),
        ));
        tracing::debug!(grain = %grain_id, "activated");
        Ok(activation)
    }

    /// Drops an activation. Its worker drains buffered jobs, runs the
    /// deactivation callback, and exits.
    pub fn deactivate(&self, grain_id: &GrainId) -> bool {
        self.shard(grain_id).lock().remove(grain_id).is_some()
    }

    pub fn contains(&self, grain_id: &GrainId) -> bool {
        self.shard(grain_id).lock().contains_key(grain_id)
    }

    pub fn activation_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Removes activations idle longer than `max_idle`. Returns how many
    /// were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut map = shard.lock();
            let idle: Vec<GrainId> = map
                .iter()
                .filter(|(_, a)| a.idle_for() > max_idle)
                .map(|(id, _)| id.clone())
                .collect();
            for id in idle {
                map.remove(&id);
                evicted += 1;
                tracing::debug!(grain = %id, "evicted idle activation");
            }
        }
        if evicted > 0 {
            self.metrics
                .evictions
                .fetch_add(evicted as u64, std::sync::atomic::Ordering::Relaxed);
        }
        evicted
    }

    pub fn metrics(&self) -> CatalogMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for GrainCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-activation worker: runs the activation callback, then executes
/// jobs strictly in mailbox order. A panicking handler fails its own call
/// and the activation survives.
async fn activation_worker(
    grain_id: GrainId,
    instance: GrainInstance,
    lifecycle: Arc<dyn Grain>,
    mut jobs: mpsc::UnboundedReceiver<InvokeJob>,
    metrics: Arc<CatalogMetrics>,
) {
    if let Err(e) = lifecycle.on_activate().await {
        tracing::warn!(grain = %grain_id, error = %e, "activation callback failed");
        jobs.close();
        while let Ok(job) = jobs.try_recv() {
            (job.respond)(Err(CallError::Internal(format!(
                "activation failed: {}",
                e
            ))));
        }
        return;
    }

    while let Some(job) = jobs.recv().await {
        metrics
            .invocations
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let fut = with_identity(job.identity, (job.handler)(instance.clone(), job.args));
        let result = match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(grain = %grain_id, panic = %msg, "handler panicked");
                Err(CallError::Internal(format!("handler panicked: {}", msg)))
            }
        };
        if result.is_err() {
            metrics
                .handler_errors
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        (job.respond)(result);
    }

    lifecycle.on_deactivate().await;
    tracing::debug!(grain = %grain_id, "deactivated");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
