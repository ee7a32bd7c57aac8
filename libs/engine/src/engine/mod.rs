//! The Controller Engine: a dynamic registry of named controllers, each
//! with its own rate-limited work queue and worker pool.
//!
//! Generalizes a single-controller `Controller::new(...).run(reconcile,
//! error_policy, ctx)` process shape to many controllers registered and
//! torn down at runtime, using `kube-runtime/src/scheduler.rs`'s
//! dedup-by-key, delay-queue-backed scheduling model.

pub mod events;
pub mod gc;
pub mod leader;
pub mod ratelimit;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, instrument, warn};

use crate::client::{Cache, KindClient};
use crate::engine::ratelimit::{PerObjectBackoff, TokenBucket, TOKEN_EXHAUSTED_RETRY};
use crate::error::{Error, Result};
use crate::types::{Gvk, WatchId, WatchKind};

/// A dequeue key: `NamespacedName` of the primary object a reconcile
/// operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for WorkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What a reconcile function may return, mirroring the source's
/// `Done`/`Requeue`/`RequeueAfter(d)`/`Error` vocabulary.
pub enum ReconcileOutcome {
    Done,
    Requeue,
    RequeueAfter(Duration),
    Error(Error),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A per-controller reconcile function. Boxed as a trait object since the
/// engine holds controllers for heterogeneous GVKs discovered at runtime.
pub trait Reconciler: Send + Sync + 'static {
    fn reconcile(&self, key: WorkKey) -> BoxFuture<'_, ReconcileOutcome>;
}

impl<F> Reconciler for F
where
    F: Fn(WorkKey) -> BoxFuture<'static, ReconcileOutcome> + Send + Sync + 'static,
{
    fn reconcile(&self, key: WorkKey) -> BoxFuture<'_, ReconcileOutcome> {
        (self)(key)
    }
}

/// Options a controller is started with. `Start` is idempotent by name
/// PROVIDED these are unchanged; a second `Start` with different opts fails
/// with `AlreadyExists` (the caller must `Stop` first).
#[derive(Clone, PartialEq)]
pub struct ControllerOpts {
    pub gvk: Gvk,
    pub concurrency: usize,
}

struct ControllerHandle {
    opts: ControllerOpts,
    watches: Arc<StdMutex<HashSet<WatchId>>>,
    watch_tasks: Arc<StdMutex<HashMap<WatchId, AbortHandle>>>,
    cancel: CancellationToken,
    scheduler_tx: mpsc::UnboundedSender<SchedulerMsg>,
    reconcile_timeout: Duration,
    /// Join handles for this controller's worker pool. Awaited by `stop`
    /// after cancellation so a `Stop` never returns while a reconcile it
    /// should have pre-empted is still running — a later `Start` of the
    /// same name is guaranteed to see no in-flight work from the old one.
    worker_tasks: Vec<tokio::task::JoinHandle<()>>,
}

enum SchedulerMsg {
    Schedule(WorkKey, Duration),
}

/// Spawns the watch stream for one `WatchId`: feeds the per-GVK reflector
/// store so `Cache` stays populated, and — for the controller's primary
/// `CompositeResource` kind only — enqueues a `WorkKey` on every apply/delete
/// event, which is how events delivered by a watch reach the controller's
/// work queue. Other watch kinds (composed children, claims, composition revisions)
/// populate the cache only; they do not themselves drive a reconcile.
fn spawn_watch(
    client: KindClient,
    cache: Cache,
    watch_id: WatchId,
    controller_name: String,
    scheduler_tx: mpsc::UnboundedSender<SchedulerMsg>,
) -> AbortHandle {
    let gvk = watch_id.gvk.clone();
    let drives_reconcile = watch_id.kind == WatchKind::CompositeResource;
    let writer = cache.register(gvk.clone());
    let api = client.api_for(&gvk, None);

    let task = tokio::spawn(async move {
        let stream = watcher(api, watcher::Config::default().any_semantic())
            .default_backoff()
            .reflect(writer);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::Delete(obj)) => {
                    if drives_reconcile {
                        let key = WorkKey { namespace: obj.namespace(), name: obj.name_any() };
                        let _ = scheduler_tx.send(SchedulerMsg::Schedule(key, Duration::ZERO));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(controller = %controller_name, gvk = %gvk.kind, error = %e, "watch stream error, reconnecting with backoff");
                }
            }
        }
    });
    task.abort_handle()
}

/// The engine's public contract: `Start`, `Stop`, `StartWatches`,
/// `StopWatches`, `GetWatches`, `GetClient`.
pub struct Engine {
    client: KindClient,
    cache: Cache,
    registry: StdMutex<HashMap<String, ControllerHandle>>,
    global_bucket: Arc<TokenBucket>,
    backoff: Arc<PerObjectBackoff>,
    reconcile_timeout: Duration,
}

impl Engine {
    pub fn new(client: KindClient, max_reconcile_rate: f64, reconcile_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            client,
            cache: Cache::new(),
            registry: StdMutex::new(HashMap::new()),
            global_bucket: Arc::new(TokenBucket::new(max_reconcile_rate)),
            backoff: Arc::new(PerObjectBackoff::new()),
            reconcile_timeout,
        })
    }

    pub fn get_client(&self) -> KindClient {
        self.client.clone()
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Idempotent by name: a `Start` for a name already running with the
    /// SAME opts is a no-op; with DIFFERENT opts it fails with
    /// `AlreadyExists` and the caller must `Stop` first.
    #[instrument(skip(self, reconciler), fields(controller = name))]
    pub fn start(self: &Arc<Self>, name: &str, opts: ControllerOpts, reconciler: Arc<dyn Reconciler>) -> Result<()> {
        let mut registry = self.registry.lock().expect("engine registry poisoned");
        if let Some(existing) = registry.get(name) {
            return if existing.opts == opts {
                Ok(())
            } else {
                Err(Error::AlreadyExists(name.to_string()))
            };
        }

        let cancel = CancellationToken::new();
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let primary = WatchId { kind: WatchKind::CompositeResource, gvk: opts.gvk.clone() };
        let watches = Arc::new(StdMutex::new(HashSet::from([primary.clone()])));
        let watch_tasks = Arc::new(StdMutex::new(HashMap::new()));
        watch_tasks.lock().expect("watch task map poisoned").insert(
            primary.clone(),
            spawn_watch(self.client.clone(), self.cache.clone(), primary, name.to_string(), scheduler_tx.clone()),
        );

        let dispatch_concurrency = opts.concurrency.max(1);
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<WorkKey>(dispatch_concurrency * 4);

        spawn_scheduler(scheduler_rx, dispatch_tx, cancel.clone());
        let worker_tasks = spawn_workers(
            name.to_string(),
            dispatch_rx,
            dispatch_concurrency,
            reconciler,
            self.global_bucket.clone(),
            self.backoff.clone(),
            scheduler_tx.clone(),
            cancel.clone(),
            self.reconcile_timeout,
        );

        registry.insert(
            name.to_string(),
            ControllerHandle {
                opts,
                watches,
                watch_tasks,
                cancel,
                scheduler_tx,
                reconcile_timeout: self.reconcile_timeout,
                worker_tasks,
            },
        );
        info!(msg = "controller started", controller = name);
        Ok(())
    }

    /// Cancels the context, releases all watches, and waits for every
    /// worker in the controller's pool to drain its current reconcile (if
    /// any) and exit before returning. This gives callers a happens-before
    /// guarantee: once `Stop` returns, no reconcile started under the old
    /// registration is still running, so a subsequent `Start` of the same
    /// name never races an old worker's in-flight write. Safe to call on
    /// absent names.
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        let handle = {
            let mut registry = self.registry.lock().expect("engine registry poisoned");
            registry.remove(name)
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            for watch in handle.watches.lock().expect("watch set poisoned").iter() {
                self.cache.unregister(&watch.gvk);
            }
            for (_, task) in handle.watch_tasks.lock().expect("watch task map poisoned").drain() {
                task.abort();
            }
            for worker in handle.worker_tasks {
                if let Err(e) = worker.await {
                    warn!(controller = %name, error = %e, "worker task panicked while stopping");
                }
            }
            info!(msg = "controller stopped", controller = name);
        }
        Ok(())
    }

    /// Enqueues `key` for reconciliation by controller `name`.
    pub fn enqueue(&self, name: &str, key: WorkKey) {
        let registry = self.registry.lock().expect("engine registry poisoned");
        if let Some(handle) = registry.get(name) {
            let _ = handle.scheduler_tx.send(SchedulerMsg::Schedule(key, Duration::ZERO));
        }
    }

    /// Adds watches; duplicates are ignored.
    pub fn start_watches(&self, name: &str, ids: &[WatchId]) -> Result<()> {
        let registry = self.registry.lock().expect("engine registry poisoned");
        let handle = registry.get(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        let mut watches = handle.watches.lock().expect("watch set poisoned");
        let mut tasks = handle.watch_tasks.lock().expect("watch task map poisoned");
        for id in ids {
            if watches.insert(id.clone()) {
                let task = spawn_watch(self.client.clone(), self.cache.clone(), id.clone(), name.to_string(), handle.scheduler_tx.clone());
                tasks.insert(id.clone(), task);
            }
        }
        Ok(())
    }

    /// Drops the listed watches; returns the count actually stopped. Events
    /// already enqueued for processing are still processed.
    pub fn stop_watches(&self, name: &str, ids: &[WatchId]) -> Result<usize> {
        let registry = self.registry.lock().expect("engine registry poisoned");
        let handle = registry.get(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        let mut watches = handle.watches.lock().expect("watch set poisoned");
        let mut tasks = handle.watch_tasks.lock().expect("watch task map poisoned");
        let mut stopped = 0;
        for id in ids {
            if watches.remove(id) {
                self.cache.unregister(&id.gvk);
                if let Some(task) = tasks.remove(id) {
                    task.abort();
                }
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    pub fn get_watches(&self, name: &str) -> Vec<WatchId> {
        let registry = self.registry.lock().expect("engine registry poisoned");
        match registry.get(name) {
            Some(handle) => handle.watches.lock().expect("watch set poisoned").iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.registry.lock().expect("engine registry poisoned").contains_key(name)
    }

    pub fn controller_names(&self) -> Vec<String> {
        self.registry.lock().expect("engine registry poisoned").keys().cloned().collect()
    }

    /// Stops every currently-registered controller, draining each one's
    /// workers in turn. Used on leadership loss, where every dynamically
    /// started composite/claim controller (not just the static ones) must
    /// stop within bounded time.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) {
        for name in self.controller_names() {
            let _ = self.stop(&name).await;
        }
    }
}

/// The scheduler task: a `DelayQueue`-backed, dedup-by-key-keep-earliest
/// timer, directly modeled on the pack's `kube_runtime::scheduler`. Ready
/// keys are forwarded to the worker dispatch channel.
fn spawn_scheduler(mut rx: mpsc::UnboundedReceiver<SchedulerMsg>, dispatch_tx: mpsc::Sender<WorkKey>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut queue: DelayQueue<WorkKey> = DelayQueue::new();
        let mut keys: HashMap<WorkKey, delay_queue::Key> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => {
                    match msg {
                        Some(SchedulerMsg::Schedule(key, delay)) => {
                            if let Some(existing) = keys.get(&key) {
                                // Dedup by key, keeping the earliest deadline.
                                queue.reset(existing, delay);
                            } else {
                                let qk = queue.insert(key.clone(), delay);
                                keys.insert(key, qk);
                            }
                        }
                        None => break,
                    }
                }
                Some(expired) = queue.next(), if !queue.is_empty() => {
                    let Ok(expired) = expired else { continue };
                    let key = expired.into_inner();
                    keys.remove(&key);
                    if dispatch_tx.send(key).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn spawn_workers(
    controller_name: String,
    dispatch_rx: mpsc::Receiver<WorkKey>,
    concurrency: usize,
    reconciler: Arc<dyn Reconciler>,
    global_bucket: Arc<TokenBucket>,
    backoff: Arc<PerObjectBackoff>,
    scheduler_tx: mpsc::UnboundedSender<SchedulerMsg>,
    cancel: CancellationToken,
    reconcile_timeout: Duration,
) -> Vec<tokio::task::JoinHandle<()>> {
    let dispatch_rx = Arc::new(AsyncMutex::new(dispatch_rx));
    // Per-key locks provide at most one reconcile for a given (controller,
    // key) at a time; different keys proceed in parallel up to
    // `concurrency`.
    let key_locks: Arc<DashMap<WorkKey, Arc<AsyncMutex<()>>>> = Arc::new(DashMap::new());
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut handles = Vec::with_capacity(concurrency);

    for worker_id in 0..concurrency {
        let dispatch_rx = dispatch_rx.clone();
        let reconciler = reconciler.clone();
        let global_bucket = global_bucket.clone();
        let backoff = backoff.clone();
        let scheduler_tx = scheduler_tx.clone();
        let cancel = cancel.clone();
        let key_locks = key_locks.clone();
        let permits = permits.clone();
        let controller_name = controller_name.clone();

        let handle = tokio::spawn(async move {
            loop {
                let key = {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let mut rx = dispatch_rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = rx.recv() => match item {
                            Some(k) => k,
                            None => break,
                        }
                    }
                };

                if !global_bucket.try_acquire() {
                    // Non-blocking: do not hold a worker waiting for a
                    // token, re-queue with a short delay instead.
                    let _ = scheduler_tx.send(SchedulerMsg::Schedule(key, TOKEN_EXHAUSTED_RETRY));
                    continue;
                }

                let _permit = permits.acquire().await;
                let lock = key_locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone();
                let _guard = lock.lock().await;

                debug!(worker = worker_id, controller = %controller_name, key = %key, "dequeued");

                let outcome = match tokio::time::timeout(reconcile_timeout, reconciler.reconcile(key.clone())).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(controller = %controller_name, key = %key, "reconcile timed out");
                        ReconcileOutcome::Requeue
                    }
                };

                match outcome {
                    ReconcileOutcome::Done => {
                        backoff.reset(&controller_name, &key);
                    }
                    ReconcileOutcome::Requeue => {
                        let delay = backoff.next(&controller_name, &key);
                        let _ = scheduler_tx.send(SchedulerMsg::Schedule(key, delay));
                    }
                    ReconcileOutcome::RequeueAfter(d) => {
                        // Skips the per-object backoff but is still subject
                        // to the global token bucket, already consumed above.
                        let _ = scheduler_tx.send(SchedulerMsg::Schedule(key, d));
                    }
                    ReconcileOutcome::Error(e) => {
                        error!(controller = %controller_name, key = %key, error = %e, "reconcile failed");
                        let delay = backoff.next(&controller_name, &key);
                        let _ = scheduler_tx.send(SchedulerMsg::Schedule(key, delay));
                    }
                }
            }
        });
        handles.push(handle);
    }
    handles
}
