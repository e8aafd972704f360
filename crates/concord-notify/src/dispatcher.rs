//! Notification dispatcher: per-key mailboxes between the policy engine and
//! the admin sink and local listeners.
//!
//! The engine hands each update over while it still holds the key, so the
//! order updates enter a key's mailbox is the order the engine serialized
//! them. One worker thread per key drains its mailbox; a listener that
//! blocks only stalls the key it is blocking on. A worker whose mailbox
//! stays empty for `mailbox_idle_millis` exits and takes its mailbox with
//! it, so only keys with recent traffic hold a thread.

use concord_core::{Audience, CoreError, CoreResult, NotificationSink, PolicyKey, PolicyUpdate};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{NotifyError, NotifyResult};
use crate::types::{DispatcherConfig, DispatcherStats, ListenerHealth, ListenerId};

struct Listener {
    id: ListenerId,
    sink: Arc<dyn NotificationSink>,
    breaker: Mutex<CircuitBreaker>,
}

struct Mailbox {
    /// Distinguishes a key's successive mailboxes.
    generation: u64,
    sender: Sender<PolicyUpdate>,
    worker: JoinHandle<()>,
}

/// State shared with mailbox workers.
struct Shared {
    admin_sink: Arc<dyn NotificationSink>,
    listeners: RwLock<Vec<Arc<Listener>>>,
    /// Senders are only used with this lock held.
    mailboxes: Mutex<HashMap<PolicyKey, Mailbox>>,
    idle_timeout: Duration,
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    retired: AtomicU64,
    pending: Mutex<u64>,
    idle: Condvar,
}

impl Shared {
    fn mailboxes(&self) -> MutexGuard<'_, HashMap<PolicyKey, Mailbox>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self, update: &PolicyUpdate) {
        self.deliver(update);
        self.finish();
    }

    fn deliver(&self, update: &PolicyUpdate) {
        match &update.audience {
            Audience::Admin(admin) => match call_sink(self.admin_sink.as_ref(), update) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        key = %update.key,
                        admin = %admin,
                        error = %e,
                        "admin notification failed"
                    );
                }
            },
            Audience::Local => {
                let listeners: Vec<Arc<Listener>> = self
                    .listeners
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for listener in listeners {
                    self.deliver_to_listener(&listener, update);
                }
            }
        }
    }

    fn deliver_to_listener(&self, listener: &Listener, update: &PolicyUpdate) {
        let allowed = listener
            .breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_allow();
        if !allowed {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                listener = %listener.id,
                key = %update.key,
                "listener circuit open, skipping"
            );
            return;
        }

        let result = call_sink(listener.sink.as_ref(), update);
        let mut breaker = listener
            .breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(()) => {
                breaker.record_success();
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                breaker.record_failure();
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    listener = %listener.id,
                    key = %update.key,
                    error = %e,
                    "listener failed"
                );
            }
        }
    }

    fn begin(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn finish(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Body of a mailbox worker. Drains `receiver` until every sender is gone,
/// or until it has been idle long enough to retire its mailbox.
fn run_mailbox(
    shared: Arc<Shared>,
    key: PolicyKey,
    generation: u64,
    receiver: Receiver<PolicyUpdate>,
) {
    loop {
        match receiver.recv_timeout(shared.idle_timeout) {
            Ok(update) => shared.process(&update),
            Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                // No update can be sent while the map is locked.
                let mut mailboxes = shared.mailboxes();
                match receiver.try_recv() {
                    Ok(update) => {
                        drop(mailboxes);
                        shared.process(&update);
                    }
                    Err(TryRecvError::Disconnected) => return,
                    Err(TryRecvError::Empty) => {
                        let ours = mailboxes
                            .get(&key)
                            .map_or(false, |m| m.generation == generation);
                        // Not ours means shutdown holds the sender; wait for it to drop.
                        if ours {
                            mailboxes.remove(&key);
                            shared.retired.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(key = %key, "mailbox retired");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Call a sink, turning both errors and panics into `NotifyError`.
fn call_sink(sink: &dyn NotificationSink, update: &PolicyUpdate) -> NotifyResult<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| sink.notify(update))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(NotifyError::SinkFailed(e.to_string())),
        Err(payload) => Err(NotifyError::ListenerPanicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Asynchronous, per-key ordered delivery of policy updates.
///
/// `Admin` updates go to the admin sink; `Local` updates go to every
/// subscribed listener. Failures are counted and logged, never returned to
/// the engine.
pub struct NotificationDispatcher {
    shared: Arc<Shared>,
    config: DispatcherConfig,
    next_listener: AtomicU64,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl NotificationDispatcher {
    pub fn new(admin_sink: Arc<dyn NotificationSink>) -> Self {
        Self::build(admin_sink, DispatcherConfig::default())
    }

    pub fn with_config(
        admin_sink: Arc<dyn NotificationSink>,
        config: DispatcherConfig,
    ) -> NotifyResult<Self> {
        config.validate()?;
        Ok(Self::build(admin_sink, config))
    }

    fn build(admin_sink: Arc<dyn NotificationSink>, config: DispatcherConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                admin_sink,
                listeners: RwLock::new(Vec::new()),
                mailboxes: Mutex::new(HashMap::new()),
                idle_timeout: Duration::from_millis(config.mailbox_idle_millis.max(1)),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                retired: AtomicU64::new(0),
                pending: Mutex::new(0),
                idle: Condvar::new(),
            }),
            config,
            next_listener: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a listener for `Local` updates of every key.
    pub fn subscribe(&self, listener: Arc<dyn NotificationSink>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let breaker = CircuitBreaker::new(
            self.config.failure_threshold,
            Duration::from_secs(self.config.recovery_timeout_seconds),
        );
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(Listener {
                id,
                sink: listener,
                breaker: Mutex::new(breaker),
            }));
        tracing::debug!(listener = %id, "listener subscribed");
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn listener_health(&self, id: ListenerId) -> Option<ListenerHealth> {
        self.shared
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|l| l.id == id)
            .map(|l| {
                l.breaker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .health()
                    .clone()
            })
    }

    /// Queue an update on its key's mailbox, starting the worker if needed.
    pub fn enqueue(&self, update: PolicyUpdate) -> NotifyResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NotifyError::ShutDown);
        }
        let mut mailboxes = self.shared.mailboxes();
        if self.closed.load(Ordering::SeqCst) {
            return Err(NotifyError::ShutDown);
        }

        if !mailboxes.contains_key(&update.key) {
            let mailbox = self.spawn_mailbox(&update.key)?;
            mailboxes.insert(update.key.clone(), mailbox);
        }
        let mailbox = mailboxes
            .get(&update.key)
            .ok_or_else(|| NotifyError::WorkerSpawnFailed(update.key.to_string()))?;

        self.shared.begin();
        if mailbox.sender.send(update).is_err() {
            self.shared.finish();
            return Err(NotifyError::ShutDown);
        }
        Ok(())
    }

    fn spawn_mailbox(&self, key: &PolicyKey) -> NotifyResult<Mailbox> {
        let (sender, receiver) = mpsc::channel::<PolicyUpdate>();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let worker_key = key.clone();
        let worker = thread::Builder::new()
            .name(format!("concord-mailbox-{}", key))
            .spawn(move || run_mailbox(shared, worker_key, generation, receiver))
            .map_err(|e| NotifyError::WorkerSpawnFailed(e.to_string()))?;
        tracing::debug!(key = %key, generation, "mailbox started");
        Ok(Mailbox {
            generation,
            sender,
            worker,
        })
    }

    /// Block until every queued update has been processed. Returns `false`
    /// if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let pending = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (pending, _) = self
            .shared
            .idle
            .wait_timeout_while(pending, timeout, |p| *p > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *pending == 0
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            skipped: self.shared.skipped.load(Ordering::Relaxed),
            pending: *self
                .shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            mailboxes: self.shared.mailboxes().len(),
            retired: self.shared.retired.load(Ordering::Relaxed),
            listeners: self
                .shared
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Stop accepting updates, let workers drain their queues and join them.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mailboxes: Vec<(PolicyKey, Mailbox)> = self.shared.mailboxes().drain().collect();
        let count = mailboxes.len();
        for (key, Mailbox { sender, worker, .. }) in mailboxes {
            drop(sender);
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!(key = %key, "mailbox worker panicked");
            }
        }
        tracing::info!(mailboxes = count, "notification dispatcher shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl NotificationSink for NotificationDispatcher {
    fn notify(&self, update: &PolicyUpdate) -> CoreResult<()> {
        self.enqueue(update.clone())
            .map_err(|e| CoreError::Sink(e.to_string()))
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
