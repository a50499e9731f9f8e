//! Least-recently-used eviction, driven by a background worker.
//!
//! Producers never touch the ordering directly. They post [`Message`]s to a bounded channel and a
//! single worker task owns the ordered key map. Eviction requests pop keys off the cold end and
//! hand each one to a [`Deleter`] on its own task.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use hashlink::LinkedHashMap;
use tokio::sync::mpsc::{self, Receiver, error::TrySendError};
use tokio::task::JoinHandle;

/// Values carrying a monotonic version, so a stale upsert cannot overwrite a newer one.
pub trait Versioned {
    /// The version of this value.
    fn version(&self) -> u64;
}

/// Removes evicted keys from whatever store the tracker orders.
pub trait Deleter<K, Ctx>: Send + Clone + 'static {
    /// Delete `key`. Keys arrive coldest first.
    fn delete(&mut self, key: K, ctx: Ctx) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy)]
enum Message<K, C> {
    /// `key` was used. Carries the cull epoch observed by the producer.
    Accessed(K, usize),
    /// Evict up to this many keys.
    Evict(u32),
    /// `key` was inserted or replaced.
    Upserted(K, C),
}

/// Counts outstanding eviction work in one packed atomic.
///
/// The upper 32 bits count queued `Evict` messages, the lower 32 bits count deletions that have
/// been spawned but not finished. Zero means the tracker is quiescent.
#[derive(Debug, Default)]
struct PendingWork(AtomicI64);

impl PendingWork {
    const BATCH: i64 = 1 << 32;

    fn queue_batch(&self) {
        self.0.fetch_add(Self::BATCH, Ordering::Relaxed);
    }

    fn unqueue_batch(&self) {
        self.0.fetch_sub(Self::BATCH, Ordering::Relaxed);
    }

    /// One batch left the queue and turned into `deletions` running deletions.
    fn start_batch(&self, deletions: u32) {
        self.0
            .fetch_add(i64::from(deletions) - Self::BATCH, Ordering::Relaxed);
    }

    fn finish_deletion(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    fn any(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }
}

#[derive(Debug)]
struct Shared {
    pending: PendingWork,
    /// Bumped on every cull. Accesses stamped with an older epoch may refer to keys the cull
    /// already handed out, so the worker ignores them.
    cull_epoch: AtomicUsize,
    worker: OnceLock<JoinHandle<()>>,
}

struct Worker<K, C, D> {
    receiver: Receiver<Message<K, C>>,
    order: LinkedHashMap<K, C>,
    deleter: D,
    shared: Arc<Shared>,
}

impl<K, C, D> Worker<K, C, D>
where
    K: Copy + Eq + Hash + Send + 'static,
    C: Versioned + Send + 'static,
    D: Deleter<K, C>,
{
    async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            self.handle(msg);
        }
    }

    fn handle(&mut self, msg: Message<K, C>) {
        match msg {
            Message::Accessed(key, epoch) => {
                if epoch < self.shared.cull_epoch.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(ctx) = self.order.remove(&key) {
                    self.order.insert(key, ctx);
                }
            }
            Message::Upserted(key, ctx) => {
                if self
                    .order
                    .get(&key)
                    .is_some_and(|existing| ctx.version() < existing.version())
                {
                    return;
                }
                self.order.remove(&key);
                self.order.insert(key, ctx);
            }
            Message::Evict(max) => self.cull(max),
        }
    }

    fn cull(&mut self, max: u32) {
        self.shared.cull_epoch.fetch_add(1, Ordering::Relaxed);

        let count = u32::try_from(self.order.len()).map_or(max, |len| len.min(max));
        self.shared.pending.start_batch(count);

        for _ in 0..count {
            let Some((key, ctx)) = self.order.pop_front() else {
                // Unreachable while `count <= len`, but keep the counter honest regardless.
                self.shared.pending.finish_deletion();
                continue;
            };
            let mut deleter = self.deleter.clone();
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                // Runs even if the deletion panics or its task is aborted.
                struct Done(Arc<Shared>);
                impl Drop for Done {
                    fn drop(&mut self) {
                        self.0.pending.finish_deletion();
                    }
                }
                let _done = Done(shared);
                deleter.delete(key, ctx).await;
            });
        }
    }
}

/// Orders keys by recency and evicts the coldest on request.
#[derive(Debug)]
pub struct LruEvictionTracker<K, C> {
    sender: mpsc::Sender<Message<K, C>>,
    shared: Arc<Shared>,
}

impl<K, C> LruEvictionTracker<K, C>
where
    K: Copy + Eq + Hash + Send + 'static,
    C: Versioned + Copy + Send + 'static,
{
    /// Spawn the worker on the current runtime.
    pub fn spawn<D: Deleter<K, C>>(deleter: D, channel_size: usize) -> Self {
        let (sender, receiver) = mpsc::channel(channel_size);
        let shared = Arc::new(Shared {
            pending: PendingWork::default(),
            cull_epoch: AtomicUsize::new(0),
            worker: OnceLock::new(),
        });
        let worker = Worker {
            receiver,
            order: LinkedHashMap::new(),
            deleter,
            shared: Arc::clone(&shared),
        };
        if shared.worker.set(tokio::spawn(worker.run())).is_err() {
            unreachable!("the worker slot is filled exactly once, here");
        }
        Self { sender, shared }
    }

    /// Post a message without awaiting, so a cancelled caller cannot lose it.
    fn post(&self, msg: Message<K, C>) {
        match self.sender.try_send(msg) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(msg)) => {
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(msg).await;
                });
            }
        }
    }

    /// Record that `key` was inserted or replaced.
    pub fn upsert(&self, key: K, ctx: C) {
        self.post(Message::Upserted(key, ctx));
    }

    /// Record that `key` was used.
    pub fn access(&self, key: K) {
        let epoch = self.shared.cull_epoch.load(Ordering::Relaxed);
        self.post(Message::Accessed(key, epoch));
    }

    /// Ask the worker to evict up to `max_count` of the coldest keys.
    ///
    /// Returns `false` when the channel is full; the caller should retry later. The batch is
    /// counted before it is sent so [`Self::have_pending_culls`] never misses it.
    #[must_use]
    pub fn try_cull(&self, max_count: u32) -> bool {
        self.shared.pending.queue_batch();
        if self.sender.try_send(Message::Evict(max_count)).is_ok() {
            true
        } else {
            self.shared.pending.unqueue_batch();
            false
        }
    }

    /// Whether culls are queued or deletions are still running.
    #[must_use]
    pub fn have_pending_culls(&self) -> bool {
        self.shared.pending.any()
    }
}

impl<K, C> Drop for LruEvictionTracker<K, C> {
    fn drop(&mut self) {
        if let Some(worker) = self.shared.worker.get() {
            worker.abort();
        }
    }
}
