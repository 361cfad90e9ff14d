//! Bounded pool of reusable execution slots.
//!
//! Slots are spawned lazily up to `capacity` and parked in an idle queue after every job,
//! so a burst of submissions never runs more than `capacity` jobs at once. When every slot
//! is busy `submit` waits for one to come back instead of rejecting the job.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PoolError;

/// A unit of work run by one slot.
pub type Job = BoxFuture<'static, ()>;

/// Capacity-limited pool. Cloning shares the same slots.
#[derive(Clone)]
pub struct BoundedPool {
    inner: Arc<Inner>,
}

struct Inner {
    capacity: usize,
    live: Arc<AtomicUsize>,
    closed: AtomicBool,
    idle_tx: mpsc::UnboundedSender<Slot>,
    idle_rx: Mutex<mpsc::UnboundedReceiver<Slot>>,
    shutdown: CancellationToken,
}

/// Handle to an idle slot; sending a job wakes it.
struct Slot {
    jobs: mpsc::Sender<Job>,
}

impl BoundedPool {
    /// Create a pool running at most `capacity` jobs concurrently.
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                capacity,
                live: Arc::new(AtomicUsize::new(0)),
                closed: AtomicBool::new(false),
                idle_tx,
                idle_rx: Mutex::new(idle_rx),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of slots currently alive (idle or busy).
    pub fn live_slots(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Hand `job` to a slot, waiting for one to become free if all are busy.
    pub async fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let slot = self.inner.acquire().await?;
        slot.jobs
            .send(job.boxed())
            .await
            .map_err(|_| PoolError::Closed)
    }

    /// Submit every job and wait until all accepted jobs have finished.
    ///
    /// Returns the first submission error, but only after the accepted jobs completed.
    pub async fn submit_batch<I, F>(&self, jobs: I) -> Result<(), PoolError>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = ()> + Send + 'static,
    {
        // Each accepted job holds a sender; the channel closes once all of them dropped.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let mut first_err = None;

        for job in jobs {
            let guard = done_tx.clone();
            let submitted = self
                .submit(async move {
                    job.await;
                    drop(guard);
                })
                .await;
            if let Err(e) = submitted {
                first_err.get_or_insert(e);
            }
        }

        drop(done_tx);
        let _ = done_rx.recv().await;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop accepting work. Idle slots exit; running jobs finish.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(capacity = self.inner.capacity, "Pool closed");
        }
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Take an idle slot, spawn a new one below capacity, or wait for one to free up.
    async fn acquire(&self) -> Result<Slot, PoolError> {
        let mut idle = self.idle_rx.lock().await;

        if let Ok(slot) = idle.try_recv() {
            return Ok(slot);
        }

        if self.live.load(Ordering::SeqCst) < self.capacity {
            self.live.fetch_add(1, Ordering::SeqCst);
            return Ok(self.spawn_slot());
        }

        tokio::select! {
            slot = idle.recv() => slot.ok_or(PoolError::Closed),
            _ = self.shutdown.cancelled() => Err(PoolError::Closed),
        }
    }

    fn spawn_slot(&self) -> Slot {
        let (jobs_tx, mut jobs_rx) = mpsc::channel::<Job>(1);
        let idle_tx = self.idle_tx.clone();
        let shutdown = self.shutdown.clone();
        let live = Arc::clone(&self.live);
        let own_tx = jobs_tx.clone();

        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    biased;
                    job = jobs_rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };

                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    warn!("Pool job panicked; slot keeps serving");
                }

                if idle_tx
                    .send(Slot {
                        jobs: own_tx.clone(),
                    })
                    .is_err()
                {
                    break;
                }
            }
            live.fetch_sub(1, Ordering::SeqCst);
        });

        Slot { jobs: jobs_tx }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
