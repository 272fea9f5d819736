//! # Fence Waiter
//!
//! Turns blocking sync point waits into asynchronous notifications serviced by
//! a bounded pool of waiter threads. A wait only goes to a worker that is idle;
//! when all of them are blocked, it gets a dedicated overflow thread, so a fence
//! that is never reached cannot hold up notifications for later ones.
//!
//! A queued wait cannot be cancelled: its worker blocks until the fence is
//! reached and then signals exactly once. Callers that need to give up should
//! loop on [`FenceWaiter::wait_blocking`] with a timeout instead.

use crate::error::HostResult;
use crate::host::syncpt::{Fence, SyncPointRegistry};
use log::{debug, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Something a waiter fires once its fence is reached.
pub trait Completion: Send + Sync {
    fn signal(&self);
}

impl<F> Completion for F
where
    F: Fn() + Send + Sync,
{
    fn signal(&self) {
        self();
    }
}

// ===============================================================================================
// Semaphore
// ===============================================================================================

/// Counting semaphore usable as a [`Completion`].
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    #[must_use]
    pub const fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }

    /// Returns false if `timeout` elapsed without a post.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .cond
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *count -= 1;
        true
    }

    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

impl Completion for Semaphore {
    fn signal(&self) {
        self.post();
    }
}

// ===============================================================================================
// Waiter Pool
// ===============================================================================================

struct WaitJob {
    fence: Fence,
    completion: Arc<dyn Completion>,
}

/// Takes one unit from `counter` unless it is already zero.
fn reserve(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

pub struct FenceWaiter {
    registry: Arc<SyncPointRegistry>,
    jobs: Mutex<Option<SyncSender<WaitJob>>>,
    /// Workers not currently blocked on a fence.
    idle: Arc<AtomicUsize>,
    /// Overflow threads that may still be started.
    spare: Arc<AtomicUsize>,
}

impl std::fmt::Debug for FenceWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceWaiter")
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .field("spare", &self.spare.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl FenceWaiter {
    /// Starts `workers` waiter threads, plus up to `overflow` short-lived threads for waits
    /// arriving while every worker is blocked.
    ///
    /// With neither, every asynchronous request degrades to a synchronous wait.
    pub fn new(
        registry: Arc<SyncPointRegistry>,
        workers: usize,
        overflow: usize,
    ) -> HostResult<Self> {
        let (tx, rx) = mpsc::sync_channel(workers);
        let rx = Arc::new(Mutex::new(rx));
        let idle = Arc::new(AtomicUsize::new(workers));
        for n in 0..workers {
            let registry = Arc::clone(&registry);
            let rx = Arc::clone(&rx);
            let idle = Arc::clone(&idle);
            thread::Builder::new()
                .name(format!("fence-waiter-{n}"))
                .spawn(move || worker_loop(&registry, &rx, &idle))?;
        }
        Ok(Self {
            registry,
            jobs: Mutex::new(Some(tx)),
            idle,
            spare: Arc::new(AtomicUsize::new(overflow)),
        })
    }

    pub fn wait_blocking(&self, fence: Fence, timeout: Option<Duration>) -> HostResult<u32> {
        self.registry.wait_fence(fence, timeout)
    }

    /// Requests `completion` to be signalled once `fence` is reached.
    ///
    /// Returns `true` when the fence was already reached by the time this returns; in that
    /// case `completion` is not signalled. Returns `false` when delivery is asynchronous.
    /// If no worker is idle and no overflow thread can be started, or the pool is shut down,
    /// waits on the calling thread and returns `true`.
    pub fn notify_async(&self, fence: Fence, completion: Arc<dyn Completion>) -> HostResult<bool> {
        if self.registry.is_reached(fence)? {
            return Ok(true);
        }

        let rejected = match self.dispatch(WaitJob { fence, completion }) {
            Ok(()) => return Ok(false),
            Err(reason) => reason,
        };
        debug!(
            "fence waiter pool {rejected}, waiting synchronously for {}:{}",
            fence.id, fence.value
        );
        self.registry.wait_fence(fence, None)?;
        Ok(true)
    }

    fn dispatch(&self, job: WaitJob) -> Result<(), &'static str> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = jobs.as_ref() else {
            return Err("shut down");
        };

        let job = if reserve(&self.idle) {
            match tx.try_send(job) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => {
                    self.idle.fetch_add(1, Ordering::AcqRel);
                    job
                }
            }
        } else {
            job
        };

        // Every worker is blocked on an earlier fence.
        if !reserve(&self.spare) {
            return Err("saturated");
        }
        let registry = Arc::clone(&self.registry);
        let spare = Arc::clone(&self.spare);
        let spawned = thread::Builder::new()
            .name("fence-waiter-overflow".into())
            .spawn(move || {
                wait_and_signal(&registry, &job);
                spare.fetch_add(1, Ordering::AcqRel);
            });
        spawned.map(drop).map_err(|e| {
            self.spare.fetch_add(1, Ordering::AcqRel);
            warn!("overflow fence waiter not started: {e}");
            "saturated"
        })
    }

    /// Stops accepting work. Queued waits still run to completion.
    pub fn shutdown(&self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for FenceWaiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wait_and_signal(registry: &SyncPointRegistry, job: &WaitJob) {
    if let Err(e) = registry.wait_fence(job.fence, None) {
        warn!(
            "fence wait on {}:{} failed: {e}",
            job.fence.id, job.fence.value
        );
    }
    job.completion.signal();
}

fn worker_loop(registry: &SyncPointRegistry, jobs: &Mutex<Receiver<WaitJob>>, idle: &AtomicUsize) {
    loop {
        let job = jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = job else {
            return;
        };
        wait_and_signal(registry, &job);
        idle.fetch_add(1, Ordering::AcqRel);
    }
}
