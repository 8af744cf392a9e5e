//! Serial work queues.
//!
//! A [`SerialQueue`] is a FIFO of async jobs drained by exactly one tokio task.
//! Every partitioning layer in the server (I/O partitions, regions, entities,
//! the global control queue) is built from it, so they all share the same
//! guarantees:
//!
//! * jobs run in submission order, one at a time, each to completion;
//! * a job that returns `Err` or panics is logged and the next job runs;
//! * after [`SerialQueue::close`] the worker finishes what was already queued
//!   and exits;
//! * a queue started with [`SerialQueue::spawn_after`] runs nothing until the
//!   worker it replaces has exited.

use crate::error::DispatchError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// A unit of queued work.
pub type Job = BoxFuture<'static, Result<(), DispatchError>>;

enum Message {
    Run(Job),
    Close,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
}

impl QueueStats {
    /// Jobs accepted but not yet finished.
    pub fn pending(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed + self.failed + self.panicked)
    }
}

struct Shared {
    name: String,
    closed: AtomicBool,
    counters: Counters,
}

/// Submission handle of a serial queue. Cheap to clone.
#[derive(Clone)]
pub struct SerialQueue {
    sender: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Join handle of the task draining a [`SerialQueue`].
#[derive(Debug)]
pub struct QueueWorker {
    name: String,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the worker to drain and exit.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!("Queue worker '{}' terminated abnormally: {}", self.name, e);
        }
    }

    /// Waits up to `grace` for the worker to exit. Returns `false` on timeout,
    /// in which case the worker keeps running detached.
    pub async fn join_timeout(self, grace: Duration) -> bool {
        let name = self.name;
        match tokio::time::timeout(grace, self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Queue worker '{}' terminated abnormally: {}", name, e);
                true
            }
            Err(_) => {
                warn!("Queue worker '{}' still busy after {:?}", name, grace);
                false
            }
        }
    }
}

impl SerialQueue {
    /// Creates a queue and spawns its worker on the current tokio runtime.
    pub fn spawn(name: impl Into<String>) -> (SerialQueue, QueueWorker) {
        Self::spawn_after(name, None)
    }

    /// Creates a queue that takes over from a retired one.
    ///
    /// Jobs submitted to the new queue are buffered until `predecessor` has
    /// drained and exited, so work on the same key never overlaps across the
    /// hand-over.
    ///
    /// # Arguments
    ///
    /// * `name` - Queue name used in logs
    /// * `predecessor` - Worker of the closed queue this one replaces, if any
    ///
    /// # Returns
    ///
    /// The submission handle and the join handle of the new worker. Joining
    /// the new worker also waits for the predecessor.
    pub fn spawn_after(
        name: impl Into<String>,
        predecessor: Option<QueueWorker>,
    ) -> (SerialQueue, QueueWorker) {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name: name.clone(),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let handle = tokio::spawn(drain(receiver, shared.clone(), predecessor));
        (SerialQueue { sender, shared }, QueueWorker { name, handle })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Appends a boxed job.
    pub fn submit(&self, job: Job) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::QueueClosed(self.shared.name.clone()));
        }
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.sender.send(Message::Run(job)).map_err(|_| {
            self.shared.counters.submitted.fetch_sub(1, Ordering::Relaxed);
            DispatchError::QueueClosed(self.shared.name.clone())
        })
    }

    /// Appends any `Send` future.
    pub fn run<F>(&self, work: F) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.submit(work.boxed())
    }

    /// Stops accepting work. Jobs queued before this call still run.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(Message::Close);
            debug!("Queue '{}' closed", self.shared.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        QueueStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
        }
    }
}

/// Waits for a set of workers under one shared deadline.
///
/// Returns how many were still running when `grace` ran out.
pub async fn join_all_within(workers: Vec<QueueWorker>, grace: Duration) -> usize {
    let results = futures::future::join_all(
        workers.into_iter().map(|worker| worker.join_timeout(grace)),
    )
    .await;
    results.into_iter().filter(|finished| !finished).count()
}

async fn drain(
    mut receiver: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    predecessor: Option<QueueWorker>,
) {
    if let Some(previous) = predecessor {
        trace!("Queue '{}' waiting for '{}' to drain", shared.name, previous.name);
        previous.join().await;
    }

    while let Some(message) = receiver.recv().await {
        let job = match message {
            Message::Run(job) => job,
            Message::Close => {
                // Anything that raced in ahead of the close still runs.
                receiver.close();
                continue;
            }
        };

        match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(())) => {
                shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(queue = %shared.name, error = %e, "Queued job failed");
            }
            Err(panic) => {
                shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    queue = %shared.name,
                    panic = %panic_message(panic.as_ref()),
                    "Queued job panicked"
                );
            }
        }
    }
    trace!("Queue '{}' worker exiting", shared.name);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let (queue, worker) = SerialQueue::spawn("order");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            queue
                .run(async move {
                    if i % 7 == 0 {
                        tokio::task::yield_now().await;
                    }
                    seen.lock().await.push(i);
                    Ok(())
                })
                .unwrap();
        }
        queue.close();
        worker.join().await;

        assert_eq!(*seen.lock().await, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_jobs_never_overlap() {
        let (queue, worker) = SerialQueue::spawn("exclusive");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            queue
                .run(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_micros(200)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        queue.close();
        worker.join().await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_and_panic_do_not_stall_queue() {
        let (queue, worker) = SerialQueue::spawn("faulty");
        let ran_after = Arc::new(AtomicUsize::new(0));

        queue
            .run(async { Err(DispatchError::Handler("boom".to_string())) })
            .unwrap();
        queue.run(async { panic!("worker blew up") }).unwrap();
        for _ in 0..3 {
            let ran_after = ran_after.clone();
            queue
                .run(async move {
                    ran_after.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        queue.close();
        worker.join().await;

        assert_eq!(ran_after.load(Ordering::SeqCst), 3);
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_work() {
        let (queue, worker) = SerialQueue::spawn("closed");
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.run(async { Ok(()) }),
            Err(DispatchError::QueueClosed(name)) if name == "closed"
        ));
        assert!(worker.join_timeout(Duration::from_secs(1)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_successor_waits_for_predecessor() {
        let (old, old_worker) = SerialQueue::spawn("region-3");
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let job = |tag: &'static str| {
            let active = active.clone();
            let overlaps = overlaps.clone();
            let order = order.clone();
            async move {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                order.lock().await.push(tag);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        };

        old.run(job("old-1")).unwrap();
        old.run(job("old-2")).unwrap();
        old.close();

        let (new, new_worker) = SerialQueue::spawn_after("region-3", Some(old_worker));
        new.run(job("new-1")).unwrap();
        new.close();
        new_worker.join().await;

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(*order.lock().await, vec!["old-1", "old-2", "new-1"]);
    }

    #[tokio::test]
    async fn test_join_all_within_reports_stragglers() {
        let (quick, quick_worker) = SerialQueue::spawn("quick");
        let (slow, slow_worker) = SerialQueue::spawn("slow");
        slow.run(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .unwrap();
        quick.close();
        slow.close();

        let busy = join_all_within(vec![quick_worker, slow_worker], Duration::from_millis(50)).await;
        assert_eq!(busy, 1);
    }
}
