//! Per-entity serial queues.
//!
//! All mutation of a simulated entity goes through its private queue, no
//! matter whether it was triggered by the entity's own connection, by region
//! traffic, or by a peer process over a control link. Two operations on the
//! same entity therefore never overlap, including across a leave and a later
//! re-enter of the same id: the new queue starts draining only once the old
//! worker has finished.

use dashmap::DashMap;
use meridian_core::{join_all_within, DispatchError, EntityId, QueueWorker, SerialQueue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

struct EntitySlot {
    queue: SerialQueue,
    worker: QueueWorker,
}

/// Registry of live entity queues.
pub struct EntityQueues {
    queues: DashMap<EntityId, EntitySlot>,
    // Lock order: `retired` before any `queues` shard.
    retired: Mutex<HashMap<EntityId, QueueWorker>>,
    closed: AtomicBool,
}

impl Default for EntityQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityQueues {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            retired: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates the queue for an entity entering the simulation.
    ///
    /// If the entity left recently and its old queue is still draining, the
    /// new queue holds its operations until the old worker has exited.
    ///
    /// # Arguments
    ///
    /// * `entity` - Id of the entering entity
    ///
    /// # Returns
    ///
    /// `true` if a queue was created, `false` if the entity already had one or
    /// the registry is shutting down.
    pub fn enter(&self, entity: EntityId) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut retired = self.retired.lock();
        let mut created = false;
        self.queues.entry(entity).or_insert_with(|| {
            created = true;
            let previous = retired.remove(&entity).filter(|w| !w.is_finished());
            let (queue, worker) =
                SerialQueue::spawn_after(format!("entity-{}", entity.0), previous);
            EntitySlot { queue, worker }
        });
        if created {
            debug!(%entity, "Entity entered");
        }
        created
    }

    /// Removes an entity's queue. Operations already queued still run; later
    /// enqueues fail with `UnknownEntity` until the entity enters again.
    pub fn leave(&self, entity: EntityId) -> bool {
        let mut retired = self.retired.lock();
        match self.queues.remove(&entity) {
            Some((_, slot)) => {
                slot.queue.close();
                retired.retain(|_, w| !w.is_finished());
                retired.insert(entity, slot.worker);
                debug!(%entity, "Entity left");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.queues.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Appends an operation to the entity's queue.
    ///
    /// # Arguments
    ///
    /// * `entity` - Target entity
    /// * `op` - Work to run once every earlier operation on `entity` finished
    ///
    /// # Returns
    ///
    /// `UnknownEntity` if the entity has no queue, `QueueClosed` if it is
    /// leaving or the server is shutting down.
    pub fn enqueue<F>(&self, entity: EntityId, op: F) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let queue = self
            .queues
            .get(&entity)
            .map(|slot| slot.queue.clone())
            .ok_or(DispatchError::UnknownEntity(entity))?;
        queue.run(op)
    }

    /// Closes every entity queue and waits up to `grace` for them to drain.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.closed.store(true, Ordering::Release);
        let entities: Vec<EntityId> = self.queues.iter().map(|e| *e.key()).collect();
        let workers = {
            let mut retired = self.retired.lock();
            let mut workers: Vec<QueueWorker> = retired.drain().map(|(_, w)| w).collect();
            for entity in entities {
                if let Some((_, slot)) = self.queues.remove(&entity) {
                    slot.queue.close();
                    workers.push(slot.worker);
                }
            }
            workers
        };
        let busy = join_all_within(workers, grace).await;
        if busy > 0 {
            warn!("{} entity queue(s) still busy after {:?}", busy, grace);
        }
        busy
    }
}
