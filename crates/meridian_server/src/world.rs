//! Region-partitioned dispatch.
//!
//! Every loaded region owns a serial queue, so all traffic for one map is
//! handled strictly in order while different maps run in parallel. Sessions
//! that are not inside any region yet go through the reserved
//! [`RegionKey::NONE`] queue, which only accepts a small allow-list of lobby
//! type codes.
//!
//! Unloading a region retires its queue; a region recreated under the same key
//! holds new work until the retired worker has drained.

use dashmap::DashMap;
use meridian_core::{join_all_within, DispatchError, QueueWorker, RegionKey, SerialQueue};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

struct RegionSlot {
    queue: SerialQueue,
    worker: QueueWorker,
}

/// Map from region key to that region's serial queue.
pub struct WorldDispatch {
    regions: DashMap<RegionKey, RegionSlot>,
    // Lock order: `retired` before any `regions` shard.
    retired: Mutex<HashMap<RegionKey, QueueWorker>>,
    lobby_allow: HashSet<u16>,
    closed: AtomicBool,
}

impl WorldDispatch {
    /// Creates the dispatcher with its lobby queue already running.
    pub fn new(lobby_allow: impl IntoIterator<Item = u16>) -> Self {
        let world = Self {
            regions: DashMap::new(),
            retired: Mutex::new(HashMap::new()),
            lobby_allow: lobby_allow.into_iter().collect(),
            closed: AtomicBool::new(false),
        };
        world.load_region(RegionKey::NONE);
        world
    }

    pub fn is_lobby_allowed(&self, type_code: u16) -> bool {
        self.lobby_allow.contains(&type_code)
    }

    /// Starts the queue for a region. Returns `false` if it was already loaded.
    pub fn load_region(&self, region: RegionKey) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut retired = self.retired.lock();
        let mut created = false;
        self.regions.entry(region).or_insert_with(|| {
            created = true;
            spawn_region(region, &mut retired)
        });
        if created && !region.is_none() {
            info!("🗺️ Region {} loaded", region);
        }
        created
    }

    /// Tears down a region's queue. Work already queued for it still runs.
    ///
    /// The lobby queue cannot be unloaded.
    pub fn unload_region(&self, region: RegionKey) -> bool {
        if region.is_none() {
            warn!("Refusing to unload the lobby queue");
            return false;
        }
        let mut retired = self.retired.lock();
        match self.regions.remove(&region) {
            Some((_, slot)) => {
                slot.queue.close();
                retired.retain(|_, w| !w.is_finished());
                retired.insert(region, slot.worker);
                info!("Region {} unloaded", region);
                true
            }
            None => false,
        }
    }

    pub fn is_loaded(&self, region: RegionKey) -> bool {
        self.regions.contains_key(&region)
    }

    pub fn loaded_regions(&self) -> Vec<RegionKey> {
        let mut regions: Vec<RegionKey> = self
            .regions
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| !key.is_none())
            .collect();
        regions.sort();
        regions
    }

    /// Appends `job` to the region's queue, creating the queue on first use.
    ///
    /// On the lobby queue only allow-listed type codes are accepted; anything
    /// else is dropped with a warning.
    ///
    /// # Arguments
    ///
    /// * `region` - Region the sending session stands in
    /// * `type_code` - Frame type, checked against the lobby allow-list
    /// * `job` - Work to run after everything already queued for `region`
    ///
    /// # Returns
    ///
    /// `NotAllowed` for a filtered lobby message, `QueueClosed` during
    /// shutdown.
    pub fn dispatch<F>(&self, region: RegionKey, type_code: u16, job: F) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        if region.is_none() && !self.is_lobby_allowed(type_code) {
            warn!(%region, type_code, "Dropping message not allowed outside a region");
            return Err(DispatchError::NotAllowed { region, type_code });
        }
        self.schedule(region, job)
    }

    /// Appends `job` to the region's queue without the lobby filter. Used for
    /// work the server itself orders behind client traffic.
    pub fn schedule<F>(&self, region: RegionKey, job: F) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::QueueClosed(region.to_string()));
        }

        let existing = self.regions.get(&region).map(|slot| slot.queue.clone());
        let queue = match existing {
            Some(queue) => queue,
            None => {
                let mut retired = self.retired.lock();
                self.regions
                    .entry(region)
                    .or_insert_with(|| {
                        debug!("Region {} queue created on first use", region);
                        spawn_region(region, &mut retired)
                    })
                    .queue
                    .clone()
            }
        };
        queue.run(job)
    }

    /// Closes every region queue and waits up to `grace` for them to drain.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.closed.store(true, Ordering::Release);
        let keys: Vec<RegionKey> = self.regions.iter().map(|e| *e.key()).collect();
        let workers = {
            let mut retired = self.retired.lock();
            let mut workers: Vec<QueueWorker> = retired.drain().map(|(_, w)| w).collect();
            for key in keys {
                if let Some((_, slot)) = self.regions.remove(&key) {
                    slot.queue.close();
                    workers.push(slot.worker);
                }
            }
            workers
        };
        let busy = join_all_within(workers, grace).await;
        if busy > 0 {
            warn!("{} region queue(s) still busy after {:?}", busy, grace);
        }
        busy
    }
}

/// Starts a region queue behind the retired worker of the same key, if one is
/// still draining.
fn spawn_region(region: RegionKey, retired: &mut HashMap<RegionKey, QueueWorker>) -> RegionSlot {
    let previous = retired.remove(&region).filter(|w| !w.is_finished());
    let (queue, worker) = SerialQueue::spawn_after(region.to_string(), previous);
    RegionSlot { queue, worker }
}
