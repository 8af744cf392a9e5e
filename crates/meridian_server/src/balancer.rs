//! Greedy least-loaded assignment of sessions to I/O partitions.

use meridian_core::PartitionId;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks how many sessions each partition currently serves.
///
/// `select` and `deselect` are lock-free and may be called from any accept
/// loop or connection task concurrently.
#[derive(Debug)]
pub struct PartitionBalancer {
    weights: Vec<AtomicUsize>,
}

impl PartitionBalancer {
    pub fn new(partitions: usize) -> Self {
        let partitions = partitions.max(1);
        Self {
            weights: (0..partitions).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn partitions(&self) -> usize {
        self.weights.len()
    }

    /// Picks the lightest partition (lowest id on ties) and charges it one
    /// session.
    pub fn select(&self) -> PartitionId {
        loop {
            let (index, weight) = self
                .weights
                .iter()
                .map(|w| w.load(Ordering::Acquire))
                .enumerate()
                .min_by_key(|&(index, weight)| (weight, index))
                .unwrap_or((0, 0));

            if self.weights[index]
                .compare_exchange(weight, weight + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return PartitionId(index);
            }
        }
    }

    /// Releases one session from a partition. Never goes below zero.
    pub fn deselect(&self, partition: PartitionId) {
        if let Some(weight) = self.weights.get(partition.0) {
            let _ = weight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| w.checked_sub(1));
        }
    }

    pub fn weight(&self, partition: PartitionId) -> usize {
        self.weights
            .get(partition.0)
            .map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Snapshot of every partition's weight, indexed by partition id.
    pub fn weights(&self) -> Vec<usize> {
        self.weights.iter().map(|w| w.load(Ordering::Acquire)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_select_spreads_and_prefers_lowest_id() {
        let balancer = PartitionBalancer::new(3);
        let picks: Vec<usize> = (0..5).map(|_| balancer.select().0).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
        assert_eq!(balancer.weights(), vec![2, 2, 1]);
    }

    #[test]
    fn test_deselect_returns_to_baseline() {
        let balancer = PartitionBalancer::new(4);
        let picks: Vec<PartitionId> = (0..10).map(|_| balancer.select()).collect();
        for p in picks {
            balancer.deselect(p);
        }
        assert_eq!(balancer.weights(), vec![0; 4]);

        balancer.deselect(PartitionId(2));
        assert_eq!(balancer.weight(PartitionId(2)), 0);
        balancer.deselect(PartitionId(99));
    }

    #[test]
    fn test_concurrent_select_deselect() {
        let balancer = Arc::new(PartitionBalancer::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let balancer = balancer.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let p = balancer.select();
                        balancer.deselect(p);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(balancer.weights().iter().sum::<usize>(), 0);
    }
}
