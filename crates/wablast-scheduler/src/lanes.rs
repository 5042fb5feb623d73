//! Per-instance send lanes.
//!
//! Every connection instance gets one lane with a fixed number of send slots
//! (`instance_rate_limit_capacity`, default 1). Two campaigns bound to the
//! same instance therefore take turns, whatever their own pacing says.
//! Lanes are created lazily on first use.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

struct LaneState {
    slots: Arc<Semaphore>,
    active: AtomicUsize,
    total_processed: AtomicU64,
}

impl LaneState {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            active: AtomicUsize::new(0),
            total_processed: AtomicU64::new(0),
        }
    }
}

/// Held for the duration of one send (all its retries included).
pub struct LanePermit {
    lane: Arc<LaneState>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for LanePermit {
    fn drop(&mut self) {
        self.lane.active.fetch_sub(1, Ordering::Relaxed);
        self.lane.total_processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Instance name → lane.
pub struct InstanceLanes {
    capacity: usize,
    lanes: Mutex<HashMap<String, Arc<LaneState>>>,
}

impl InstanceLanes {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    async fn lane(&self, instance: &str) -> Arc<LaneState> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(instance.to_string())
            .or_insert_with(|| Arc::new(LaneState::new(self.capacity)))
            .clone()
    }

    /// Wait for a free slot on the instance's lane.
    pub async fn acquire(&self, instance: &str) -> LanePermit {
        let lane = self.lane(instance).await;
        if lane.slots.available_permits() == 0 {
            tracing::debug!("⏳ Lane[{instance}] busy, waiting for a slot");
        }
        let permit = lane
            .slots
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("lane semaphores are never closed"));
        lane.active.fetch_add(1, Ordering::Relaxed);
        LanePermit { lane, _permit: permit }
    }

    /// Get statistics for all lanes, sorted by instance name.
    pub async fn stats(&self) -> Vec<LaneStats> {
        let lanes = self.lanes.lock().await;
        let mut result: Vec<LaneStats> = lanes
            .iter()
            .map(|(instance, state)| LaneStats {
                instance: instance.clone(),
                active: state.active.load(Ordering::Relaxed),
                capacity: self.capacity,
                total_processed: state.total_processed.load(Ordering::Relaxed),
            })
            .collect();
        result.sort_by(|a, b| a.instance.cmp(&b.instance));
        result
    }
}

/// Statistics for a single lane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LaneStats {
    pub instance: String,
    pub active: usize,
    pub capacity: usize,
    pub total_processed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_instance_is_serialized() {
        let lanes = InstanceLanes::new(1);
        let first = lanes.acquire("sales").await;

        let blocked = tokio::time::timeout(Duration::from_millis(30), lanes.acquire("sales")).await;
        assert!(blocked.is_err(), "second send on the same instance must wait");

        drop(first);
        let second = tokio::time::timeout(Duration::from_millis(200), lanes.acquire("sales")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_different_instances_are_independent() {
        let lanes = InstanceLanes::new(1);
        let _a = lanes.acquire("sales").await;
        let b = tokio::time::timeout(Duration::from_millis(100), lanes.acquire("support")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_capacity_and_stats() {
        let lanes = InstanceLanes::new(2);
        let a = lanes.acquire("sales").await;
        let _b = lanes.acquire("sales").await;

        let stats = lanes.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].active, 2);
        assert_eq!(stats[0].capacity, 2);

        drop(a);
        let stats = lanes.stats().await;
        assert_eq!(stats[0].active, 1);
        assert_eq!(stats[0].total_processed, 1);
    }
}
