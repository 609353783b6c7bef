//! Bounded per-device telemetry windows.
//!
//! The [`SampleStore`] is the single source of truth for what the dashboard
//! shows: every device owns a FIFO window of at most `capacity` samples, the
//! "current" state of a device is the tail of its window, and the fleet
//! snapshot is the tail of every window. History seeds replace a window,
//! live pushes append to it in arrival order.
//!
//! Mutations are expected to come from one task. Read-only consumers register
//! with [`SampleStore::subscribe`] and are told which device changed after
//! each mutation.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::types::Sample;

pub const DEFAULT_WINDOW_CAPACITY: usize = 200;

/// What to do with a push whose timestamp is already in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Append it anyway; delivery is at-least-once.
    #[default]
    KeepAll,
    /// Drop it; `(device_id, timestamp)` identifies a sample.
    DropSameTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUpdate {
    Seeded { device_id: String, len: usize },
    Appended { device_id: String, evicted: usize },
    Removed { device_id: String },
    Cleared,
}

impl StoreUpdate {
    /// The device this update concerns, or `None` when it concerns all.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            StoreUpdate::Seeded { device_id, .. }
            | StoreUpdate::Appended { device_id, .. }
            | StoreUpdate::Removed { device_id } => Some(device_id),
            StoreUpdate::Cleared => None,
        }
    }
}

#[derive(Debug)]
pub struct SampleStore {
    capacity: usize,
    policy: DuplicatePolicy,
    windows: HashMap<String, VecDeque<Sample>>,
    observers: Vec<mpsc::UnboundedSender<StoreUpdate>>,
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl SampleStore {
    /// A capacity of zero is raised to one; a window always holds its
    /// current sample.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            policy: DuplicatePolicy::default(),
            windows: HashMap::new(),
            observers: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Replace a device's window with `samples`, kept in the given order.
    ///
    /// Any previous content is discarded. When more than `capacity` samples
    /// are given, only the last `capacity` are retained.
    pub fn seed(&mut self, device_id: &str, samples: Vec<Sample>) {
        let skip = samples.len().saturating_sub(self.capacity);
        let window: VecDeque<Sample> = samples.into_iter().skip(skip).collect();
        let len = window.len();
        self.windows.insert(device_id.to_string(), window);

        debug!(device_id, len, truncated = skip, "Seeded device window");
        self.notify(StoreUpdate::Seeded {
            device_id: device_id.to_string(),
            len,
        });
    }

    /// Push a live sample onto the tail of a device's window.
    ///
    /// Arrival order is the ordering key; the window is not re-sorted. When
    /// the window exceeds capacity the entry at index 0 is evicted. Returns
    /// `false` if the duplicate policy rejected the sample.
    pub fn append(&mut self, device_id: &str, sample: Sample) -> bool {
        let capacity = self.capacity;
        let window = self.windows.entry(device_id.to_string()).or_default();

        if self.policy == DuplicatePolicy::DropSameTimestamp
            && window.iter().any(|s| s.timestamp == sample.timestamp)
        {
            debug!(device_id, timestamp = %sample.timestamp, "Dropping duplicate sample");
            return false;
        }

        window.push_back(sample);
        let mut evicted = 0;
        while window.len() > capacity {
            window.pop_front();
            evicted += 1;
        }
        trace!(device_id, len = window.len(), evicted, "Appended sample");

        self.notify(StoreUpdate::Appended {
            device_id: device_id.to_string(),
            evicted,
        });
        true
    }

    /// Latest sample of a device, `None` when nothing is known yet.
    pub fn current(&self, device_id: &str) -> Option<&Sample> {
        self.windows.get(device_id).and_then(|w| w.back())
    }

    /// A device's retained samples, oldest first.
    pub fn window(&self, device_id: &str) -> Vec<Sample> {
        self.iter_window(device_id).cloned().collect()
    }

    pub fn iter_window(&self, device_id: &str) -> impl Iterator<Item = &Sample> + '_ {
        self.windows.get(device_id).into_iter().flatten()
    }

    pub fn window_len(&self, device_id: &str) -> usize {
        self.windows.get(device_id).map_or(0, VecDeque::len)
    }

    /// Device id to latest sample for every device with a non-empty window.
    pub fn fleet_snapshot(&self) -> HashMap<&str, &Sample> {
        self.windows
            .iter()
            .filter_map(|(id, w)| w.back().map(|s| (id.as_str(), s)))
            .collect()
    }

    /// Known device ids, sorted.
    pub fn device_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.windows.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn remove(&mut self, device_id: &str) -> bool {
        if self.windows.remove(device_id).is_none() {
            return false;
        }
        self.notify(StoreUpdate::Removed {
            device_id: device_id.to_string(),
        });
        true
    }

    pub fn clear(&mut self) {
        self.windows.clear();
        self.notify(StoreUpdate::Cleared);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Register an observer. Updates are delivered after every mutation
    /// until the receiver is dropped.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StoreUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    pub fn observer_count(&self) -> usize {
        self.observers.iter().filter(|tx| !tx.is_closed()).count()
    }

    fn notify(&mut self, update: StoreUpdate) {
        self.observers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(n)
    }

    fn sample(device: &str, n: i64) -> Sample {
        Sample::new(device, t(n)).with_measurements(37.0 + n as f64 / 100.0, 55.0)
    }

    fn timestamps(store: &SampleStore, device: &str) -> Vec<DateTime<Utc>> {
        store.iter_window(device).map(|s| s.timestamp).collect()
    }

    #[test]
    fn test_seed_preserves_order() {
        let mut store = SampleStore::default();
        // Deliberately not chronological: seed keeps what it is given.
        let seeded = vec![sample("A", 3), sample("A", 1), sample("A", 2)];

        store.seed("A", seeded.clone());

        assert_eq!(store.window("A"), seeded);
        assert_eq!(store.current("A"), seeded.last());
    }

    #[test]
    fn test_last_seed_wins() {
        let mut store = SampleStore::default();
        store.seed("A", vec![sample("A", 1), sample("A", 2)]);
        store.append("A", sample("A", 3));

        store.seed("A", vec![sample("A", 10)]);

        assert_eq!(timestamps(&store, "A"), vec![t(10)]);
    }

    #[test]
    fn test_seed_larger_than_capacity_keeps_tail() {
        let mut store = SampleStore::new(3);
        store.seed("A", (0..5).map(|n| sample("A", n)).collect());

        assert_eq!(timestamps(&store, "A"), vec![t(2), t(3), t(4)]);
    }

    #[test]
    fn test_seed_then_fill_past_capacity() {
        let mut store = SampleStore::new(200);
        store.seed("A", vec![sample("A", 1), sample("A", 2), sample("A", 3)]);

        store.append("A", sample("A", 4));
        assert_eq!(store.window_len("A"), 4);
        assert_eq!(store.current("A").map(|s| s.timestamp), Some(t(4)));

        for n in 5..=202 {
            store.append("A", sample("A", n));
        }

        let window = store.window("A");
        assert_eq!(window.len(), 200);
        assert_eq!(window[0].timestamp, t(3));
        assert_eq!(window[199].timestamp, t(202));
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut store = SampleStore::new(5);
        for n in 0..50 {
            store.append("A", sample("A", n % 7));
            assert!(store.window_len("A") <= 5);
        }
    }

    #[test]
    fn test_eviction_is_fifo_not_by_timestamp() {
        let mut store = SampleStore::new(3);
        store.append("A", sample("A", 50));
        store.append("A", sample("A", 10));
        store.append("A", sample("A", 30));

        // Out-of-order arrival: t(50) is evicted because it arrived first,
        // although t(10) is older.
        store.append("A", sample("A", 20));

        assert_eq!(timestamps(&store, "A"), vec![t(10), t(30), t(20)]);
        assert_eq!(store.current("A").map(|s| s.timestamp), Some(t(20)));
    }

    #[test]
    fn test_current_of_unknown_or_empty_device() {
        let mut store = SampleStore::default();
        assert!(store.current("ghost").is_none());

        store.seed("A", Vec::new());
        assert!(store.current("A").is_none());
        assert!(store.fleet_snapshot().is_empty());
    }

    #[test]
    fn test_duplicates_kept_by_default() {
        let mut store = SampleStore::default();
        assert!(store.append("A", sample("A", 1)));
        assert!(store.append("A", sample("A", 1)));

        assert_eq!(store.window_len("A"), 2);
    }

    #[test]
    fn test_duplicates_dropped_when_deduplicating() {
        let mut store = SampleStore::default().with_policy(DuplicatePolicy::DropSameTimestamp);
        store.seed("A", vec![sample("A", 1), sample("A", 2)]);

        assert!(!store.append("A", sample("A", 2)));
        assert!(store.append("A", sample("A", 3)));
        // Same timestamp on another device is not a duplicate.
        assert!(store.append("B", sample("B", 2)));

        assert_eq!(timestamps(&store, "A"), vec![t(1), t(2), t(3)]);
    }

    #[test]
    fn test_fleet_snapshot_tracks_tails() {
        let mut store = SampleStore::default();
        store.seed("A", vec![sample("A", 1)]);
        store.append("B", sample("B", 5));
        store.append("A", sample("A", 2));

        let snapshot = store.fleet_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["A"].timestamp, t(2));
        assert_eq!(snapshot["B"].timestamp, t(5));
        assert_eq!(store.device_ids(), vec!["A", "B"]);
    }

    #[test]
    fn test_observers_are_notified() {
        let mut store = SampleStore::new(1);
        let mut updates = store.subscribe();

        store.seed("A", vec![sample("A", 1)]);
        store.append("A", sample("A", 2));
        store.remove("A");
        store.clear();

        assert_eq!(
            updates.try_recv().unwrap(),
            StoreUpdate::Seeded {
                device_id: "A".to_string(),
                len: 1
            }
        );
        assert_eq!(
            updates.try_recv().unwrap(),
            StoreUpdate::Appended {
                device_id: "A".to_string(),
                evicted: 1
            }
        );
        assert_eq!(updates.try_recv().unwrap().device_id(), Some("A"));
        assert_eq!(updates.try_recv().unwrap(), StoreUpdate::Cleared);
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn test_dropped_observers_are_pruned() {
        let mut store = SampleStore::default();
        let kept = store.subscribe();
        drop(store.subscribe());

        store.append("A", sample("A", 1));

        assert_eq!(store.observer_count(), 1);
        drop(kept);
        assert_eq!(store.observer_count(), 0);
    }

    #[test]
    fn test_rejected_duplicate_does_not_notify() {
        let mut store = SampleStore::default().with_policy(DuplicatePolicy::DropSameTimestamp);
        store.append("A", sample("A", 1));
        let mut updates = store.subscribe();

        store.append("A", sample("A", 1));

        assert!(updates.try_recv().is_err());
    }
}
