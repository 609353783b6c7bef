//! Read-only adapters the dashboard screens render from.
//!
//! A view holds a store subscription and borrows the store only while
//! answering a query, so any number of views can sit on one farm.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::store::{SampleStore, StoreUpdate};
use crate::types::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub temp_c: Option<f64>,
    pub hum_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl Range {
    fn over(values: impl Iterator<Item = f64>) -> Option<Range> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for value in values {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
        }
        (count > 0).then(|| Range {
            min,
            max,
            avg: sum / count as f64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub samples: usize,
    pub temp_c: Option<Range>,
    pub hum_pct: Option<Range>,
}

/// `"{h}h {m}m"`, or `"{m}m"` under an hour.
pub fn format_uptime(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

fn drain(updates: &mut mpsc::UnboundedReceiver<StoreUpdate>, relevant: impl Fn(&StoreUpdate) -> bool) -> bool {
    let mut changed = false;
    while let Ok(update) = updates.try_recv() {
        changed |= relevant(&update);
    }
    changed
}

/// One device's detail screen.
#[derive(Debug)]
pub struct DeviceDetailView {
    device_id: String,
    online_threshold: Duration,
    updates: mpsc::UnboundedReceiver<StoreUpdate>,
}

impl DeviceDetailView {
    pub fn attach(store: &mut SampleStore, device_id: &str, online_threshold_secs: u64) -> Self {
        DeviceDetailView {
            device_id: device_id.to_string(),
            online_threshold: Duration::seconds(online_threshold_secs as i64),
            updates: store.subscribe(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether this device changed since the last poll.
    pub fn poll_changed(&mut self) -> bool {
        let device_id = self.device_id.as_str();
        drain(&mut self.updates, |u| u.device_id().map_or(true, |id| id == device_id))
    }

    pub fn current<'a>(&self, store: &'a SampleStore) -> Option<&'a Sample> {
        store.current(&self.device_id)
    }

    /// The window ordered by timestamp. Pushes can arrive out of order.
    pub fn chart_series(&self, store: &SampleStore) -> Vec<ChartPoint> {
        let mut points: Vec<ChartPoint> = store
            .iter_window(&self.device_id)
            .map(|s| ChartPoint {
                timestamp: s.timestamp,
                temp_c: s.measurements.temp_c,
                hum_pct: s.measurements.hum_pct,
            })
            .collect();
        points.sort_by_key(|p| p.timestamp);
        points
    }

    pub fn is_online(&self, store: &SampleStore, now: DateTime<Utc>) -> bool {
        self.current(store)
            .is_some_and(|s| now.signed_duration_since(s.timestamp) <= self.online_threshold)
    }

    pub fn window_stats(&self, store: &SampleStore) -> WindowStats {
        let window = || store.iter_window(&self.device_id);
        WindowStats {
            samples: store.window_len(&self.device_id),
            temp_c: Range::over(window().filter_map(|s| s.measurements.temp_c)),
            hum_pct: Range::over(window().filter_map(|s| s.measurements.hum_pct)),
        }
    }

    pub fn uptime_label(&self, store: &SampleStore) -> Option<String> {
        self.current(store)
            .and_then(Sample::network_info)
            .and_then(|n| n.uptime_s)
            .map(format_uptime)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetRow<'a> {
    pub device_id: &'a str,
    pub latest: Option<&'a Sample>,
}

/// Fleet overview: latest sample per device.
#[derive(Debug)]
pub struct FleetView {
    device_ids: Vec<String>,
    updates: mpsc::UnboundedReceiver<StoreUpdate>,
}

impl FleetView {
    /// With no ids, every device in the store is listed.
    pub fn attach(store: &mut SampleStore, device_ids: Vec<String>) -> Self {
        FleetView {
            device_ids,
            updates: store.subscribe(),
        }
    }

    pub fn poll_changed(&mut self) -> bool {
        let ids = &self.device_ids;
        drain(&mut self.updates, |u| match u.device_id() {
            Some(id) => ids.is_empty() || ids.iter().any(|d| d == id),
            None => true,
        })
    }

    pub fn rows<'a>(&'a self, store: &'a SampleStore) -> Vec<FleetRow<'a>> {
        if self.device_ids.is_empty() {
            return store
                .device_ids()
                .into_iter()
                .map(|device_id| FleetRow {
                    device_id,
                    latest: store.current(device_id),
                })
                .collect();
        }
        self.device_ids
            .iter()
            .map(|device_id| FleetRow {
                device_id,
                latest: store.current(device_id),
            })
            .collect()
    }

    /// Devices whose latest sample is within `threshold_secs` of `now`.
    pub fn online_count(&self, store: &SampleStore, now: DateTime<Utc>, threshold_secs: u64) -> usize {
        let threshold = Duration::seconds(threshold_secs as i64);
        self.rows(store)
            .iter()
            .filter_map(|row| row.latest)
            .filter(|s| now.signed_duration_since(s.timestamp) <= threshold)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(n)
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0m");
        assert_eq!(format_uptime(59 * 60 + 59), "59m");
        assert_eq!(format_uptime(3600), "1h 0m");
        assert_eq!(format_uptime(26 * 3600 + 5 * 60), "26h 5m");
    }

    #[test]
    fn test_chart_series_sorted() {
        let mut store = SampleStore::default();
        let view = DeviceDetailView::attach(&mut store, "A", 120);
        store.append("A", Sample::new("A", t(20)).with_measurements(37.6, 55.0));
        store.append("A", Sample::new("A", t(10)).with_measurements(37.4, 54.0));

        let series = view.chart_series(&store);
        assert_eq!(series.iter().map(|p| p.timestamp).collect::<Vec<_>>(), vec![t(10), t(20)]);
        // The current sample is still the last one to arrive.
        assert_eq!(view.current(&store).map(|s| s.timestamp), Some(t(10)));
    }

    #[test]
    fn test_is_online() {
        let mut store = SampleStore::default();
        let view = DeviceDetailView::attach(&mut store, "A", 120);
        assert!(!view.is_online(&store, t(0)));

        store.append("A", Sample::new("A", t(0)));
        assert!(view.is_online(&store, t(120)));
        assert!(!view.is_online(&store, t(121)));
    }

    #[test]
    fn test_window_stats_skip_missing_values() {
        let mut store = SampleStore::default();
        let view = DeviceDetailView::attach(&mut store, "A", 120);
        store.append("A", Sample::new("A", t(0)).with_measurements(37.0, 50.0));
        store.append("A", Sample::new("A", t(1)));
        store.append("A", Sample::new("A", t(2)).with_measurements(38.0, 60.0));

        let stats = view.window_stats(&store);
        assert_eq!(stats.samples, 3);
        assert_eq!(
            stats.temp_c,
            Some(Range {
                min: 37.0,
                max: 38.0,
                avg: 37.5
            })
        );
        assert_eq!(stats.hum_pct.map(|r| r.avg), Some(55.0));
    }

    #[test]
    fn test_uptime_label() {
        let mut store = SampleStore::default();
        let view = DeviceDetailView::attach(&mut store, "A", 120);
        store.append("A", Sample::new("A", t(0)));
        assert_eq!(view.uptime_label(&store), None);

        store.append("A", Sample::new("A", t(1)).with_network("10.0.0.7", 7500));
        assert_eq!(view.uptime_label(&store).as_deref(), Some("2h 5m"));
    }

    #[test]
    fn test_detail_poll_changed_filters_device() {
        let mut store = SampleStore::default();
        let mut view = DeviceDetailView::attach(&mut store, "A", 120);
        assert!(!view.poll_changed());

        store.append("B", Sample::new("B", t(0)));
        assert!(!view.poll_changed());

        store.append("A", Sample::new("A", t(0)));
        assert!(view.poll_changed());

        store.clear();
        assert!(view.poll_changed());
    }

    #[test]
    fn test_fleet_rows_tolerate_unknown_devices() {
        let mut store = SampleStore::default();
        let view = FleetView::attach(&mut store, vec!["A".to_string(), "Z".to_string()]);
        store.append("A", Sample::new("A", t(5)));

        let rows = view.rows(&store);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].latest.map(|s| s.timestamp), Some(t(5)));
        assert_eq!(rows[1].device_id, "Z");
        assert!(rows[1].latest.is_none());
    }

    #[test]
    fn test_fleet_lists_all_devices_when_unfiltered() {
        let mut store = SampleStore::default();
        let mut view = FleetView::attach(&mut store, Vec::new());
        store.append("B", Sample::new("B", t(0)));
        store.append("A", Sample::new("A", t(100)));

        assert!(view.poll_changed());
        let ids: Vec<&str> = view.rows(&store).iter().map(|r| r.device_id).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(view.online_count(&store, t(150), 120), 1);
    }
}
