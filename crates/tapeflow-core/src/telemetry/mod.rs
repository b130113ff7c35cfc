//! In-process metrics for the data path.
//!
//! The recording functions are always callable; without the `telemetry`
//! feature they compile down to nothing and [`snapshot`] stays empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod tags;
pub mod worker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub total: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

/// Point-in-time copy of every metric recorded so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

impl TelemetrySnapshot {
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }

    pub fn gauge(&self, name: &str) -> Option<u64> {
        self.gauges.get(name).copied()
    }

    pub fn histogram(&self, name: &str) -> Option<HistogramSnapshot> {
        self.histograms.get(name).copied()
    }
}

/// Adds `value` to a counter.
///
/// Labels document the call site; the registry keys on the metric name only.
#[inline]
pub fn increment_counter(name: &'static str, value: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    registry::update(|metrics| {
        let counter = metrics.counters.entry(name).or_insert(0);
        *counter = counter.saturating_add(value);
    });

    let _ = (name, value);
}

#[inline]
pub fn record_histogram(name: &'static str, value: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    registry::update(|metrics| metrics.histograms.entry(name).or_default().record(value));

    let _ = (name, value);
}

#[inline]
pub fn set_gauge(name: &'static str, value: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    registry::update(|metrics| {
        metrics.gauges.insert(name, value);
    });

    let _ = (name, value);
}

#[inline]
pub fn add_gauge(name: &'static str, delta: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    registry::update(|metrics| {
        let gauge = metrics.gauges.entry(name).or_insert(0);
        *gauge = gauge.saturating_add(delta);
    });

    let _ = (name, delta);
}

/// Subtracts `delta` from a gauge, stopping at zero.
#[inline]
pub fn sub_gauge_saturating(name: &'static str, delta: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    registry::update(|metrics| {
        let gauge = metrics.gauges.entry(name).or_insert(0);
        *gauge = gauge.saturating_sub(delta);
    });

    let _ = (name, delta);
}

pub fn snapshot() -> TelemetrySnapshot {
    #[cfg(feature = "telemetry")]
    {
        registry::snapshot()
    }

    #[cfg(not(feature = "telemetry"))]
    {
        TelemetrySnapshot::default()
    }
}

pub fn reset() {
    #[cfg(feature = "telemetry")]
    registry::update(|metrics| *metrics = registry::Metrics::default());
}

#[cfg(feature = "telemetry")]
mod registry {
    use std::collections::BTreeMap;
    use std::sync::{Mutex, OnceLock};

    use super::{HistogramSnapshot, TelemetrySnapshot};
    use crate::core::sync::lock_unpoisoned;

    #[derive(Debug, Clone, Copy, Default)]
    pub(super) struct Histogram {
        count: u64,
        total: u64,
        min: u64,
        max: u64,
    }

    impl Histogram {
        pub(super) fn record(&mut self, value: u64) {
            self.min = if self.count == 0 {
                value
            } else {
                self.min.min(value)
            };
            self.max = self.max.max(value);
            self.count = self.count.saturating_add(1);
            self.total = self.total.saturating_add(value);
        }

        fn snapshot(&self) -> HistogramSnapshot {
            HistogramSnapshot {
                count: self.count,
                total: self.total,
                min: self.min,
                max: self.max,
                mean: if self.count == 0 {
                    0.0
                } else {
                    self.total as f64 / self.count as f64
                },
            }
        }
    }

    #[derive(Debug, Default)]
    pub(super) struct Metrics {
        pub(super) counters: BTreeMap<&'static str, u64>,
        pub(super) gauges: BTreeMap<&'static str, u64>,
        pub(super) histograms: BTreeMap<&'static str, Histogram>,
    }

    fn metrics() -> &'static Mutex<Metrics> {
        static METRICS: OnceLock<Mutex<Metrics>> = OnceLock::new();
        METRICS.get_or_init(|| Mutex::new(Metrics::default()))
    }

    pub(super) fn update(f: impl FnOnce(&mut Metrics)) {
        f(&mut lock_unpoisoned(metrics()));
    }

    pub(super) fn snapshot() -> TelemetrySnapshot {
        let metrics = lock_unpoisoned(metrics());
        let owned = |map: &BTreeMap<&'static str, u64>| {
            map.iter()
                .map(|(name, value)| ((*name).to_owned(), *value))
                .collect()
        };
        TelemetrySnapshot {
            counters: owned(&metrics.counters),
            gauges: owned(&metrics.gauges),
            histograms: metrics
                .histograms
                .iter()
                .map(|(name, histogram)| ((*name).to_owned(), histogram.snapshot()))
                .collect(),
        }
    }
}
