//! kiln-metrics — node-local counters and gauges.
//!
//! Lock-free atomics for the unlabeled values, a coarse `RwLock`ed map
//! for labeled counters, and a renderer producing the Prometheus text
//! exposition format for the admin `/metrics` endpoint.

pub mod process;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A counter family with one label dimension.
pub struct LabeledCounter {
    values: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
}

impl LabeledCounter {
    fn new() -> Self {
        Self {
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn inc(&self, label: &str) {
        self.add(label, 1);
    }

    pub fn add(&self, label: &str, n: u64) {
        if let Some(v) = self.read().get(label) {
            v.fetch_add(n, Ordering::Relaxed);
            return;
        }
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.read()
            .get(label)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<AtomicU64>>> {
        self.values.read().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Vec<(String, u64)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// The node-wide metrics registry. Cheap to clone via `Arc`.
pub struct Registry {
    /// Containers launched, labeled by route path or fn name.
    pub container_launches: LabeledCounter,
    /// Idle containers evicted, labeled the same way.
    pub container_evictions: LabeledCounter,
    /// Completed calls, labeled by terminal status.
    pub calls: LabeledCounter,
    /// Placement attempts rejected by a runner, labeled by runner address.
    pub placement_rejections: LabeledCounter,
    /// Async messages awaiting delivery.
    pub queue_depth: AtomicI64,
    /// Memory currently allocated to slots, MiB.
    pub pool_memory_mb: AtomicI64,
    /// Waiters currently parked in the slot pool.
    pub slot_waiters: AtomicI64,
    /// Idle (warm) slots available for reuse.
    pub idle_slots: AtomicI64,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            container_launches: LabeledCounter::new(),
            container_evictions: LabeledCounter::new(),
            calls: LabeledCounter::new(),
            placement_rejections: LabeledCounter::new(),
            queue_depth: AtomicI64::new(0),
            pool_memory_mb: AtomicI64::new(0),
            slot_waiters: AtomicI64::new(0),
            idle_slots: AtomicI64::new(0),
        })
    }

    /// Render everything in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        render_counter(
            &mut out,
            "kiln_container_launches_total",
            "Containers launched, per route or function.",
            "route",
            &self.container_launches,
        );
        render_counter(
            &mut out,
            "kiln_container_evictions_total",
            "Idle containers evicted, per route or function.",
            "route",
            &self.container_evictions,
        );
        render_counter(
            &mut out,
            "kiln_calls_total",
            "Completed calls by terminal status.",
            "status",
            &self.calls,
        );
        render_counter(
            &mut out,
            "kiln_placement_rejections_total",
            "Placement attempts rejected by a runner.",
            "runner",
            &self.placement_rejections,
        );

        render_gauge(
            &mut out,
            "kiln_queue_depth",
            "Async messages awaiting delivery.",
            self.queue_depth.load(Ordering::Relaxed),
        );
        render_gauge(
            &mut out,
            "kiln_pool_memory_mb_in_use",
            "Memory currently allocated to container slots (MiB).",
            self.pool_memory_mb.load(Ordering::Relaxed),
        );
        render_gauge(
            &mut out,
            "kiln_slot_waiters",
            "Invocations parked waiting for a container slot.",
            self.slot_waiters.load(Ordering::Relaxed),
        );
        render_gauge(
            &mut out,
            "kiln_idle_slots",
            "Warm container slots available for reuse.",
            self.idle_slots.load(Ordering::Relaxed),
        );

        out
    }
}

fn render_counter(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    counter: &LabeledCounter,
) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n"));
    for (value, count) in counter.snapshot() {
        out.push_str(&format!(
            "{name}{{{label}=\"{}\"}} {count}\n",
            escape_label(&value)
        ));
    }
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: i64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
    ));
}

/// Prometheus label values escape backslash, quote, and newline.
fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_counter_tracks_per_label() {
        let c = LabeledCounter::new();
        c.inc("/hello");
        c.inc("/hello");
        c.inc("/world");
        assert_eq!(c.get("/hello"), 2);
        assert_eq!(c.get("/world"), 1);
        assert_eq!(c.get("/missing"), 0);
    }

    #[test]
    fn render_includes_types_and_values() {
        let reg = Registry::new();
        reg.container_launches.inc("/hello");
        reg.calls.inc("success");
        reg.queue_depth.store(3, Ordering::Relaxed);

        let text = reg.render();
        assert!(text.contains("# TYPE kiln_container_launches_total counter"));
        assert!(text.contains("kiln_container_launches_total{route=\"/hello\"} 1"));
        assert!(text.contains("kiln_calls_total{status=\"success\"} 1"));
        assert!(text.contains("# TYPE kiln_queue_depth gauge"));
        assert!(text.contains("kiln_queue_depth 3"));
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }
}
