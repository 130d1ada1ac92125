//! In-process command counters exposed through the `METRICS` verb.
//!
//! Counters are plain atomics so the request path can update them without
//! locking; the registry lock is only taken to intern a new command name.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;

const COMMAND_METRIC_PREFIX: &str = "balancer.command";
const BACKEND_METRIC_PREFIX: &str = "balancer.backend";

/// Latency/count aggregates for one client command verb.
#[derive(Debug)]
pub struct CommandStats {
    count: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

/// Point-in-time view of one command's aggregates.
#[derive(Debug, Serialize)]
pub struct CommandSnapshot {
    pub count: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: u64,
}

impl CommandStats {
    fn new() -> CommandStats {
        CommandStats {
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }

    fn record(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CommandSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let min_ns = self.min_ns.load(Ordering::Relaxed);
        CommandSnapshot {
            count,
            total_ns,
            min_ns: if count == 0 { 0 } else { min_ns },
            max_ns: self.max_ns.load(Ordering::Relaxed),
            mean_ns: if count == 0 { 0 } else { total_ns / count },
        }
    }
}

/// Registry of per-verb command timers and per-backend traffic meters.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    commands: RwLock<HashMap<String, Arc<CommandStats>>>,
    backends: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl MetricsRegistry {
    /// Record one dispatched command.
    pub fn record_command(&self, verb: &str, elapsed: Duration) {
        if let Ok(commands) = self.commands.read() {
            if let Some(stats) = commands.get(verb) {
                stats.record(elapsed);
                return;
            }
        }
        let Ok(mut commands) = self.commands.write() else {
            return;
        };
        let stats = commands
            .entry(verb.to_string())
            .or_insert_with(|| Arc::new(CommandStats::new()))
            .clone();
        drop(commands);
        stats.record(elapsed);
    }

    /// Mark one upstream dispatch to the given backend.
    pub fn mark_backend(&self, addr: &str) {
        if let Ok(backends) = self.backends.read() {
            if let Some(meter) = backends.get(addr) {
                meter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let Ok(mut backends) = self.backends.write() else {
            return;
        };
        backends
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Render the whole registry as one JSON document.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        let mut commands_out = BTreeMap::new();
        if let Ok(commands) = self.commands.read() {
            for (verb, stats) in commands.iter() {
                commands_out.insert(format!("{COMMAND_METRIC_PREFIX}.{verb}"), stats.snapshot());
            }
        }
        for (key, snapshot) in commands_out {
            out.insert(key, serde_json::json!(snapshot));
        }

        let mut backends_out = BTreeMap::new();
        if let Ok(backends) = self.backends.read() {
            for (addr, meter) in backends.iter() {
                backends_out.insert(
                    format!("{BACKEND_METRIC_PREFIX}.{addr}"),
                    meter.load(Ordering::Relaxed),
                );
            }
        }
        for (key, count) in backends_out {
            out.insert(key, serde_json::json!({ "count": count }));
        }

        serde_json::Value::Object(out)
    }
}
