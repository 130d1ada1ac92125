//! Balancer configuration file loading.
//!
//! The `loadBalancer` document lists the upstream backends with their probe
//! tuning plus the pool-wide dispatch settings. Durations are humantime
//! strings (`100ms`, `1s`).

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level configuration document.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "loadBalancer")]
    pub load_balancer: LoadBalancerConfig,
}

/// The `loadBalancer` section.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// Upstream backends, in dispatch order.
    pub upstream: Vec<UpstreamConfig>,
    /// Idle connection cap for each backend pool.
    pub max_idle: usize,
    /// Dispatch mode name; unknown names fall back to least-conn.
    pub mode: String,
    /// Route mutating verbs (`set`, `jset`, `plset`) to the Raft leader.
    pub routing: bool,
    /// Reserved knob; parsed but currently without effect.
    pub health_check: bool,
}

/// One upstream backend entry.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Backend address as `host:port`.
    pub host: String,
    /// Probe interval; unset uses the 1s default.
    #[serde(with = "humantime_serde")]
    pub check_interval: Option<Duration>,
    /// Consecutive successful probes required before the backend counts as up.
    pub rise: u32,
    /// Consecutive failed probes required before the backend counts as down.
    pub fall: u32,
}

/// Read and parse a configuration file.
pub fn read_config(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config = toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}
