//! Dispatch-mode selection over the backend pool.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::backend::{BackendMonitor, Options};
use crate::pool::{NonEmptyPool, Pool};
use crate::upstream::ClientPool;

/// Address dialed when no upstream is configured.
const DEFAULT_BACKEND_ADDR: &str = "127.0.0.1:7481";

/// Dispatch policy across the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceMode {
    /// Pick the backend with the fewest connections.
    LeastConn,
    /// Always pick the first available backend.
    FirstUp,
    /// Pick the backend with the lowest probe latency.
    MinLatency,
    /// Pick uniformly among available backends.
    Random,
    /// Latency-weighted random pick, biased toward fast backends.
    WeightedLatency,
    /// Rotate across available backends.
    RoundRobin,
}

impl BalanceMode {
    /// Parse a configured mode name; unknown names fall back to least-conn.
    pub fn parse(name: &str) -> BalanceMode {
        match name {
            "leastconn" => BalanceMode::LeastConn,
            "firstup" => BalanceMode::FirstUp,
            "minlatency" => BalanceMode::MinLatency,
            "random" => BalanceMode::Random,
            "weightedlatency" => BalanceMode::WeightedLatency,
            "roundrobin" => BalanceMode::RoundRobin,
            _ => BalanceMode::LeastConn,
        }
    }
}

/// Snapshot handle for one dispatch decision. A value copy: mutating it does
/// not touch the monitor it was taken from.
#[derive(Clone)]
pub struct Backend {
    pub addr: String,
    pub pool: Arc<ClientPool>,
    pub connections: i64,
    pub latency: Duration,
    pub up: bool,
}

/// Policy-driven selector over the backend pool.
pub struct Balancer {
    pool: NonEmptyPool,
    mode: BalanceMode,
    cursor: AtomicI32,
}

impl Balancer {
    /// Start monitors for every upstream and assemble the balancer. With no
    /// upstreams configured a single default backend is substituted, so the
    /// pool is never empty.
    pub async fn start(opts: Vec<Options>, mode: BalanceMode) -> Balancer {
        let mut opts = opts.into_iter();
        let first = match opts.next() {
            Some(opt) => opt,
            None => Options {
                addr: DEFAULT_BACKEND_ADDR.to_string(),
                network: "tcp".to_string(),
                max_idle: 1,
                check_interval: None,
                rise: 0,
                fall: 0,
            },
        };

        let first = BackendMonitor::start(normalize(first)).await;
        let mut rest = Vec::with_capacity(opts.len());
        for opt in opts {
            rest.push(BackendMonitor::start(normalize(opt)).await);
        }

        Balancer {
            pool: NonEmptyPool::new(first, rest),
            mode,
            cursor: AtomicI32::new(0),
        }
    }

    /// The ordered backend pool.
    pub fn pool(&self) -> &Pool {
        self.pool.view()
    }

    /// Next backend according to the configured mode.
    pub fn next(&self) -> Backend {
        self.pick_next(&mut rand::thread_rng())
    }

    /// Leader backend for mutating commands, with availability fallbacks.
    pub fn leader(&self) -> Backend {
        self.pick_leader(&mut rand::thread_rng())
    }

    /// Close every monitor; the last error wins.
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut result = Ok(());
        for backend in self.pool.view().iter() {
            if let Err(err) = backend.close().await {
                result = Err(err);
            }
        }
        result
    }

    fn pick_next(&self, rng: &mut impl Rng) -> Backend {
        let pool = self.pool.view();
        let backend = match self.mode {
            BalanceMode::LeastConn => pool.min_up(|b| b.connections()),
            BalanceMode::FirstUp => pool.first_up(),
            BalanceMode::MinLatency => pool.min_up(|b| b.latency_nanos()),
            BalanceMode::Random => pool.up().random(rng),
            BalanceMode::WeightedLatency => pool.up().weighted_random(rng, |b| {
                let factor = b.latency_nanos();
                factor.wrapping_mul(factor)
            }),
            BalanceMode::RoundRobin => {
                let next = self.cursor.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
                pool.up().at(next)
            }
        };

        // Dispatch must always yield a backend, even with every backend
        // down; the upstream call is then allowed to fail.
        let backend = backend.unwrap_or_else(|| self.pool.random(rng));
        Self::checkout(&backend)
    }

    fn pick_leader(&self, rng: &mut impl Rng) -> Backend {
        let backend = self
            .pool
            .view()
            .leader()
            .or_else(|| self.pool.view().first_up())
            .unwrap_or_else(|| self.pool.random(rng));
        Self::checkout(&backend)
    }

    fn checkout(backend: &Arc<BackendMonitor>) -> Backend {
        backend.inc_connections(1);
        Backend {
            addr: backend.addr().to_string(),
            pool: Arc::clone(backend.pool()),
            connections: backend.connections(),
            latency: backend.latency(),
            up: backend.up(),
        }
    }
}

/// A zero idle cap means a pool that can never recycle; raise it to one.
fn normalize(mut opt: Options) -> Options {
    if opt.max_idle == 0 {
        opt.max_idle = 1;
    }
    opt
}
