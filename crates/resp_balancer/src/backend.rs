//! Upstream backend monitor.
//!
//! One monitor owns the connection pool for a single upstream, probes its
//! Raft role on an interval, and tracks up/down state through a rise/fall
//! hysteresis so a single flapping probe cannot flip the backend.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::upstream::ClientPool;

/// Probe intervals below this are clamped up.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);
/// Probe interval used when none is configured.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Placeholder connection count until the first probe resyncs from the pool.
/// High enough that a never-probed backend is not preferred by least-conn.
const INITIAL_CONNECTIONS: i64 = 1_000_000;
/// Placeholder latency until the first probe measures a real round trip.
const INITIAL_LATENCY: Duration = Duration::from_secs(60);

/// Tuning for a single upstream backend.
#[derive(Debug, Clone)]
pub struct Options {
    /// Backend address as `host:port`.
    pub addr: String,
    /// Stream transport selector; only `tcp` dials are supported.
    pub network: String,
    /// Idle connection cap for the backend pool.
    pub max_idle: usize,
    /// Probe interval; `None` uses the 1s default, low values clamp to 100ms.
    pub check_interval: Option<Duration>,
    /// Consecutive successful probes required to mark the backend up.
    pub rise: u32,
    /// Consecutive failed probes required to mark the backend down.
    pub fall: u32,
}

impl Options {
    fn effective_check_interval(&self) -> Duration {
        match self.check_interval {
            None => DEFAULT_CHECK_INTERVAL,
            Some(v) if v < MIN_CHECK_INTERVAL => MIN_CHECK_INTERVAL,
            Some(v) => v,
        }
    }

    fn rise(&self) -> i32 {
        self.rise.max(1) as i32
    }

    fn fall(&self) -> i32 {
        self.fall.max(1) as i32
    }
}

/// Health/role monitor for one upstream backend.
///
/// All state is atomic: the probe task writes, request tasks read, and the
/// only cross-task write is the dispatch-time connection increment.
pub struct BackendMonitor {
    pool: Arc<ClientPool>,
    opt: Options,

    up: AtomicI32,
    leader: AtomicI32,
    successes: AtomicI32,
    failures: AtomicI32,
    connections: AtomicI64,
    latency: AtomicI64,

    probe: Mutex<Option<ProbeTask>>,
}

struct ProbeTask {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl BackendMonitor {
    /// Create the monitor and start its probing task.
    pub async fn start(opt: Options) -> Arc<BackendMonitor> {
        let monitor = Arc::new(BackendMonitor::new(opt));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(BackendMonitor::probe_loop(Arc::clone(&monitor), shutdown_rx));
        *monitor.probe.lock().await = Some(ProbeTask { shutdown_tx, task });
        monitor
    }

    fn new(opt: Options) -> BackendMonitor {
        let pool = Arc::new(ClientPool::new(&opt.network, &opt.addr, opt.max_idle.max(1)));
        BackendMonitor {
            pool,
            opt,
            up: AtomicI32::new(1),
            leader: AtomicI32::new(0),
            successes: AtomicI32::new(0),
            failures: AtomicI32::new(0),
            connections: AtomicI64::new(INITIAL_CONNECTIONS),
            latency: AtomicI64::new(INITIAL_LATENCY.as_nanos() as i64),
            probe: Mutex::new(None),
        }
    }

    /// True when the backend is accepting traffic.
    pub fn up(&self) -> bool {
        self.up.load(Ordering::SeqCst) > 0
    }

    /// True when the backend is not accepting traffic.
    pub fn down(&self) -> bool {
        !self.up()
    }

    /// True when the last probe saw this backend as the Raft leader.
    pub fn leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst) > 0
    }

    /// Backend address.
    pub fn addr(&self) -> &str {
        &self.opt.addr
    }

    /// Current in-flight connection estimate.
    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Latency of the last successful probe round trip.
    pub fn latency(&self) -> Duration {
        Duration::from_nanos(self.latency_nanos().max(0) as u64)
    }

    pub(crate) fn latency_nanos(&self) -> i64 {
        self.latency.load(Ordering::SeqCst)
    }

    /// Adjust the in-flight connection estimate; `delta` may be negative.
    pub fn inc_connections(&self, delta: i64) {
        self.connections.fetch_add(delta, Ordering::SeqCst);
    }

    /// Connection pool for this backend.
    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    /// Stop the probing task and close the pool. Safe to call twice.
    pub async fn close(&self) -> anyhow::Result<()> {
        let Some(probe) = self.probe.lock().await.take() else {
            return Ok(());
        };
        let _ = probe.shutdown_tx.send(());
        match probe.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("probe task join failed: {err}")),
        }
    }

    async fn probe_loop(
        monitor: Arc<BackendMonitor>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let interval = monitor.opt.effective_check_interval();
        // Seed the state with an immediate probe before settling into the
        // interval loop.
        monitor.probe_once().await;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => return monitor.pool.close(),
                _ = time::sleep(interval) => monitor.probe_once().await,
            }
        }
    }

    /// One probe round trip: ask the backend who the Raft leader is.
    async fn probe_once(&self) {
        let start = Instant::now();
        let reply = match self.pool.get().await {
            Ok(mut conn) => conn.call(raftleader_frame()).await,
            Err(err) => Err(err),
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(node = %self.addr(), error = %err, "backend check failed");
                self.update_status(false);
                self.clear_leader();
                return;
            }
        };

        match reply {
            BytesFrame::BulkString(leader_addr) => {
                self.latency.store(
                    start.elapsed().as_nanos().min(i64::MAX as u128) as i64,
                    Ordering::SeqCst,
                );
                self.connections
                    .store(self.pool.active_count(), Ordering::SeqCst);
                self.update_status(true);

                if leader_addr.as_ref() == self.addr().as_bytes() {
                    if self
                        .leader
                        .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        tracing::info!(node = %self.addr(), "backend became leader");
                    }
                } else {
                    self.clear_leader();
                }
            }
            other => {
                tracing::error!(node = %self.addr(), reply = ?other, "backend check reply type fault");
                self.update_status(false);
                self.clear_leader();
            }
        }
    }

    fn clear_leader(&self) {
        if self
            .leader
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!(node = %self.addr(), "backend lost leadership");
        }
    }

    /// Fold one probe outcome into the rise/fall hysteresis.
    ///
    /// Counters saturate at their thresholds and the up/down flip happens
    /// exactly once per threshold crossing.
    pub(crate) fn update_status(&self, success: bool) {
        if success {
            self.failures.store(0, Ordering::SeqCst);
            let rise = self.opt.rise();
            let n = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
            if n > rise {
                self.successes.fetch_add(-1, Ordering::SeqCst);
            } else if n == rise
                && self
                    .up
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                tracing::info!(node = %self.addr(), "backend up");
            }
        } else {
            self.successes.store(0, Ordering::SeqCst);
            let fall = self.opt.fall();
            let n = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            if n > fall {
                self.failures.fetch_add(-1, Ordering::SeqCst);
            } else if n == fall
                && self
                    .up
                    .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                tracing::warn!(node = %self.addr(), "backend down");
            }
        }
    }
}

fn raftleader_frame() -> BytesFrame {
    BytesFrame::Array(vec![BytesFrame::BulkString(Bytes::from_static(
        b"RAFTLEADER",
    ))])
}
