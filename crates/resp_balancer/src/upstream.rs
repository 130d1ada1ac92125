//! Pooled RESP client connections to one upstream backend.
//!
//! The pool keeps a small stack of idle framed connections, expires idle
//! connections after a minute, and never recycles a connection that saw an
//! I/O error.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Idle connections older than this are closed instead of reused.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection pool for a single `host:port` upstream.
#[derive(Debug)]
pub struct ClientPool {
    addr: String,
    network: String,
    max_idle: usize,
    idle: Mutex<Vec<IdleConn>>,
    active: AtomicI64,
}

#[derive(Debug)]
struct IdleConn {
    framed: Framed<TcpStream, Resp2>,
    since: Instant,
}

impl ClientPool {
    pub fn new(network: &str, addr: &str, max_idle: usize) -> ClientPool {
        ClientPool {
            addr: addr.to_string(),
            network: network.to_string(),
            max_idle,
            idle: Mutex::new(Vec::new()),
            active: AtomicI64::new(0),
        }
    }

    /// Address this pool dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of open connections, idle and checked out.
    pub fn active_count(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Borrow a connection, reusing an idle one when possible.
    pub async fn get(self: &Arc<Self>) -> anyhow::Result<PooledConn> {
        while let Some(conn) = self.pop_idle() {
            if conn.since.elapsed() < IDLE_TIMEOUT {
                return Ok(PooledConn {
                    framed: Some(conn.framed),
                    pool: Arc::clone(self),
                    reusable: true,
                });
            }
            // Expired while idle; drop it and keep looking.
            self.active.fetch_add(-1, Ordering::SeqCst);
        }

        let framed = self.dial().await?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConn {
            framed: Some(framed),
            pool: Arc::clone(self),
            reusable: true,
        })
    }

    /// Close all idle connections. Checked-out connections close on drop.
    pub fn close(&self) -> anyhow::Result<()> {
        let drained: Vec<IdleConn> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        self.active.fetch_add(-(drained.len() as i64), Ordering::SeqCst);
        Ok(())
    }

    async fn dial(&self) -> anyhow::Result<Framed<TcpStream, Resp2>> {
        anyhow::ensure!(
            self.network == "tcp",
            "unsupported network {:?}",
            self.network
        );
        let socket = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connect to {}", self.addr))?;
        socket.set_nodelay(true).ok();
        Ok(Framed::new(socket, Resp2::default()))
    }

    fn pop_idle(&self) -> Option<IdleConn> {
        match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(_) => None,
        }
    }

    fn release(&self, framed: Framed<TcpStream, Resp2>, reusable: bool) {
        if reusable {
            if let Ok(mut idle) = self.idle.lock() {
                if idle.len() < self.max_idle {
                    idle.push(IdleConn {
                        framed,
                        since: Instant::now(),
                    });
                    return;
                }
            }
        }
        self.active.fetch_add(-1, Ordering::SeqCst);
    }
}

/// A borrowed pool connection; returns to the pool on drop unless an I/O
/// error marked it unusable.
#[derive(Debug)]
pub struct PooledConn {
    framed: Option<Framed<TcpStream, Resp2>>,
    pool: Arc<ClientPool>,
    reusable: bool,
}

impl PooledConn {
    /// Send one request frame and wait for its reply.
    pub async fn call(&mut self, req: BytesFrame) -> anyhow::Result<BytesFrame> {
        let addr = self.pool.addr.clone();
        let framed = self
            .framed
            .as_mut()
            .with_context(|| format!("connection to {addr} already released"))?;

        if let Err(err) = framed.send(req).await {
            self.reusable = false;
            return Err(anyhow::anyhow!("send to {addr}: {err}"));
        }
        match framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(err)) => {
                self.reusable = false;
                Err(anyhow::anyhow!("read reply from {addr}: {err}"))
            }
            None => {
                self.reusable = false;
                Err(anyhow::anyhow!("connection to {addr} closed"))
            }
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(framed) = self.framed.take() {
            self.pool.release(framed, self.reusable);
        }
    }
}
