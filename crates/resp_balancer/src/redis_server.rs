//! Client-facing RESP server and command dispatcher.
//!
//! Each client connection runs its own task: decode a command, peek whatever
//! else the client already pipelined, coalesce uniform runs, and relay the
//! command to a backend chosen by the balancer.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{FutureExt, SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

use crate::balancer::{Backend, Balancer};
use crate::metrics::MetricsRegistry;
use crate::pipeline::{self, Command};

/// Capacity of the process-wide monitor event channel. A single slot plus
/// non-blocking send means a slow subscriber drops events instead of
/// stalling the request path.
const MONITOR_CHANNEL_CAPACITY: usize = 1;

/// Shared state for every client connection.
pub struct ServerState {
    pub balancer: Balancer,
    pub routing: bool,
    pub metrics: MetricsRegistry,
    monitor_tx: broadcast::Sender<String>,
}

impl ServerState {
    pub fn new(balancer: Balancer, routing: bool) -> ServerState {
        let (monitor_tx, _) = broadcast::channel(MONITOR_CHANNEL_CAPACITY);
        ServerState {
            balancer,
            routing,
            metrics: MetricsRegistry::default(),
            monitor_tx,
        }
    }
}

/// Accept loop for the client listener.
pub async fn run(addr: SocketAddr, state: Arc<ServerState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    loop {
        let (socket, remote) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            tracing::info!(remote = %remote, "client connected");
            if let Err(err) = handle_conn(socket, remote, state).await {
                tracing::debug!(remote = %remote, error = %err, "client connection error");
            }
            tracing::info!(remote = %remote, "client disconnected");
        });
    }
}

async fn handle_conn(
    socket: TcpStream,
    remote: SocketAddr,
    state: Arc<ServerState>,
) -> anyhow::Result<()> {
    socket.set_nodelay(true).ok();
    let mut framed = Framed::new(socket, Resp2::default());
    let mut pending: VecDeque<BytesFrame> = VecDeque::new();

    loop {
        let frame = if let Some(frame) = pending.pop_front() {
            frame
        } else {
            match framed.next().await {
                Some(frame) => frame?,
                None => return Ok(()),
            }
        };

        let head = match pipeline::parse_command(frame) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(err) => {
                framed
                    .send(BytesFrame::Error(format!("ERR {err:#}").into()))
                    .await?;
                continue;
            }
        };

        // Pull whatever else the client already pipelined, then try to
        // collapse the run into one upstream round trip.
        peek_pipeline(&mut framed, &mut pending)?;

        let start = Instant::now();
        let head_verb = head.verb().into_owned();
        let head_cmd = head.clone();
        let (_, cmd) = pipeline::coalesce(head, &mut pending);
        let verb = cmd.verb();

        if verb == "monitor" {
            state.metrics.record_command(&head_verb, start.elapsed());
            return monitor_stream(framed, remote, head_cmd, state).await;
        }

        dispatch(&state, &mut framed, &cmd, verb.as_ref()).await?;
        <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(&mut framed).await?;

        // Metrics and the monitor feed see the head command as received,
        // not the synthesized one.
        state.metrics.record_command(&head_verb, start.elapsed());
        publish_monitor_event(&state, remote, &head_cmd);
    }
}

/// Drain frames the client has already written without waiting.
fn peek_pipeline(
    framed: &mut Framed<TcpStream, Resp2>,
    pending: &mut VecDeque<BytesFrame>,
) -> anyhow::Result<()> {
    loop {
        match framed.next().now_or_never() {
            Some(Some(Ok(frame))) => pending.push_back(frame),
            Some(Some(Err(err))) => anyhow::bail!("failed to read RESP frame: {err}"),
            Some(None) | None => return Ok(()),
        }
    }
}

async fn dispatch(
    state: &ServerState,
    framed: &mut Framed<TcpStream, Resp2>,
    cmd: &Command,
    verb: &str,
) -> anyhow::Result<()> {
    match verb {
        "metrics" => match serde_json::to_vec(&state.metrics.snapshot()) {
            Ok(data) => framed.feed(BytesFrame::BulkString(Bytes::from(data))).await?,
            Err(_) => framed.feed(BytesFrame::Null).await?,
        },
        "plget" => plget(state, framed, cmd).await?,
        "plset" => plset(state, framed, cmd).await?,
        _ => forward(state, framed, cmd, verb).await?,
    }
    Ok(())
}

/// Pick the dispatch target for a verb, honoring leader routing.
fn route(state: &ServerState, verb: &str) -> Backend {
    if state.routing && matches!(verb, "set" | "jset" | "plset") {
        state.balancer.leader()
    } else {
        state.balancer.next()
    }
}

async fn call_backend(
    state: &ServerState,
    backend: &Backend,
    frame: BytesFrame,
) -> anyhow::Result<BytesFrame> {
    tracing::debug!(
        node = %backend.addr,
        up = backend.up,
        connections = backend.connections,
        latency_us = backend.latency.as_micros() as u64,
        "dispatching to backend"
    );
    state.metrics.mark_backend(&backend.addr);
    let mut conn = backend.pool.get().await?;
    conn.call(frame).await
}

/// Forward a command unchanged and relay the upstream reply. Error frames
/// pass through verbatim; transport failures surface as `ERR` lines.
async fn forward(
    state: &ServerState,
    framed: &mut Framed<TcpStream, Resp2>,
    cmd: &Command,
    verb: &str,
) -> anyhow::Result<()> {
    let backend = route(state, verb);
    match call_backend(state, &backend, cmd.to_frame()).await {
        Ok(reply) => framed.feed(reply).await?,
        Err(err) => {
            framed
                .feed(BytesFrame::Error(format!("ERR {err:#}").into()))
                .await?
        }
    }
    Ok(())
}

/// Dispatch a synthetic PLGET as an upstream MGET and fan the array reply
/// back out onto the original command slots.
async fn plget(
    state: &ServerState,
    framed: &mut Framed<TcpStream, Resp2>,
    cmd: &Command,
) -> anyhow::Result<()> {
    let slots = cmd.args.len().saturating_sub(1);
    let backend = route(state, "plget");
    match call_backend(state, &backend, cmd.to_frame_with_verb(b"MGET")).await {
        Ok(BytesFrame::Array(values)) => {
            for value in values {
                framed.feed(value).await?;
            }
        }
        Ok(BytesFrame::Error(err)) => fan_out_error(framed, err.to_string(), slots).await?,
        Ok(other) => {
            tracing::debug!(reply = ?other, "invalid MGET response from backend");
            fan_out_error(framed, "ERR invalid response".to_string(), slots).await?;
        }
        Err(err) => fan_out_error(framed, format!("ERR {err:#}"), slots).await?,
    }
    Ok(())
}

/// Dispatch a synthetic PLSET as an upstream MSET and reply one OK per
/// original key/value pair.
async fn plset(
    state: &ServerState,
    framed: &mut Framed<TcpStream, Resp2>,
    cmd: &Command,
) -> anyhow::Result<()> {
    let slots = cmd.args.len().saturating_sub(1) / 2;
    let backend = route(state, "plset");
    match call_backend(state, &backend, cmd.to_frame_with_verb(b"MSET")).await {
        Ok(BytesFrame::SimpleString(_)) => {
            for _ in 0..slots {
                framed
                    .feed(BytesFrame::SimpleString(Bytes::from_static(b"OK")))
                    .await?;
            }
        }
        Ok(BytesFrame::Error(err)) => fan_out_error(framed, err.to_string(), slots).await?,
        Ok(other) => {
            tracing::debug!(reply = ?other, "invalid MSET response from backend");
            fan_out_error(framed, "ERR invalid response".to_string(), slots).await?;
        }
        Err(err) => fan_out_error(framed, format!("ERR {err:#}"), slots).await?,
    }
    Ok(())
}

/// Write one error per original pipelined command slot so the client's
/// reply count matches its request count.
async fn fan_out_error(
    framed: &mut Framed<TcpStream, Resp2>,
    message: String,
    slots: usize,
) -> anyhow::Result<()> {
    for _ in 0..slots.max(1) {
        framed
            .feed(BytesFrame::Error(message.clone().into()))
            .await?;
    }
    Ok(())
}

/// Stream monitor events to this client until its write side fails.
async fn monitor_stream(
    mut framed: Framed<TcpStream, Resp2>,
    remote: SocketAddr,
    cmd: Command,
    state: Arc<ServerState>,
) -> anyhow::Result<()> {
    let mut events = state.monitor_tx.subscribe();
    framed
        .send(BytesFrame::SimpleString(Bytes::from_static(b"OK")))
        .await?;
    // The subscriber sees its own MONITOR command as the first event.
    publish_monitor_event(&state, remote, &cmd);

    loop {
        let line = match events.recv().await {
            Ok(line) => line,
            // A lagging subscriber skips dropped events rather than
            // stalling the senders.
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };
        if framed
            .send(BytesFrame::SimpleString(line.into_bytes().into()))
            .await
            .is_err()
        {
            return Ok(());
        }
    }
}

/// Best-effort publish of a formatted monitor line; drops when nobody is
/// subscribed or every subscriber lags.
fn publish_monitor_event(state: &ServerState, remote: SocketAddr, cmd: &Command) {
    let now = chrono::Local::now();
    let mut line = format!(
        "- {}.{:02} [{remote}] |",
        now.format("%Y/%m/%d %H:%M:%S"),
        now.timestamp_subsec_millis() / 10
    );
    for (n, arg) in cmd.args.iter().enumerate() {
        if n > 0 {
            line.push(' ');
        }
        line.push_str(&String::from_utf8_lossy(arg));
    }
    line.push('|');
    let _ = state.monitor_tx.send(line);
}
