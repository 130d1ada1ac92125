// RESP balancer entry point.
//
// Wires together configuration, the backend monitors, and the client-facing
// RESP server, and hosts the CLI and runtime setup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

mod backend;
mod balancer;
mod config;
mod metrics;
mod pipeline;
mod pool;
mod redis_server;
mod upstream;

use backend::Options;
use balancer::{BalanceMode, Balancer};
use config::Config;
use redis_server::ServerState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI options.
#[derive(Parser, Debug)]
#[command(name = "resp-balancer", version)]
struct Args {
    /// Listen address for the client-facing RESP server.
    #[arg(short = 'l', long, default_value = "127.0.0.1:7781")]
    listen: SocketAddr,

    /// Configuration file path.
    #[arg(short = 'c', long, default_value = "balancer.toml")]
    config: PathBuf,

    /// Log verbosity level [error, warn, info, debug, trace].
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Maximum number of runtime worker threads (0 uses all cores).
    #[arg(short = 'C', long, default_value_t = 0)]
    cpus: usize,

    /// Periodically log per-backend runtime statistics at this interval.
    #[arg(long)]
    stats_interval: Option<humantime::Duration>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match config::read_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "config read failed");
            std::process::exit(1);
        }
    };

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if args.cpus > 0 {
        runtime.worker_threads(args.cpus);
    }
    let runtime = runtime.enable_all().build().context("build runtime")?;
    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let lb = &config.load_balancer;
    let mode = BalanceMode::parse(&lb.mode);

    let mut options = Vec::with_capacity(lb.upstream.len());
    for upstream in &lb.upstream {
        options.push(Options {
            addr: upstream.host.clone(),
            network: "tcp".to_string(),
            max_idle: lb.max_idle,
            check_interval: upstream.check_interval,
            rise: upstream.rise,
            fall: upstream.fall,
        });
    }

    let balancer = Balancer::start(options, mode).await;
    let state = Arc::new(ServerState::new(balancer, lb.routing));

    tracing::info!(
        version = VERSION,
        addr = %args.listen,
        mode = ?mode,
        routing = lb.routing,
        health_check = lb.health_check,
        backends = state.balancer.pool().len(),
        "balancer service started"
    );

    if let Some(interval) = args.stats_interval {
        tokio::spawn(log_stats(Arc::clone(&state), interval.into()));
    }

    let result = tokio::select! {
        res = redis_server::run(args.listen, Arc::clone(&state)) => {
            if let Err(err) = &res {
                tracing::error!(error = %err, "server startup failed");
            }
            res
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("balancer service stopping");
            Ok(())
        }
    };

    state.balancer.close().await?;
    result
}

/// Periodic per-backend stats logging.
async fn log_stats(state: Arc<ServerState>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        for backend in state.balancer.pool().iter() {
            tracing::info!(
                node = %backend.addr(),
                up = backend.up(),
                leader = backend.leader(),
                connections = backend.connections(),
                latency_us = backend.latency().as_micros() as u64,
                "backend stats"
            );
        }
    }
}
