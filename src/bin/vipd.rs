//! Per-node VIP group controller daemon.
//!
//! Registers the local node in the cluster member registry, watches
//! membership, and keeps the kernel VIP group in step with the Maglev slot
//! assignment. Watch and sink failures are retried with backoff;
//! misconfiguration (bad table size, duplicate node id) terminates.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vip_hashring::{
    ClusterIpFile, Config, Error, MemberRegistry, MembershipWatcher, Reconciler,
};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "vipd")]
#[command(about = "Maglev-style VIP group controller using Redis membership")]
#[command(version)]
struct Cli {
    /// Local node id, starting from 1. Must be unique throughout the cluster.
    #[arg(long, default_value_t = 1)]
    my_id: u32,

    /// Total nodes in the pool. Can be more than are currently alive.
    #[arg(long, default_value_t = 5)]
    total_nodes: u32,

    /// Redis connection URL for cluster coordination.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis: String,

    /// Cluster ip (vip) to manage.
    #[arg(long, default_value = "198.51.100.1")]
    cluster_ip: String,

    /// Lookup table size. Must be prime and larger than --total-nodes.
    #[arg(long, default_value_t = 13)]
    table_size: usize,

    /// Key namespace prefix in the coordination service.
    #[arg(long, default_value = "maglev0")]
    chroot: String,

    /// Directory containing the kernel group control files.
    #[arg(long, default_value = "/proc/net/ipt_CLUSTERIP")]
    sink_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config {
        my_id: cli.my_id,
        total_nodes: cli.total_nodes,
        table_size: cli.table_size,
        chroot: cli.chroot,
        vip: cli.cluster_ip,
        sink_dir: cli.sink_dir,
    };

    if let Err(err) = supervise(config, &cli.redis).await {
        tracing::error!(kind = ?err.kind(), "terminating: {err}");
        std::process::exit(1);
    }
}

/// Run controller sessions until shutdown, applying the per-kind error
/// policy: recoverable failures reconnect with exponential backoff, anything
/// else propagates and kills the process.
async fn supervise(config: Config, redis_url: &str) -> Result<(), Error> {
    config.validate()?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let session = uuid::Uuid::new_v4();
    let mut retry_delay = INITIAL_RETRY_DELAY;

    loop {
        match run_session(&config, redis_url, session, &cancel).await {
            Ok(()) => return Ok(()),
            Err(err) if cancel.is_cancelled() => {
                tracing::debug!("ignoring error during shutdown: {err}");
                return Ok(());
            }
            Err(err) if err.kind().is_recoverable() => {
                tracing::warn!(
                    kind = ?err.kind(),
                    delay_secs = retry_delay.as_secs(),
                    "session failed: {err}; reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

/// One registration-to-failure lifetime: register, watch, reconcile. On any
/// exit the watcher is stopped first so in-flight reconciliation can finish,
/// then the liveness marker is removed instead of being left to expire.
async fn run_session(
    config: &Config,
    redis_url: &str,
    session: uuid::Uuid,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let mut registry =
        MemberRegistry::connect(redis_url, &config.chroot, config.my_id, session).await?;
    registry.register().await?;

    let session_cancel = cancel.child_token();
    let (events, watch_handle) =
        MembershipWatcher::new(registry.clone()).spawn(session_cancel.clone());

    let sink = ClusterIpFile::new(&config.sink_dir, &config.vip);
    let mut reconciler = Reconciler::new(config.clone(), sink);
    reconciler.resync_from_sink().await?;

    let result = reconciler.run(events).await;

    session_cancel.cancel();
    let _ = watch_handle.await;
    if let Err(err) = registry.deregister().await {
        tracing::warn!("failed to deregister cleanly: {err}");
    }

    result
}
