use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::MemberRegistry;
use crate::Error;

const HEARTBEAT_INTERVAL_SECS: u64 = 5;
const FULL_SYNC_INTERVAL_SECS: u64 = 30;
const CLEANUP_PROBABILITY_PERCENT: u32 = 10;
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Immutable value snapshot of the live member set at one point in logical
/// time. Members are the raw child names under the chroot (numeric id
/// strings); mapping them onto backend identifiers is the consumer's job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipSnapshot {
    members: BTreeSet<String>,
}

impl MembershipSnapshot {
    pub fn contains(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl FromIterator<String> for MembershipSnapshot {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

/// One element of the watch stream: a full snapshot, or the terminal error
/// that ended the subscription.
#[derive(Debug)]
pub enum WatchEvent {
    Snapshot(MembershipSnapshot),
    Failed(Error),
}

/// Produces the ordered stream of membership snapshots for the reconciler.
///
/// The watch loop mirrors a one-shot child watch: list the live members,
/// deliver the snapshot, then block until a single change notification (or
/// the periodic full-sync tick, which covers notifications lost to crashed
/// peers) before listing again. Changes that land between two listings
/// coalesce into the next snapshot; consumers must not assume they see every
/// intermediate state.
///
/// A heartbeat task keeps the local liveness marker fresh for as long as the
/// watcher runs, and occasionally sweeps markers of crashed peers.
pub struct MembershipWatcher {
    registry: MemberRegistry,
}

impl MembershipWatcher {
    pub fn new(registry: MemberRegistry) -> Self {
        Self { registry }
    }

    /// Start the watch and heartbeat tasks. The returned receiver yields
    /// snapshots until either the token is cancelled (channel closes cleanly)
    /// or the subscription fails (a final `WatchEvent::Failed` is delivered).
    pub fn spawn(self, cancel: CancellationToken) -> (mpsc::Receiver<WatchEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    async fn run(mut self, tx: mpsc::Sender<WatchEvent>, cancel: CancellationToken) {
        let heartbeat = tokio::spawn(Self::heartbeat_loop(self.registry.clone(), cancel.clone()));

        if let Err(err) = self.watch_loop(&tx, &cancel).await {
            let _ = tx.send(WatchEvent::Failed(err)).await;
        }

        heartbeat.abort();
        let _ = heartbeat.await;
        tracing::debug!("membership watcher shut down");
    }

    async fn watch_loop(
        &mut self,
        tx: &mpsc::Sender<WatchEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut pubsub = self.registry.subscribe().await?;
        let mut notifications = pubsub.on_message();
        let mut sync_interval = tokio::time::interval(Duration::from_secs(FULL_SYNC_INTERVAL_SECS));
        sync_interval.tick().await; // the first tick fires immediately

        loop {
            let members = self.registry.live_members().await?;
            let snapshot: MembershipSnapshot = members.into_iter().collect();
            tracing::debug!(count = snapshot.len(), "delivering membership snapshot");
            if tx.send(WatchEvent::Snapshot(snapshot)).await.is_err() {
                // Consumer dropped the receiver; nothing left to watch for.
                return Ok(());
            }

            // Re-arm: wait for exactly one notification before re-listing.
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = notifications.next() => {
                    if msg.is_none() {
                        return Err(Error::Watch(
                            "membership subscription stream ended".to_string(),
                        ));
                    }
                }
                _ = sync_interval.tick() => {
                    tracing::trace!("periodic full sync");
                }
            }
        }
    }

    async fn heartbeat_loop(mut registry: MemberRegistry, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = registry.heartbeat().await {
                        consecutive_failures += 1;
                        let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(6));
                        tracing::error!(
                            failures = consecutive_failures,
                            backoff_ms,
                            "heartbeat failed: {err}, backing off"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        }
                        continue;
                    }
                    consecutive_failures = 0;

                    // Occasionally sweep markers of peers that crashed
                    // without deregistering.
                    if rand::random::<u32>() % 100 < CLEANUP_PROBABILITY_PERCENT {
                        if let Err(err) = registry.cleanup_stale().await {
                            tracing::warn!("stale cleanup failed: {err}");
                        }
                    }
                }
            }
        }
        tracing::debug!("heartbeat task shut down");
    }
}
