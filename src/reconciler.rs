use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::ring::Assignment;
use crate::sink::VipSink;
use crate::watcher::{MembershipSnapshot, WatchEvent};
use crate::Error;

const SINK_RETRY_ATTEMPTS: u32 = 3;
const SINK_RETRY_DELAY_MS: u64 = 50;

/// Turns membership snapshots into local VIP slot ownership.
///
/// The reconciler is the sole owner of both the published assignment and the
/// set of slots applied to the sink. It processes one snapshot at a time,
/// strictly in delivery order: for each snapshot it rebuilds the full Maglev
/// table, takes the slots assigned to the local backend, diffs them against
/// what the sink already has, and issues the add/remove calls sequentially.
/// The loop alternates between waiting on the channel and applying a
/// snapshot; a failed watch or an unrecoverable sink write ends it with the
/// error for the supervisor to classify.
///
/// The freshly built assignment is published through an atomic pointer swap
/// so diagnostic readers never observe a half-built table.
pub struct Reconciler<S: VipSink> {
    config: Config,
    sink: S,
    applied: BTreeSet<usize>,
    assignment: Arc<ArcSwapOption<Assignment>>,
}

impl<S: VipSink> Reconciler<S> {
    pub fn new(config: Config, sink: S) -> Self {
        Self {
            config,
            sink,
            applied: BTreeSet::new(),
            assignment: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// Handle for lock-free reads of the latest published assignment.
    pub fn assignment_handle(&self) -> Arc<ArcSwapOption<Assignment>> {
        self.assignment.clone()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Slots currently applied to the sink, as tracked by this reconciler.
    pub fn applied_slots(&self) -> &BTreeSet<usize> {
        &self.applied
    }

    /// Adopt whatever the sink already holds as the applied state.
    ///
    /// Called at session start so that a restart (or a reconnect after a
    /// watch failure) diffs against reality instead of re-adding slots the
    /// sink still has and orphaning ones it should drop.
    pub async fn resync_from_sink(&mut self) -> Result<(), Error> {
        self.applied = self.sink.query().await?;
        if !self.applied.is_empty() {
            tracing::info!(slots = ?self.applied, "adopted already-claimed slots from the sink");
        }
        Ok(())
    }

    /// Consume the watch stream until it closes or fails.
    ///
    /// A closed channel means the watcher was cancelled; that is a clean
    /// shutdown and returns `Ok`.
    pub async fn run(&mut self, mut events: mpsc::Receiver<WatchEvent>) -> Result<(), Error> {
        while let Some(event) = events.recv().await {
            match event {
                WatchEvent::Snapshot(snapshot) => self.sync(&snapshot).await?,
                WatchEvent::Failed(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Apply one membership snapshot.
    pub async fn sync(&mut self, snapshot: &MembershipSnapshot) -> Result<(), Error> {
        let live = self.config.live_backends(snapshot);
        let self_backend = self.config.self_backend();

        let owned = if live.is_empty() {
            // An empty live set would make the table build fail; treat it as
            // owning nothing so a cluster-wide outage doesn't also take down
            // the controller.
            tracing::warn!("live backend set is empty; releasing every claimed slot");
            self.assignment.store(None);
            BTreeSet::new()
        } else {
            let assignment = Assignment::build(live.iter().cloned(), self.config.table_size)?;
            let owned = assignment.slots_owned_by(&self_backend);
            self.assignment.store(Some(Arc::new(assignment)));
            owned
        };

        let to_add: Vec<usize> = owned.difference(&self.applied).copied().collect();
        let to_remove: Vec<usize> = self.applied.difference(&owned).copied().collect();

        if to_add.is_empty() && to_remove.is_empty() {
            tracing::debug!(owned = owned.len(), "snapshot required no slot changes");
            return Ok(());
        }

        for &slot in &to_add {
            self.apply(slot, true).await?;
        }
        for &slot in &to_remove {
            self.apply(slot, false).await?;
        }
        self.applied = owned;

        match self.sink.query().await {
            Ok(state) => tracing::info!(
                live = live.len(),
                owned = self.applied.len(),
                added = to_add.len(),
                removed = to_remove.len(),
                sink_state = ?state,
                "reconciled vip membership"
            ),
            Err(err) => tracing::warn!("sink state query failed: {err}"),
        }
        Ok(())
    }

    /// Issue one sink write, retrying transient failures a few times before
    /// giving up. Each write completes before the next is attempted.
    async fn apply(&mut self, slot: usize, claim: bool) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            let result = if claim {
                self.sink.add(slot).await
            } else {
                self.sink.remove(slot).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt >= SINK_RETRY_ATTEMPTS {
                        return Err(err);
                    }
                    tracing::warn!(slot, claim, attempt, "sink write failed: {err}; retrying");
                    tokio::time::sleep(Duration::from_millis(SINK_RETRY_DELAY_MS)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, SinkOp};
    use crate::ErrorKind;
    use async_trait::async_trait;

    fn config(my_id: u32) -> Config {
        Config {
            my_id,
            ..Config::default()
        }
    }

    fn snapshot(members: &[u32]) -> MembershipSnapshot {
        members.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_first_snapshot_claims_owned_slots() {
        let mut reconciler = Reconciler::new(config(1), MemorySink::new());
        reconciler.sync(&snapshot(&[1, 2, 3, 4, 5])).await.unwrap();

        let owned = reconciler.applied_slots().clone();
        assert!(!owned.is_empty(), "backend-1 should own some of 13 slots");
        assert_eq!(reconciler.sink().slots(), &owned);
        assert!(reconciler
            .sink()
            .ops()
            .iter()
            .all(|op| matches!(op, SinkOp::Add(_))));
    }

    #[tokio::test]
    async fn test_identical_snapshot_issues_no_sink_calls() {
        let mut reconciler = Reconciler::new(config(1), MemorySink::new());
        reconciler.sync(&snapshot(&[1, 2, 3])).await.unwrap();

        let ops_after_first = reconciler.sink().ops().len();
        reconciler.sync(&snapshot(&[1, 2, 3])).await.unwrap();
        assert_eq!(reconciler.sink().ops().len(), ops_after_first);
    }

    #[tokio::test]
    async fn test_losing_only_owned_slot_issues_single_remove() {
        // With the full pool of 11 live and a 13-slot table, backend-2 owns
        // exactly one slot; dropping it from the live set must produce one
        // remove and nothing else.
        let config = Config {
            my_id: 2,
            total_nodes: 11,
            ..Config::default()
        };
        let all: Vec<u32> = (1..=11).collect();
        let mut reconciler = Reconciler::new(config, MemorySink::new());
        reconciler.sync(&snapshot(&all)).await.unwrap();
        assert_eq!(
            reconciler.applied_slots().len(),
            1,
            "fixture expects backend-2 to own exactly one slot"
        );

        reconciler.sink_mut().clear_ops();

        let without_self: Vec<u32> = all.into_iter().filter(|&id| id != 2).collect();
        reconciler.sync(&snapshot(&without_self)).await.unwrap();

        assert_eq!(reconciler.sink().ops().len(), 1);
        assert!(matches!(reconciler.sink().ops()[0], SinkOp::Remove(_)));
        assert!(reconciler.applied_slots().is_empty());
    }

    #[tokio::test]
    async fn test_empty_live_set_releases_everything() {
        let mut reconciler = Reconciler::new(config(1), MemorySink::new());
        reconciler.sync(&snapshot(&[1, 2])).await.unwrap();
        assert!(!reconciler.applied_slots().is_empty());

        reconciler.sync(&snapshot(&[])).await.unwrap();
        assert!(reconciler.applied_slots().is_empty());
        assert!(reconciler.sink().slots().is_empty());
        assert!(reconciler.assignment_handle().load().is_none());
    }

    #[tokio::test]
    async fn test_published_assignment_matches_snapshot() {
        let mut reconciler = Reconciler::new(config(1), MemorySink::new());
        reconciler.sync(&snapshot(&[1, 2, 3])).await.unwrap();

        let handle = reconciler.assignment_handle();
        let assignment = handle.load_full().expect("assignment published");
        assert_eq!(assignment.table_size(), 13);
        assert_eq!(
            assignment.backends(),
            &["backend-1", "backend-2", "backend-3"]
        );
    }

    #[tokio::test]
    async fn test_resync_from_sink_adopts_existing_slots() {
        let mut sink = MemorySink::new();
        sink.add(3).await.unwrap();
        sink.add(9).await.unwrap();
        sink.clear_ops();

        let mut reconciler = Reconciler::new(config(1), sink);
        reconciler.resync_from_sink().await.unwrap();
        let expected: BTreeSet<usize> = [3, 9].into_iter().collect();
        assert_eq!(reconciler.applied_slots(), &expected);

        // A snapshot without us must now remove exactly those two slots.
        reconciler.sync(&snapshot(&[2, 3])).await.unwrap();
        assert_eq!(
            reconciler.sink().ops(),
            &[SinkOp::Remove(3), SinkOp::Remove(9)]
        );
    }

    #[tokio::test]
    async fn test_watch_failure_surfaces_from_run() {
        let (tx, rx) = mpsc::channel(4);
        let mut reconciler = Reconciler::new(config(1), MemorySink::new());

        tx.send(WatchEvent::Snapshot(snapshot(&[1])))
            .await
            .unwrap();
        tx.send(WatchEvent::Failed(Error::Watch("connection lost".into())))
            .await
            .unwrap();

        let err = reconciler.run(rx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Watch);
        // The snapshot before the failure was still applied in order.
        assert!(!reconciler.applied_slots().is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel_is_clean_shutdown() {
        let (tx, rx) = mpsc::channel(4);
        let mut reconciler = Reconciler::new(config(1), MemorySink::new());
        tx.send(WatchEvent::Snapshot(snapshot(&[1]))).await.unwrap();
        drop(tx);

        reconciler.run(rx).await.unwrap();
        assert!(!reconciler.applied_slots().is_empty());
    }

    /// Sink that fails a configurable number of writes before recovering.
    #[derive(Default)]
    struct FlakySink {
        inner: MemorySink,
        failures_left: u32,
    }

    #[async_trait]
    impl VipSink for FlakySink {
        async fn add(&mut self, slot: usize) -> Result<(), Error> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(Error::SinkWrite(std::io::Error::from(
                    std::io::ErrorKind::PermissionDenied,
                )));
            }
            self.inner.add(slot).await
        }

        async fn remove(&mut self, slot: usize) -> Result<(), Error> {
            self.inner.remove(slot).await
        }

        async fn query(&mut self) -> Result<BTreeSet<usize>, Error> {
            self.inner.query().await
        }
    }

    #[tokio::test]
    async fn test_transient_sink_failures_are_retried() {
        let sink = FlakySink {
            inner: MemorySink::new(),
            failures_left: 2,
        };
        let mut reconciler = Reconciler::new(config(1), sink);
        reconciler.sync(&snapshot(&[1])).await.unwrap();
        assert!(!reconciler.sink().inner.slots().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_sink_failure_surfaces() {
        let sink = FlakySink {
            inner: MemorySink::new(),
            failures_left: u32::MAX,
        };
        let mut reconciler = Reconciler::new(config(1), sink);
        let err = reconciler.sync(&snapshot(&[1])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SinkWrite);
    }
}
