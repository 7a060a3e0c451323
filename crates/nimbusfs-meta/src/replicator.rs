//! Replication monitor.
//!
//! A periodic control loop, decoupled from request handling, that sweeps
//! chunk metadata for under-replicated or stale chunks. The monitor owns
//! nothing but a two-state machine: a timer tick while idle submits one
//! check through the shared request queue, a tick while a check is out
//! is dropped, and the check's completion re-arms it. At most one check
//! is ever outstanding, so a slow sweep never piles more sweeps behind
//! itself.
//!
//! The sweep runs inside the apply loop like any other operation and
//! therefore sees the tree at a single point in the operation order.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::node::NodeKind;
use crate::placement::ChunkPlacement;
use crate::request::{MetaOp, OpOutcome, OpResult, QueuedOp, RequestSender};
use crate::tree::MetaTree;
use crate::types::{ChunkId, ChunkVersion, FileId, ServerId};

/// Monitor liveness states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplicatorState {
    /// No check outstanding; the next timer tick starts one.
    Idle,
    /// A check has been submitted and has not yet completed.
    CheckInProgress,
}

/// One corrective step the sweep asks the layout layer to perform.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairAction {
    /// Schedule additional copies of `chunk` until `want` are live.
    Replicate {
        /// Chunk needing more copies.
        chunk: ChunkId,
        /// File the chunk belongs to.
        file: FileId,
        /// Fresh replicas currently known.
        have: usize,
        /// Replicas the file wants.
        want: usize,
    },
    /// Tell `server` to discard its out-of-date copy of `chunk`.
    InvalidateStale {
        /// Chunk with a stale copy.
        chunk: ChunkId,
        /// Server holding the stale copy.
        server: ServerId,
        /// Version the server reported.
        version: ChunkVersion,
    },
}

/// Summary of one replication sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReport {
    /// Chunks examined.
    pub checked: usize,
    /// Stale replicas found.
    pub stale: usize,
    /// Chunks with fewer fresh replicas than their file wants.
    pub under_replicated: usize,
    /// Corrective actions in tree key order.
    pub actions: Vec<RepairAction>,
}

/// Drives periodic replication checks through the submission queue.
pub struct ChunkReplicator {
    state: ReplicatorState,
    next_seq: u64,
    submit: RequestSender,
}

impl ChunkReplicator {
    /// Creates an idle monitor submitting on `submit`.
    pub fn new(submit: RequestSender) -> Self {
        ChunkReplicator {
            state: ReplicatorState::Idle,
            next_seq: 1,
            submit,
        }
    }

    /// Current liveness state.
    pub fn state(&self) -> ReplicatorState {
        self.state
    }

    /// Handles a timer tick.
    ///
    /// Idle: submits one check carrying a fresh sequence number and
    /// returns the receiver its completion arrives on. Busy: drops the
    /// tick and returns None.
    pub fn handle_timer(&mut self) -> Option<oneshot::Receiver<OpOutcome>> {
        if self.state == ReplicatorState::CheckInProgress {
            debug!("replication check still running, dropping tick");
            return None;
        }
        let seq = self.next_seq;
        let (op, rx) = QueuedOp::new(seq, MetaOp::ReplicationCheck);
        if self.submit.send(op).is_err() {
            // Apply loop is gone; stay idle and let shutdown unwind.
            error!(seq, "replication check submission failed");
            return None;
        }
        self.next_seq += 1;
        self.state = ReplicatorState::CheckInProgress;
        debug!(seq, "submitted replication check");
        Some(rx)
    }

    /// Handles completion of the outstanding check.
    ///
    /// The check's own outcome is logged and otherwise ignored; only the
    /// fact that it finished matters here. A completion with no check
    /// outstanding means the machine lost track of itself.
    pub fn handle_completion(&mut self, outcome: OpOutcome) {
        assert_eq!(
            self.state,
            ReplicatorState::CheckInProgress,
            "replication check completed while idle"
        );
        self.state = ReplicatorState::Idle;
        match outcome {
            Ok(OpResult::CheckDone(report)) => info!(
                checked = report.checked,
                stale = report.stale,
                under_replicated = report.under_replicated,
                actions = report.actions.len(),
                "replication check finished"
            ),
            Ok(_) => {}
            Err(err) => error!(%err, "replication check failed"),
        }
    }

    /// Runs the monitor: ticks every `interval`, feeds its own
    /// completions back into the machine, exits when `stop` fires or the
    /// submission queue goes away.
    pub async fn run(mut self, interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first interval tick fires immediately; swallow it so the
        // first check runs one full interval after startup.
        ticker.tick().await;

        let mut pending: Option<oneshot::Receiver<OpOutcome>> = None;
        loop {
            match pending.take() {
                None => {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if self.submit.is_closed() {
                                break;
                            }
                            pending = self.handle_timer();
                        }
                        _ = stop.changed() => break,
                    }
                }
                Some(mut rx) => {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let extra = self.handle_timer();
                            debug_assert!(extra.is_none());
                            pending = Some(rx);
                        }
                        outcome = &mut rx => {
                            match outcome {
                                Ok(outcome) => self.handle_completion(outcome),
                                // The queued check was dropped without a
                                // completion: the apply loop is shutting
                                // down.
                                Err(_) => break,
                            }
                        }
                        _ = stop.changed() => break,
                    }
                }
            }
        }
        info!("replication monitor stopped");
    }
}

/// Sweeps every chunk in the tree, comparing observed replicas against
/// the owning file's desired factor.
///
/// Replicas reporting a version older than the chunk's current one are
/// stale: they are scheduled for invalidation and do not count toward
/// the replica total. A chunk whose owning file attribute is missing
/// means the tree has lost its referential invariant, and there is
/// nothing sane left to repair.
pub fn run_check(tree: &MetaTree, placement: &ChunkPlacement) -> ReplicationReport {
    let mut report = ReplicationReport::default();
    for node in tree.store().iter_kind(NodeKind::ChunkInfo) {
        let chunk = node.as_chunk_info();
        report.checked += 1;
        let owner = match tree.getattr(chunk.file) {
            Ok(attr) => attr,
            Err(_) => panic!(
                "chunk {} owned by missing file {}",
                chunk.chunk_id, chunk.file
            ),
        };

        let mut fresh = 0usize;
        for replica in placement.replicas(chunk.chunk_id) {
            if replica.version < chunk.version {
                report.stale += 1;
                report.actions.push(RepairAction::InvalidateStale {
                    chunk: chunk.chunk_id,
                    server: replica.server,
                    version: replica.version,
                });
            } else {
                fresh += 1;
            }
        }

        let want = owner.num_replicas.max(0) as usize;
        if fresh < want {
            report.under_replicated += 1;
            report.actions.push(RepairAction::Replicate {
                chunk: chunk.chunk_id,
                file: chunk.file,
                have: fresh,
                want,
            });
        }
    }
    debug!(
        checked = report.checked,
        stale = report.stale,
        under_replicated = report.under_replicated,
        "replication sweep complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{request_channel, RequestReceiver};

    fn drain_one(rx: &mut RequestReceiver) -> QueuedOp {
        rx.try_recv().unwrap()
    }

    #[test]
    fn test_starts_idle() {
        let (tx, _rx) = request_channel();
        let replicator = ChunkReplicator::new(tx);
        assert_eq!(replicator.state(), ReplicatorState::Idle);
    }

    #[test]
    fn test_timer_while_idle_submits_one_check() {
        let (tx, mut rx) = request_channel();
        let mut replicator = ChunkReplicator::new(tx);

        let pending = replicator.handle_timer();
        assert!(pending.is_some());
        assert_eq!(replicator.state(), ReplicatorState::CheckInProgress);

        let queued = drain_one(&mut rx);
        assert_eq!(queued.seq, 1);
        assert_eq!(queued.op, MetaOp::ReplicationCheck);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_timer_while_busy_is_noop() {
        let (tx, mut rx) = request_channel();
        let mut replicator = ChunkReplicator::new(tx);

        let first = replicator.handle_timer();
        assert!(first.is_some());
        for _ in 0..5 {
            assert!(replicator.handle_timer().is_none());
        }
        assert_eq!(replicator.state(), ReplicatorState::CheckInProgress);

        // Exactly one submission made it through.
        drain_one(&mut rx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_completion_rearms_regardless_of_outcome() {
        let (tx, mut rx) = request_channel();
        let mut replicator = ChunkReplicator::new(tx);

        replicator.handle_timer();
        drain_one(&mut rx);
        replicator.handle_completion(Ok(OpResult::CheckDone(ReplicationReport::default())));
        assert_eq!(replicator.state(), ReplicatorState::Idle);

        replicator.handle_timer();
        drain_one(&mut rx);
        replicator.handle_completion(Err(crate::types::MetaError::NotADirectory(FileId::ROOT)));
        assert_eq!(replicator.state(), ReplicatorState::Idle);
    }

    #[test]
    fn test_sequence_numbers_increase_across_checks() {
        let (tx, mut rx) = request_channel();
        let mut replicator = ChunkReplicator::new(tx);

        for expected in 1..=3u64 {
            replicator.handle_timer();
            let queued = drain_one(&mut rx);
            assert_eq!(queued.seq, expected);
            replicator.handle_completion(Ok(OpResult::CheckDone(ReplicationReport::default())));
        }
    }

    #[test]
    #[should_panic(expected = "replication check completed while idle")]
    fn test_completion_while_idle_panics() {
        let (tx, _rx) = request_channel();
        let mut replicator = ChunkReplicator::new(tx);
        replicator.handle_completion(Ok(OpResult::CheckDone(ReplicationReport::default())));
    }

    #[test]
    fn test_timer_outpacing_completion_never_doubles_up() {
        let (tx, mut rx) = request_channel();
        let mut replicator = ChunkReplicator::new(tx);

        // Five ticks, one completion in the middle: two submissions.
        replicator.handle_timer();
        replicator.handle_timer();
        replicator.handle_timer();
        replicator.handle_completion(Ok(OpResult::CheckDone(ReplicationReport::default())));
        replicator.handle_timer();
        replicator.handle_timer();

        assert_eq!(drain_one(&mut rx).seq, 1);
        assert_eq!(drain_one(&mut rx).seq, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_spaces_checks_by_completion() {
        let (tx, mut rx) = request_channel();
        let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let replicator = ChunkReplicator::new(tx);
        let handle = tokio::spawn(replicator.run(Duration::from_secs(60), stop_rx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);

        // Several intervals elapse with the check still outstanding.
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(rx.try_recv().is_err());

        // Completion re-arms the monitor; the next tick submits again.
        first
            .done
            .send(Ok(OpResult::CheckDone(ReplicationReport::default())))
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 2);

        // Dropping the queue ends the monitor.
        drop(second);
        drop(rx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_stops_on_signal() {
        let (tx, mut rx) = request_channel();
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let replicator = ChunkReplicator::new(tx);
        let handle = tokio::spawn(replicator.run(Duration::from_secs(60), stop_rx));

        // One check goes out and stays outstanding.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    mod sweep {
        use super::*;

        fn tree_with_file(num_replicas: i16) -> (MetaTree, FileId, ChunkId) {
            let mut tree = MetaTree::new();
            let file = tree.create(FileId::ROOT, "data", num_replicas).unwrap();
            let info = tree.allocate_chunk(file, 0).unwrap();
            (tree, file, info.chunk_id)
        }

        #[test]
        fn test_empty_tree_reports_nothing() {
            let tree = MetaTree::new();
            let placement = ChunkPlacement::new();
            let report = run_check(&tree, &placement);
            assert_eq!(report, ReplicationReport::default());
        }

        #[test]
        fn test_fully_replicated_chunk_needs_no_repair() {
            let (tree, _file, chunk) = tree_with_file(2);
            let placement = ChunkPlacement::new();
            placement.record_replica(chunk, ServerId::new(1), ChunkVersion::INITIAL);
            placement.record_replica(chunk, ServerId::new(2), ChunkVersion::INITIAL);

            let report = run_check(&tree, &placement);
            assert_eq!(report.checked, 1);
            assert_eq!(report.under_replicated, 0);
            assert!(report.actions.is_empty());
        }

        #[test]
        fn test_under_replicated_chunk_requests_copies() {
            let (tree, file, chunk) = tree_with_file(3);
            let placement = ChunkPlacement::new();
            placement.record_replica(chunk, ServerId::new(1), ChunkVersion::INITIAL);

            let report = run_check(&tree, &placement);
            assert_eq!(report.under_replicated, 1);
            assert_eq!(
                report.actions,
                vec![RepairAction::Replicate {
                    chunk,
                    file,
                    have: 1,
                    want: 3,
                }]
            );
        }

        #[test]
        fn test_stale_replica_invalidated_and_not_counted() {
            let (mut tree, file, chunk) = tree_with_file(2);
            // Re-allocating the same offset bumps the version; the copy
            // written under the old version is now stale.
            let bumped = tree.allocate_chunk(file, 0).unwrap();
            assert!(bumped.version > ChunkVersion::INITIAL);

            let placement = ChunkPlacement::new();
            placement.record_replica(chunk, ServerId::new(1), ChunkVersion::INITIAL);
            placement.record_replica(chunk, ServerId::new(2), bumped.version);

            let report = run_check(&tree, &placement);
            assert_eq!(report.stale, 1);
            assert_eq!(report.under_replicated, 1);
            assert_eq!(
                report.actions,
                vec![
                    RepairAction::InvalidateStale {
                        chunk,
                        server: ServerId::new(1),
                        version: ChunkVersion::INITIAL,
                    },
                    RepairAction::Replicate {
                        chunk,
                        file,
                        have: 1,
                        want: 2,
                    },
                ]
            );
        }

        #[test]
        fn test_sweep_walks_chunks_in_key_order() {
            let mut tree = MetaTree::new();
            let first = tree.create(FileId::ROOT, "first", 1).unwrap();
            let second = tree.create(FileId::ROOT, "second", 1).unwrap();
            let c_second = tree.allocate_chunk(second, 0).unwrap();
            let c_first = tree.allocate_chunk(first, 0).unwrap();
            let placement = ChunkPlacement::new();

            let report = run_check(&tree, &placement);
            assert_eq!(report.checked, 2);
            // Key order is file-id order, not allocation order.
            assert_eq!(
                report.actions,
                vec![
                    RepairAction::Replicate {
                        chunk: c_first.chunk_id,
                        file: first,
                        have: 0,
                        want: 1,
                    },
                    RepairAction::Replicate {
                        chunk: c_second.chunk_id,
                        file: second,
                        have: 0,
                        want: 1,
                    },
                ]
            );
        }

        #[test]
        #[should_panic(expected = "owned by missing file")]
        fn test_orphaned_chunk_is_fatal() {
            use crate::node::{ChunkInfo, MetaNode, NodeBody};

            let mut tree = MetaTree::new();
            let orphan = ChunkInfo {
                file: FileId::new(99),
                offset: 0,
                chunk_id: ChunkId::new(7),
                version: ChunkVersion::INITIAL,
            };
            tree.store_mut()
                .insert(MetaNode::new(NodeBody::ChunkInfo(orphan)))
                .unwrap();

            run_check(&tree, &ChunkPlacement::new());
        }
    }
}
