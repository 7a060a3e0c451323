//! The metadata authority: one owner for the whole tree.
//!
//! Every operation flows through one apply loop that owns the
//! `MetaTree`, so operations are applied strictly in submission order
//! and nothing else ever touches tree state. The replication monitor
//! and the periodic checkpoint run off the same timeline: the monitor
//! submits its check as an ordinary queued operation, and checkpoints
//! are written between operations by the apply task itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use nimbusfs_common::Properties;

use crate::checkpoint::CheckpointDir;
use crate::placement::ChunkPlacement;
use crate::replicator::{run_check, ChunkReplicator, RepairAction};
use crate::request::{
    request_channel, MetaOp, OpOutcome, OpResult, QueuedOp, RequestReceiver, RequestSender,
};
use crate::session::SessionRegistry;
use crate::tree::MetaTree;
use crate::types::MetaError;

/// Typed server settings, read off a properties table.
#[derive(Clone, Debug)]
pub struct MetaServerConfig {
    /// Directory checkpoints are written to.
    pub checkpoint_dir: PathBuf,
    /// How often the tree is checkpointed.
    pub checkpoint_interval: Duration,
    /// How often the replication monitor wakes.
    pub replication_check_interval: Duration,
    /// Replication factor for create requests that do not name one.
    pub default_num_replicas: i16,
}

impl Default for MetaServerConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("cp"),
            checkpoint_interval: Duration::from_secs(600),
            replication_check_interval: Duration::from_secs(60),
            default_num_replicas: 1,
        }
    }
}

impl MetaServerConfig {
    /// Reads settings from `props`, falling back to the defaults key by
    /// key.
    pub fn from_properties(props: &Properties) -> Self {
        MetaServerConfig {
            checkpoint_dir: PathBuf::from(props.get_str("metaServer.cpDir", "cp")),
            checkpoint_interval: Duration::from_secs(
                props.get_u64("metaServer.checkpointIntervalSecs", 600),
            ),
            replication_check_interval: Duration::from_secs(
                props.get_u64("metaServer.replicationCheckIntervalSecs", 60),
            ),
            default_num_replicas: props
                .get_i32("metaServer.numReplicasPerFile", 1)
                .clamp(1, i16::MAX as i32) as i16,
        }
    }
}

/// Owns the tree plus the surrounding server state and applies queued
/// operations to it.
pub struct MetaAuthority {
    tree: MetaTree,
    checkpoint: CheckpointDir,
    sessions: Arc<SessionRegistry>,
    placement: Arc<ChunkPlacement>,
    repairs: Vec<RepairAction>,
    default_num_replicas: i16,
}

impl MetaAuthority {
    /// Builds the authority: recovers from the checkpoint directory if a
    /// checkpoint exists there, otherwise bootstraps a fresh root.
    pub fn new(config: &MetaServerConfig) -> Result<Self, MetaError> {
        let checkpoint = CheckpointDir::new(&config.checkpoint_dir);
        let tree = if checkpoint.has_checkpoint() {
            let mut tree = checkpoint.load()?;
            // Chunk versions issued before the restart must never be
            // reissued.
            tree.bump_version_inc();
            info!(
                entities = tree.store().len(),
                generation = tree.generation(),
                "recovered from checkpoint"
            );
            tree
        } else {
            info!("no checkpoint found, starting with an empty tree");
            MetaTree::new()
        };
        Ok(MetaAuthority {
            tree,
            checkpoint,
            sessions: Arc::new(SessionRegistry::new()),
            placement: Arc::new(ChunkPlacement::new()),
            repairs: Vec::new(),
            default_num_replicas: config.default_num_replicas,
        })
    }

    /// The tree, read-only.
    pub fn tree(&self) -> &MetaTree {
        &self.tree
    }

    /// Shared session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Shared replica placement view.
    pub fn placement(&self) -> &Arc<ChunkPlacement> {
        &self.placement
    }

    /// Applies one operation and returns its outcome.
    pub fn apply(&mut self, op: MetaOp) -> OpOutcome {
        match op {
            MetaOp::Create {
                dir,
                name,
                num_replicas,
            } => {
                let want = if num_replicas > 0 {
                    num_replicas
                } else {
                    self.default_num_replicas
                };
                self.tree.create(dir, &name, want).map(OpResult::Created)
            }
            MetaOp::Mkdir { dir, name } => self.tree.mkdir(dir, &name).map(OpResult::Created),
            MetaOp::Lookup { dir, name } => self
                .tree
                .lookup(dir, &name)
                .map(|entry| OpResult::Found(entry.clone())),
            MetaOp::Readdir { dir } => self.tree.readdir(dir).map(|entries| {
                OpResult::Listing(entries.into_iter().cloned().collect())
            }),
            MetaOp::Getattr { fid } => self
                .tree
                .getattr(fid)
                .map(|attr| OpResult::Attr(attr.clone())),
            MetaOp::Remove { dir, name } => {
                let freed = self.tree.remove(dir, &name)?;
                for chunk in &freed {
                    self.placement.drop_chunk(*chunk);
                }
                Ok(OpResult::Removed { freed })
            }
            MetaOp::Rmdir { dir, name } => {
                self.tree.rmdir(dir, &name)?;
                Ok(OpResult::DirRemoved)
            }
            MetaOp::Rename {
                src_dir,
                src_name,
                dst_dir,
                dst_name,
            } => {
                self.tree.rename(src_dir, &src_name, dst_dir, &dst_name)?;
                Ok(OpResult::Renamed)
            }
            MetaOp::AllocateChunk { file, offset } => self
                .tree
                .allocate_chunk(file, offset)
                .map(OpResult::Allocated),
            MetaOp::Truncate { file, offset } => {
                let freed = self.tree.truncate(file, offset)?;
                for chunk in &freed {
                    self.placement.drop_chunk(*chunk);
                }
                Ok(OpResult::Truncated { freed })
            }
            MetaOp::SetReplication { file, num_replicas } => {
                self.tree.set_replication(file, num_replicas)?;
                Ok(OpResult::ReplicationSet)
            }
            MetaOp::ReplicationCheck => {
                let report = run_check(&self.tree, &self.placement);
                self.repairs.extend(report.actions.iter().copied());
                Ok(OpResult::CheckDone(report))
            }
        }
    }

    /// Takes every repair collected by replication checks since the last
    /// drain. The layout layer turns these into copy and delete work for
    /// the data servers.
    pub fn drain_repairs(&mut self) -> Vec<RepairAction> {
        std::mem::take(&mut self.repairs)
    }

    /// Writes a checkpoint of the current tree.
    pub fn save_checkpoint(&mut self) -> Result<usize, MetaError> {
        self.checkpoint.save(&mut self.tree)
    }

    fn handle(&mut self, queued: QueuedOp) {
        let seq = queued.seq;
        debug!(seq, op = ?queued.op, "applying");
        let outcome = self.apply(queued.op);
        if let Err(err) = &outcome {
            debug!(seq, %err, "operation failed");
        }
        if queued.done.send(outcome).is_err() {
            debug!(seq, "submitter gone before completion");
        }
    }
}

/// Running server: the queue handle plus the background tasks.
pub struct AuthorityHandle {
    requests: RequestSender,
    sessions: Arc<SessionRegistry>,
    placement: Arc<ChunkPlacement>,
    stop: watch::Sender<bool>,
    apply_task: JoinHandle<()>,
    replicator_task: JoinHandle<()>,
}

impl AuthorityHandle {
    /// A fresh handle onto the submission queue.
    pub fn requests(&self) -> RequestSender {
        self.requests.clone()
    }

    /// Shared session registry.
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    /// Shared replica placement view.
    pub fn placement(&self) -> Arc<ChunkPlacement> {
        self.placement.clone()
    }

    /// Submits one operation and waits for its completion.
    pub async fn submit(&self, seq: u64, op: MetaOp) -> OpOutcome {
        let (queued, rx) = QueuedOp::new(seq, op);
        self.requests
            .send(queued)
            .map_err(|_| MetaError::Shutdown)?;
        rx.await.map_err(|_| MetaError::Shutdown)?
    }

    /// Stops the monitor, drains the queue, writes the final checkpoint
    /// and waits for both tasks to finish.
    ///
    /// Completion requires every outstanding `RequestSender` clone to be
    /// dropped; the queue only closes once the last one goes.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        drop(self.requests);
        if let Err(err) = self.replicator_task.await {
            error!(%err, "replication monitor task failed");
        }
        if let Err(err) = self.apply_task.await {
            error!(%err, "apply loop task failed");
        }
    }
}

/// Starts the authority: builds (or recovers) the tree, then wires the
/// apply loop and the replication monitor.
pub fn spawn(config: &MetaServerConfig) -> Result<AuthorityHandle, MetaError> {
    let authority = MetaAuthority::new(config)?;
    let sessions = authority.sessions().clone();
    let placement = authority.placement().clone();

    let (tx, rx) = request_channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    let replicator = ChunkReplicator::new(tx.clone());
    let replicator_task = tokio::spawn(replicator.run(config.replication_check_interval, stop_rx));
    let apply_task = tokio::spawn(apply_loop(authority, rx, config.checkpoint_interval));

    Ok(AuthorityHandle {
        requests: tx,
        sessions,
        placement,
        stop: stop_tx,
        apply_task,
        replicator_task,
    })
}

async fn apply_loop(
    mut authority: MetaAuthority,
    mut requests: RequestReceiver,
    checkpoint_every: Duration,
) {
    let mut ticker = tokio::time::interval(checkpoint_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Swallow the immediate first tick; the tree was just loaded or
    // checkpointed.
    ticker.tick().await;

    loop {
        tokio::select! {
            queued = requests.recv() => match queued {
                Some(queued) => authority.handle(queued),
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(err) = authority.save_checkpoint() {
                    error!(%err, "periodic checkpoint failed");
                }
            }
        }
    }

    match authority.save_checkpoint() {
        Ok(entities) => info!(entities, "final checkpoint written"),
        Err(err) => error!(%err, "final checkpoint failed"),
    }
}
