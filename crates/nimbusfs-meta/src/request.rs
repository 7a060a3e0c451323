//! Request submission path.
//!
//! Every operation against the tree, client-issued or internal, travels
//! through one queue into the apply loop. Submission order is
//! application order, and each operation's completion comes back on its
//! own channel whether it succeeded or failed.

use tokio::sync::{mpsc, oneshot};

use crate::node::{ChunkInfo, DirEntry, FileAttr};
use crate::replicator::ReplicationReport;
use crate::types::{ChunkId, FileId, MetaError};

/// A parsed metadata operation.
#[derive(Clone, Debug, PartialEq)]
pub enum MetaOp {
    /// Create a file named `name` under `dir`.
    Create {
        /// Parent directory.
        dir: FileId,
        /// New entry name.
        name: String,
        /// Desired copies of each chunk.
        num_replicas: i16,
    },
    /// Create a directory named `name` under `dir`.
    Mkdir {
        /// Parent directory.
        dir: FileId,
        /// New directory name.
        name: String,
    },
    /// Resolve one name in a directory.
    Lookup {
        /// Directory to search.
        dir: FileId,
        /// Name to resolve.
        name: String,
    },
    /// List a directory in key order.
    Readdir {
        /// Directory to list.
        dir: FileId,
    },
    /// Fetch attributes of a file or directory.
    Getattr {
        /// Target id.
        fid: FileId,
    },
    /// Unlink a file and free its chunks.
    Remove {
        /// Parent directory.
        dir: FileId,
        /// Entry name to unlink.
        name: String,
    },
    /// Remove an empty directory.
    Rmdir {
        /// Parent directory.
        dir: FileId,
        /// Directory name to remove.
        name: String,
    },
    /// Move or rename an entry.
    Rename {
        /// Current parent directory.
        src_dir: FileId,
        /// Current name.
        src_name: String,
        /// New parent directory.
        dst_dir: FileId,
        /// New name.
        dst_name: String,
    },
    /// Allocate, or re-version after a failed allocation, the chunk at
    /// `offset` of `file`.
    AllocateChunk {
        /// Owning file.
        file: FileId,
        /// Chunk starting offset within the file.
        offset: i64,
    },
    /// Drop every chunk at or past `offset`.
    Truncate {
        /// Target file.
        file: FileId,
        /// Cut point in bytes.
        offset: i64,
    },
    /// Change a file's desired replication factor.
    SetReplication {
        /// Target file.
        file: FileId,
        /// New desired copies per chunk.
        num_replicas: i16,
    },
    /// Internal: sweep chunk metadata for replication repairs.
    ReplicationCheck,
}

/// Successful payload of an applied operation.
#[derive(Clone, Debug, PartialEq)]
pub enum OpResult {
    /// Id of a newly created file or directory.
    Created(FileId),
    /// Resolved directory entry.
    Found(DirEntry),
    /// Directory listing in key order.
    Listing(Vec<DirEntry>),
    /// Attributes of a file or directory.
    Attr(FileAttr),
    /// File unlinked; these chunk ids are now free.
    Removed {
        /// Chunk ids released by the unlink.
        freed: Vec<ChunkId>,
    },
    /// Directory removed.
    DirRemoved,
    /// Entry moved to its new name.
    Renamed,
    /// Chunk allocated or re-versioned.
    Allocated(ChunkInfo),
    /// File truncated; these chunk ids are now free.
    Truncated {
        /// Chunk ids released by the cut.
        freed: Vec<ChunkId>,
    },
    /// Replication factor updated.
    ReplicationSet,
    /// Outcome of an internal replication check.
    CheckDone(ReplicationReport),
}

/// What the submitter gets back: the op's payload or its error.
pub type OpOutcome = Result<OpResult, MetaError>;

/// An operation queued for the apply loop, tagged with its sequence
/// number and carrying the channel its completion goes out on.
#[derive(Debug)]
pub struct QueuedOp {
    /// Submitter-assigned sequence number, for logging and tracing.
    pub seq: u64,
    /// The operation to apply.
    pub op: MetaOp,
    /// Completion channel; fired exactly once per queued op.
    pub done: oneshot::Sender<OpOutcome>,
}

impl QueuedOp {
    /// Builds a queued op plus the receiver its completion arrives on.
    pub fn new(seq: u64, op: MetaOp) -> (Self, oneshot::Receiver<OpOutcome>) {
        let (done, rx) = oneshot::channel();
        (QueuedOp { seq, op, done }, rx)
    }
}

/// Submitting half of the request queue.
pub type RequestSender = mpsc::UnboundedSender<QueuedOp>;

/// Consuming half of the request queue, owned by the apply loop.
pub type RequestReceiver = mpsc::UnboundedReceiver<QueuedOp>;

/// Creates the request queue both halves hang off of.
pub fn request_channel() -> (RequestSender, RequestReceiver) {
    mpsc::unbounded_channel()
}
