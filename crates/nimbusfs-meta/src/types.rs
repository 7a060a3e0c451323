use serde::{Deserialize, Serialize};
use std::fmt;

use crate::node::Key;

/// Identifier of a file or directory in the metadata tree.
///
/// File ids are signed so they share a comparison domain with the key
/// wildcard [`Key::MATCH_ANY`](crate::node::Key::MATCH_ANY); every id
/// handed out by the generator is positive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(i64);

impl FileId {
    /// The root directory id (always 1).
    pub const ROOT: FileId = FileId(1);

    /// Creates a new FileId from a raw i64 value
    pub fn new(id: i64) -> Self {
        FileId(id)
    }

    /// Returns the raw i64 value of this file ID
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a chunk. Chunk ids come from their own generator and
/// never collide with file ids by construction, not by namespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(i64);

impl ChunkId {
    /// Creates a new ChunkId from a raw i64 value
    pub fn new(id: i64) -> Self {
        ChunkId(id)
    }

    /// Returns the raw i64 value of this chunk ID
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a chunk server known to the authority.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(u64);

impl ServerId {
    /// Creates a new ServerId from a raw u64 value
    pub fn new(id: u64) -> Self {
        ServerId(id)
    }

    /// Returns the raw u64 value of this server ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version number of a chunk. Replicas carrying an older version than the
/// authoritative one are stale and must not serve reads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkVersion(i64);

impl ChunkVersion {
    /// The version assigned to a freshly allocated chunk.
    pub const INITIAL: ChunkVersion = ChunkVersion(1);

    /// Creates a new ChunkVersion from a raw i64 value
    pub fn new(v: i64) -> Self {
        ChunkVersion(v)
    }

    /// Returns the raw i64 value of this version
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns this version advanced by `inc`.
    pub fn bumped(self, inc: i64) -> Self {
        ChunkVersion(self.0 + inc)
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before epoch");
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The two kinds of namespace object the tree stores.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file backed by chunks
    File,
    /// Directory
    Directory,
}

impl FileType {
    /// Token used for this type in checkpoint lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Directory => "dir",
        }
    }

    /// Parses a checkpoint token back into a file type.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "file" => Some(FileType::File),
            "dir" => Some(FileType::Directory),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for metadata operations.
///
/// Absence (`NotFound`, `EntryNotFound`) and collision (`DuplicateKey`,
/// `EntryExists`) are ordinary recoverable outcomes callers branch on.
/// I/O failures are surfaced to the caller untouched. Violations of
/// internal invariants are not represented here at all; those panic.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// No node is stored under the given key.
    #[error("no metadata under key {0}")]
    NotFound(Key),

    /// A node is already stored under the given key.
    #[error("duplicate metadata key {0}")]
    DuplicateKey(Key),

    /// A directory entry with the given name was not found.
    #[error("entry '{name}' not found in directory {dir}")]
    EntryNotFound {
        /// Parent directory id
        dir: FileId,
        /// Entry name that was not found
        name: String,
    },

    /// A directory entry with the given name already exists.
    #[error("entry '{name}' already exists in directory {dir}")]
    EntryExists {
        /// Parent directory id
        dir: FileId,
        /// Existing entry name
        name: String,
    },

    /// The entry name is empty, contains a separator or control
    /// character, or is a resolution token.
    #[error("invalid entry name '{0}'")]
    InvalidName(String),

    /// A chunk offset outside the file's addressable range.
    #[error("invalid chunk offset {0}")]
    InvalidOffset(i64),

    /// The specified id is not a directory when a directory was required.
    #[error("file {0} is not a directory")]
    NotADirectory(FileId),

    /// The specified id is a directory where a plain file was required.
    #[error("file {0} is a directory")]
    IsADirectory(FileId),

    /// Attempted to delete a non-empty directory.
    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(FileId),

    /// Attempted to move a directory underneath itself.
    #[error("directory {0} cannot be moved into its own subtree")]
    MoveIntoSubtree(FileId),

    /// A checkpoint line could not be decoded.
    #[error("checkpoint line {line}: {reason}")]
    BadCheckpoint {
        /// One-based line number within the checkpoint file
        line: usize,
        /// What was wrong with the line
        reason: String,
    },

    /// The authority stopped accepting work.
    #[error("metadata authority is shutting down")]
    Shutdown,

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
