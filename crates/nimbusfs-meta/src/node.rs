//! Metadata entities and their composite keys.
//!
//! Everything the authority knows about the namespace is one of three
//! entity payloads: a file attribute record, a directory entry, or a
//! chunk descriptor. Each entity derives a composite [`Key`] of
//! `(kind, primary, secondary)` whose total order groups records the way
//! scans want them: all attributes by id, all entries of one directory
//! together, all chunks of one file in offset order.
//!
//! Entities also render to and parse from single checkpoint lines; the
//! line format is the on-disk contract of [`checkpoint`](crate::checkpoint).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ChunkId, ChunkVersion, FileId, FileType, Timestamp};

/// Discriminates the kinds of metadata node.
///
/// The variant order is load-bearing: it is the major component of the
/// key order, so all file attributes sort before all directory entries,
/// which sort before all chunk descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    /// Sentinel for a node that carries no payload yet
    Uninit,
    /// File or directory attributes
    FileAttr,
    /// Directory entry
    DirEntry,
    /// Chunk descriptor
    ChunkInfo,
}

impl NodeKind {
    /// Token used for this kind in checkpoint lines and key displays.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Uninit => "uninit",
            NodeKind::FileAttr => "fattr",
            NodeKind::DirEntry => "dentry",
            NodeKind::ChunkInfo => "chunkinfo",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite search key: kind, then primary id, then secondary id.
///
/// Comparison is lexicographic across the three fields, which gives the
/// store one total order for every kind of entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    /// Kind of the keyed entity
    pub kind: NodeKind,
    /// Owning id: file id for attributes and chunks, directory id for entries
    pub primary: i64,
    /// Disambiguator within the group: entry id, chunk offset, or zero
    pub secondary: i64,
}

impl Key {
    /// Wildcard secondary. Sorts before every valid id and offset, so a
    /// range scan started at the wildcard covers the whole
    /// `(kind, primary)` group. Never stored in the tree.
    pub const MATCH_ANY: i64 = -1;

    /// Creates a fully specified key.
    pub fn new(kind: NodeKind, primary: i64, secondary: i64) -> Self {
        Key {
            kind,
            primary,
            secondary,
        }
    }

    /// Creates the lowest key of a `(kind, primary)` group, for starting
    /// range scans.
    pub fn group(kind: NodeKind, primary: i64) -> Self {
        Key {
            kind,
            primary,
            secondary: Key::MATCH_ANY,
        }
    }
}

impl Default for Key {
    fn default() -> Self {
        Key::new(NodeKind::Uninit, 0, 0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.primary, self.secondary)
    }
}

/// Lifecycle flags carried by every stored node.
///
/// These never reach the checkpoint file; they track where a node stands
/// relative to the checkpoint cycle that is running right now.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Parity of the checkpoint generation that last wrote this node
    pub cp_parity: bool,
    /// Created after the last completed checkpoint
    pub new_since_cp: bool,
    /// This is the root directory's attribute node
    pub is_root: bool,
    /// Directory that has never held a subdirectory
    pub leaf_parent: bool,
    /// Exclude this node from the checkpoint being written
    pub skip_cp: bool,
}

impl NodeFlags {
    /// Flags for a node created by a live operation.
    pub fn fresh() -> Self {
        NodeFlags {
            new_since_cp: true,
            ..NodeFlags::default()
        }
    }
}

/// File or directory attributes. Plays the role of an inode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Id of the file or directory
    pub id: FileId,
    /// File or directory
    pub file_type: FileType,
    /// Number of constituent chunks
    pub chunk_count: i64,
    /// Desired number of replicas for each chunk
    pub num_replicas: i16,
    /// Modification time
    pub mtime: Timestamp,
    /// Attribute change time
    pub ctime: Timestamp,
    /// Creation time
    pub crtime: Timestamp,
}

impl FileAttr {
    /// Creates attributes for a brand-new file or directory; all three
    /// times start at now.
    pub fn new(file_type: FileType, id: FileId, num_replicas: i16) -> Self {
        let now = Timestamp::now();
        FileAttr {
            id,
            file_type,
            chunk_count: 0,
            num_replicas,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }

    /// The key this record is stored under.
    pub fn key(&self) -> Key {
        Key::new(NodeKind::FileAttr, self.id.as_i64(), 0)
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// Directory entry, mapping a name within a directory to a file id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Id of the parent directory
    pub dir: FileId,
    /// Name of this entry
    pub name: String,
    /// Id the name resolves to
    pub id: FileId,
}

impl DirEntry {
    /// Creates an entry binding `name` under `dir` to `id`.
    pub fn new(dir: FileId, name: impl Into<String>, id: FileId) -> Self {
        DirEntry {
            dir,
            name: name.into(),
            id,
        }
    }

    /// The key this record is stored under. Entries of one directory
    /// share the primary and are told apart by their target id.
    pub fn key(&self) -> Key {
        Key::new(NodeKind::DirEntry, self.dir.as_i64(), self.id.as_i64())
    }
}

/// Chunk descriptor for one chunk-sized extent of a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Id of the owning file
    pub file: FileId,
    /// Byte offset of the chunk within the file
    pub offset: i64,
    /// Globally unique chunk id
    pub chunk_id: ChunkId,
    /// Authoritative version; replicas below it are stale
    pub version: ChunkVersion,
}

impl ChunkInfo {
    /// Creates a descriptor for a chunk at `offset` of `file`.
    pub fn new(file: FileId, offset: i64, chunk_id: ChunkId, version: ChunkVersion) -> Self {
        ChunkInfo {
            file,
            offset,
            chunk_id,
            version,
        }
    }

    /// The key this record is stored under: chunks of one file sort by
    /// offset.
    pub fn key(&self) -> Key {
        Key::new(NodeKind::ChunkInfo, self.file.as_i64(), self.offset)
    }
}

/// The payload of a stored node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeBody {
    /// No payload
    Uninit,
    /// File or directory attributes
    FileAttr(FileAttr),
    /// Directory entry
    DirEntry(DirEntry),
    /// Chunk descriptor
    ChunkInfo(ChunkInfo),
}

/// A stored metadata node: lifecycle flags plus one entity payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaNode {
    /// Checkpoint lifecycle flags
    pub flags: NodeFlags,
    /// The entity payload
    pub body: NodeBody,
}

impl MetaNode {
    /// Wraps a payload with the flags of a freshly created node.
    pub fn new(body: NodeBody) -> Self {
        MetaNode {
            flags: NodeFlags::fresh(),
            body,
        }
    }

    /// Kind of the payload.
    pub fn kind(&self) -> NodeKind {
        match &self.body {
            NodeBody::Uninit => NodeKind::Uninit,
            NodeBody::FileAttr(_) => NodeKind::FileAttr,
            NodeBody::DirEntry(_) => NodeKind::DirEntry,
            NodeBody::ChunkInfo(_) => NodeKind::ChunkInfo,
        }
    }

    /// The key this node is stored under.
    pub fn key(&self) -> Key {
        match &self.body {
            NodeBody::Uninit => Key::default(),
            NodeBody::FileAttr(f) => f.key(),
            NodeBody::DirEntry(d) => d.key(),
            NodeBody::ChunkInfo(c) => c.key(),
        }
    }

    /// The payload as file attributes, or `None`.
    pub fn fattr(&self) -> Option<&FileAttr> {
        match &self.body {
            NodeBody::FileAttr(f) => Some(f),
            _ => None,
        }
    }

    /// Mutable counterpart of [`MetaNode::fattr`].
    pub fn fattr_mut(&mut self) -> Option<&mut FileAttr> {
        match &mut self.body {
            NodeBody::FileAttr(f) => Some(f),
            _ => None,
        }
    }

    /// The payload as a directory entry, or `None`.
    pub fn dentry(&self) -> Option<&DirEntry> {
        match &self.body {
            NodeBody::DirEntry(d) => Some(d),
            _ => None,
        }
    }

    /// The payload as a chunk descriptor, or `None`.
    pub fn chunk_info(&self) -> Option<&ChunkInfo> {
        match &self.body {
            NodeBody::ChunkInfo(c) => Some(c),
            _ => None,
        }
    }

    /// Mutable counterpart of [`MetaNode::chunk_info`].
    pub fn chunk_info_mut(&mut self) -> Option<&mut ChunkInfo> {
        match &mut self.body {
            NodeBody::ChunkInfo(c) => Some(c),
            _ => None,
        }
    }

    /// The payload as file attributes.
    ///
    /// # Panics
    ///
    /// Panics when the node holds anything else. Use only where the key
    /// already proves the kind; a mismatch there is a corrupted tree.
    pub fn as_fattr(&self) -> &FileAttr {
        match &self.body {
            NodeBody::FileAttr(f) => f,
            other => panic!("expected fattr node, found {:?}", kind_of(other)),
        }
    }

    /// Mutable counterpart of [`MetaNode::as_fattr`], same panic contract.
    pub fn as_fattr_mut(&mut self) -> &mut FileAttr {
        match &mut self.body {
            NodeBody::FileAttr(f) => f,
            other => panic!("expected fattr node, found {:?}", kind_of(other)),
        }
    }

    /// The payload as a directory entry, panicking on any other kind.
    pub fn as_dentry(&self) -> &DirEntry {
        match &self.body {
            NodeBody::DirEntry(d) => d,
            other => panic!("expected dentry node, found {:?}", kind_of(other)),
        }
    }

    /// The payload as a chunk descriptor, panicking on any other kind.
    pub fn as_chunk_info(&self) -> &ChunkInfo {
        match &self.body {
            NodeBody::ChunkInfo(c) => c,
            other => panic!("expected chunkinfo node, found {:?}", kind_of(other)),
        }
    }

    /// Mutable counterpart of [`MetaNode::as_chunk_info`], same panic
    /// contract.
    pub fn as_chunk_info_mut(&mut self) -> &mut ChunkInfo {
        match &mut self.body {
            NodeBody::ChunkInfo(c) => c,
            other => panic!("expected chunkinfo node, found {:?}", kind_of(other)),
        }
    }

    /// Renders the payload as one checkpoint line (no trailing newline).
    pub fn render(&self) -> String {
        match &self.body {
            NodeBody::Uninit => "uninit".to_string(),
            NodeBody::FileAttr(f) => format!(
                "fattr/{}/id/{}/chunkcount/{}/numreplicas/{}/mtime/{}/{}/ctime/{}/{}/crtime/{}/{}",
                f.file_type,
                f.id,
                f.chunk_count,
                f.num_replicas,
                f.mtime.secs,
                f.mtime.nanos,
                f.ctime.secs,
                f.ctime.nanos,
                f.crtime.secs,
                f.crtime.nanos,
            ),
            NodeBody::DirEntry(d) => {
                format!("dentry/name/{}/id/{}/parent/{}", d.name, d.id, d.dir)
            }
            NodeBody::ChunkInfo(c) => format!(
                "chunkinfo/fid/{}/chunkid/{}/offset/{}/version/{}",
                c.file, c.chunk_id, c.offset, c.version,
            ),
        }
    }

    /// Parses one checkpoint line back into a node. The returned node
    /// carries default flags; the loader stamps parity afterwards.
    ///
    /// The error value is a human-readable reason; callers attach the
    /// line number.
    pub fn parse(line: &str) -> Result<MetaNode, String> {
        let mut tokens = LineTokens::new(line);
        let body = match tokens.token()? {
            "fattr" => {
                let file_type = tokens.token()?;
                let file_type = FileType::parse(file_type)
                    .ok_or_else(|| format!("unknown file type '{}'", file_type))?;
                tokens.tag("id")?;
                let id = FileId::new(tokens.number("id")?);
                tokens.tag("chunkcount")?;
                let chunk_count = tokens.number("chunkcount")?;
                tokens.tag("numreplicas")?;
                let num_replicas = tokens.number("numreplicas")?;
                let num_replicas = i16::try_from(num_replicas)
                    .map_err(|_| format!("numreplicas {} out of range", num_replicas))?;
                tokens.tag("mtime")?;
                let mtime = tokens.timestamp()?;
                tokens.tag("ctime")?;
                let ctime = tokens.timestamp()?;
                tokens.tag("crtime")?;
                let crtime = tokens.timestamp()?;
                NodeBody::FileAttr(FileAttr {
                    id,
                    file_type,
                    chunk_count,
                    num_replicas,
                    mtime,
                    ctime,
                    crtime,
                })
            }
            "dentry" => {
                tokens.tag("name")?;
                let name = tokens.token()?.to_string();
                tokens.tag("id")?;
                let id = FileId::new(tokens.number("id")?);
                tokens.tag("parent")?;
                let dir = FileId::new(tokens.number("parent")?);
                NodeBody::DirEntry(DirEntry { dir, name, id })
            }
            "chunkinfo" => {
                tokens.tag("fid")?;
                let file = FileId::new(tokens.number("fid")?);
                tokens.tag("chunkid")?;
                let chunk_id = ChunkId::new(tokens.number("chunkid")?);
                tokens.tag("offset")?;
                let offset = tokens.number("offset")?;
                if offset < 0 {
                    return Err(format!("negative offset {}", offset));
                }
                tokens.tag("version")?;
                let version = ChunkVersion::new(tokens.number("version")?);
                NodeBody::ChunkInfo(ChunkInfo {
                    file,
                    offset,
                    chunk_id,
                    version,
                })
            }
            other => return Err(format!("unknown node type '{}'", other)),
        };
        tokens.end()?;
        Ok(MetaNode {
            flags: NodeFlags::default(),
            body,
        })
    }
}

fn kind_of(body: &NodeBody) -> NodeKind {
    match body {
        NodeBody::Uninit => NodeKind::Uninit,
        NodeBody::FileAttr(_) => NodeKind::FileAttr,
        NodeBody::DirEntry(_) => NodeKind::DirEntry,
        NodeBody::ChunkInfo(_) => NodeKind::ChunkInfo,
    }
}

/// Cursor over the '/'-separated tokens of one checkpoint line.
struct LineTokens<'a> {
    tokens: std::str::Split<'a, char>,
}

impl<'a> LineTokens<'a> {
    fn new(line: &'a str) -> Self {
        LineTokens {
            tokens: line.split('/'),
        }
    }

    fn token(&mut self) -> Result<&'a str, String> {
        self.tokens.next().ok_or_else(|| "truncated line".to_string())
    }

    fn tag(&mut self, want: &str) -> Result<(), String> {
        let got = self.token()?;
        if got == want {
            Ok(())
        } else {
            Err(format!("expected '{}', found '{}'", want, got))
        }
    }

    fn number(&mut self, what: &str) -> Result<i64, String> {
        let token = self.token()?;
        token
            .parse()
            .map_err(|_| format!("bad {} value '{}'", what, token))
    }

    fn timestamp(&mut self) -> Result<Timestamp, String> {
        let secs = self.number("seconds")?;
        let nanos = self.number("nanoseconds")?;
        if secs < 0 || !(0..1_000_000_000).contains(&nanos) {
            return Err(format!("bad timestamp {}/{}", secs, nanos));
        }
        Ok(Timestamp {
            secs: secs as u64,
            nanos: nanos as u32,
        })
    }

    fn end(&mut self) -> Result<(), String> {
        match self.tokens.next() {
            None => Ok(()),
            Some(extra) => Err(format!("trailing data '{}'", extra)),
        }
    }
}
