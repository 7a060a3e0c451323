//! The metadata tree: namespace operations over the ordered store.
//!
//! One `MetaTree` is the whole authoritative state of the filesystem:
//! the node store, the file and chunk id generators, the chunk version
//! increment, and the checkpoint generation counter. It is owned by the
//! apply task and mutated from that single timeline only, so none of the
//! operations here take locks.

use tracing::debug;

use crate::idgen::UniqueId;
use crate::node::{ChunkInfo, DirEntry, FileAttr, Key, MetaNode, NodeBody, NodeKind};
use crate::store::MetaStore;
use crate::types::{ChunkId, ChunkVersion, FileId, FileType, MetaError, Timestamp};

/// The authoritative metadata state.
#[derive(Debug)]
pub struct MetaTree {
    store: MetaStore,
    file_ids: UniqueId,
    chunk_ids: UniqueId,
    version_inc: i64,
    generation: u64,
}

impl MetaTree {
    /// Creates a tree holding only the root directory.
    ///
    /// The root consumes id 1, so the file id generator starts with its
    /// seed already at 1.
    pub fn new() -> Self {
        let mut store = MetaStore::new();
        let mut root = MetaNode::new(NodeBody::FileAttr(FileAttr::new(
            FileType::Directory,
            FileId::ROOT,
            1,
        )));
        root.flags.is_root = true;
        root.flags.leaf_parent = true;
        store
            .insert(root)
            .expect("empty store rejected the root node");
        MetaTree {
            store,
            file_ids: UniqueId::new(FileId::ROOT.as_i64()),
            chunk_ids: UniqueId::new(0),
            version_inc: 1,
            generation: 0,
        }
    }

    /// Creates an empty tree with restored counters; the checkpoint
    /// loader fills the store afterwards.
    pub(crate) fn restore(
        fid_seed: i64,
        chunk_seed: i64,
        version_inc: i64,
        generation: u64,
    ) -> Self {
        MetaTree {
            store: MetaStore::new(),
            file_ids: UniqueId::new(fid_seed),
            chunk_ids: UniqueId::new(chunk_seed),
            version_inc,
            generation,
        }
    }

    /// Read access to the underlying node store.
    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut MetaStore {
        &mut self.store
    }

    /// Seed of the file id generator, as persisted in checkpoints.
    pub fn fid_seed(&self) -> i64 {
        self.file_ids.seed()
    }

    /// Seed of the chunk id generator, as persisted in checkpoints.
    pub fn chunk_seed(&self) -> i64 {
        self.chunk_ids.seed()
    }

    /// Current chunk version increment.
    pub fn version_inc(&self) -> i64 {
        self.version_inc
    }

    /// Raises the chunk version increment by one. Called once per restart
    /// and whenever a chunk allocation fails at the storage layer, so that
    /// replicas minted under the old increment can never masquerade as
    /// current.
    pub fn bump_version_inc(&mut self) {
        self.version_inc += 1;
        debug!(version_inc = self.version_inc, "raised chunk version increment");
    }

    /// Checkpoint generation counter. Its parity is the value nodes carry
    /// in their `cp_parity` flag once written out.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn advance_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Attributes of `fid`.
    pub fn getattr(&self, fid: FileId) -> Result<&FileAttr, MetaError> {
        let key = Key::new(NodeKind::FileAttr, fid.as_i64(), 0);
        self.store
            .find(key)
            .map(|node| node.as_fattr())
            .ok_or(MetaError::NotFound(key))
    }

    /// Finds the entry `name` inside directory `dir`.
    pub fn lookup(&self, dir: FileId, name: &str) -> Result<&DirEntry, MetaError> {
        self.dir_attr(dir)?;
        self.find_entry(dir, name)
            .ok_or_else(|| MetaError::EntryNotFound {
                dir,
                name: name.to_string(),
            })
    }

    /// Resolves an absolute path, one entry at a time, starting at the
    /// root. Empty components and `.` are skipped.
    pub fn lookup_path(&self, path: &str) -> Result<FileId, MetaError> {
        let mut cur = FileId::ROOT;
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            cur = self.lookup(cur, comp)?.id;
        }
        Ok(cur)
    }

    /// Lists the entries of directory `dir` in entry-id order.
    pub fn readdir(&self, dir: FileId) -> Result<Vec<&DirEntry>, MetaError> {
        self.dir_attr(dir)?;
        Ok(self
            .store
            .range(NodeKind::DirEntry, dir.as_i64(), Key::MATCH_ANY)
            .map(|node| node.as_dentry())
            .collect())
    }

    /// True when directory `dir` holds no entries.
    pub fn is_empty_dir(&self, dir: FileId) -> Result<bool, MetaError> {
        self.dir_attr(dir)?;
        Ok(self
            .store
            .range(NodeKind::DirEntry, dir.as_i64(), Key::MATCH_ANY)
            .next()
            .is_none())
    }

    /// Creates a plain file `name` under `dir` and returns its new id.
    /// Creation is exclusive; an existing entry is never replaced.
    pub fn create(&mut self, dir: FileId, name: &str, num_replicas: i16) -> Result<FileId, MetaError> {
        check_name(name)?;
        self.dir_attr(dir)?;
        if self.find_entry(dir, name).is_some() {
            return Err(MetaError::EntryExists {
                dir,
                name: name.to_string(),
            });
        }
        let fid = FileId::new(self.file_ids.genid());
        let attr = FileAttr::new(FileType::File, fid, num_replicas.max(1));
        self.store.insert(MetaNode::new(NodeBody::FileAttr(attr)))?;
        self.store
            .insert(MetaNode::new(NodeBody::DirEntry(DirEntry::new(dir, name, fid))))?;
        self.touch(dir);
        debug!(dir = %dir, name = %name, fid = %fid, "created file");
        Ok(fid)
    }

    /// Creates a subdirectory `name` under `dir` and returns its new id.
    pub fn mkdir(&mut self, dir: FileId, name: &str) -> Result<FileId, MetaError> {
        check_name(name)?;
        self.dir_attr(dir)?;
        if self.find_entry(dir, name).is_some() {
            return Err(MetaError::EntryExists {
                dir,
                name: name.to_string(),
            });
        }
        let fid = FileId::new(self.file_ids.genid());
        let mut node = MetaNode::new(NodeBody::FileAttr(FileAttr::new(
            FileType::Directory,
            fid,
            1,
        )));
        node.flags.leaf_parent = true;
        self.store.insert(node)?;
        self.store
            .insert(MetaNode::new(NodeBody::DirEntry(DirEntry::new(dir, name, fid))))?;
        self.subdir_added(dir);
        debug!(dir = %dir, name = %name, fid = %fid, "created directory");
        Ok(fid)
    }

    /// Removes the plain file `name` from `dir`, dropping its attributes,
    /// its entry and all of its chunks. Returns the freed chunk ids so the
    /// caller can retire the replicas.
    pub fn remove(&mut self, dir: FileId, name: &str) -> Result<Vec<ChunkId>, MetaError> {
        let entry = self.lookup(dir, name)?.clone();
        if self.getattr(entry.id)?.is_dir() {
            return Err(MetaError::IsADirectory(entry.id));
        }
        let freed = self.drop_chunks_from(entry.id, 0)?;
        self.store
            .remove(Key::new(NodeKind::FileAttr, entry.id.as_i64(), 0))?;
        self.store.remove(entry.key())?;
        self.touch(dir);
        debug!(dir = %dir, name = %name, fid = %entry.id, chunks = freed.len(), "removed file");
        Ok(freed)
    }

    /// Removes the empty directory `name` from `dir`.
    pub fn rmdir(&mut self, dir: FileId, name: &str) -> Result<(), MetaError> {
        let entry = self.lookup(dir, name)?.clone();
        if !self.getattr(entry.id)?.is_dir() {
            return Err(MetaError::NotADirectory(entry.id));
        }
        if !self.is_empty_dir(entry.id)? {
            return Err(MetaError::DirectoryNotEmpty(entry.id));
        }
        self.store
            .remove(Key::new(NodeKind::FileAttr, entry.id.as_i64(), 0))?;
        self.store.remove(entry.key())?;
        self.touch(dir);
        debug!(dir = %dir, name = %name, fid = %entry.id, "removed directory");
        Ok(())
    }

    /// Moves `src_name` in `src_dir` to `dst_name` in `dst_dir`.
    ///
    /// The destination name must be free; renaming onto an existing entry
    /// is refused rather than overwriting. Renaming a path onto itself is
    /// a no-op.
    pub fn rename(
        &mut self,
        src_dir: FileId,
        src_name: &str,
        dst_dir: FileId,
        dst_name: &str,
    ) -> Result<(), MetaError> {
        check_name(dst_name)?;
        if src_dir == dst_dir && src_name == dst_name {
            self.lookup(src_dir, src_name)?;
            return Ok(());
        }
        let entry = self.lookup(src_dir, src_name)?.clone();
        self.dir_attr(dst_dir)?;
        if self.find_entry(dst_dir, dst_name).is_some() {
            return Err(MetaError::EntryExists {
                dir: dst_dir,
                name: dst_name.to_string(),
            });
        }
        let moving_dir = self.getattr(entry.id)?.is_dir();
        if moving_dir && self.in_subtree(entry.id, dst_dir) {
            return Err(MetaError::MoveIntoSubtree(entry.id));
        }
        self.store.remove(entry.key())?;
        self.store.insert(MetaNode::new(NodeBody::DirEntry(DirEntry::new(
            dst_dir, dst_name, entry.id,
        ))))?;
        if moving_dir {
            self.subdir_added(dst_dir);
        } else {
            self.touch(dst_dir);
        }
        self.touch(src_dir);
        debug!(
            src_dir = %src_dir,
            src_name = %src_name,
            dst_dir = %dst_dir,
            dst_name = %dst_name,
            fid = %entry.id,
            "renamed entry"
        );
        Ok(())
    }

    /// Allocates the chunk covering `offset` of `file` and returns its
    /// descriptor.
    ///
    /// A first allocation mints a fresh chunk id at the initial version.
    /// Allocating again at an occupied offset keeps the chunk id but
    /// advances the version by the current increment, so replicas written
    /// under the old version become stale.
    pub fn allocate_chunk(&mut self, file: FileId, offset: i64) -> Result<ChunkInfo, MetaError> {
        if offset < 0 {
            return Err(MetaError::InvalidOffset(offset));
        }
        if self.getattr(file)?.is_dir() {
            return Err(MetaError::IsADirectory(file));
        }
        let key = Key::new(NodeKind::ChunkInfo, file.as_i64(), offset);
        let inc = self.version_inc;
        if let Some(node) = self.store.find_mut(key) {
            let info = node.as_chunk_info_mut();
            info.version = info.version.bumped(inc);
            let out = info.clone();
            debug!(fid = %file, offset, chunk = %out.chunk_id, version = %out.version, "reallocated chunk");
            return Ok(out);
        }
        let chunk_id = ChunkId::new(self.chunk_ids.genid());
        let info = ChunkInfo::new(file, offset, chunk_id, ChunkVersion::INITIAL);
        self.store
            .insert(MetaNode::new(NodeBody::ChunkInfo(info.clone())))?;
        let fattr_key = Key::new(NodeKind::FileAttr, file.as_i64(), 0);
        if let Some(node) = self.store.find_mut(fattr_key) {
            let attr = node.as_fattr_mut();
            attr.chunk_count += 1;
            attr.mtime = Timestamp::now();
        }
        debug!(fid = %file, offset, chunk = %chunk_id, "allocated chunk");
        Ok(info)
    }

    /// Truncates `file` to `size` bytes at the chunk level: every chunk
    /// starting at or past `size` is dropped. A chunk straddling the new
    /// size is kept; trimming its data is the storage layer's job.
    /// Returns the freed chunk ids.
    pub fn truncate(&mut self, file: FileId, size: i64) -> Result<Vec<ChunkId>, MetaError> {
        if self.getattr(file)?.is_dir() {
            return Err(MetaError::IsADirectory(file));
        }
        let freed = self.drop_chunks_from(file, size.max(0))?;
        let fattr_key = Key::new(NodeKind::FileAttr, file.as_i64(), 0);
        if let Some(node) = self.store.find_mut(fattr_key) {
            let attr = node.as_fattr_mut();
            attr.chunk_count -= freed.len() as i64;
            attr.mtime = Timestamp::now();
        }
        debug!(fid = %file, size, chunks = freed.len(), "truncated file");
        Ok(freed)
    }

    /// Sets the desired replica count of a plain file; values below one
    /// are raised to one.
    pub fn set_replication(&mut self, file: FileId, num_replicas: i16) -> Result<(), MetaError> {
        let key = Key::new(NodeKind::FileAttr, file.as_i64(), 0);
        let node = self.store.find_mut(key).ok_or(MetaError::NotFound(key))?;
        let attr = node.as_fattr_mut();
        if attr.is_dir() {
            return Err(MetaError::IsADirectory(file));
        }
        attr.num_replicas = num_replicas.max(1);
        attr.ctime = Timestamp::now();
        debug!(fid = %file, num_replicas = attr.num_replicas, "changed replication");
        Ok(())
    }

    /// Excludes the node under `key` from the next checkpoint write.
    pub fn mark_skip(&mut self, key: Key) -> Result<(), MetaError> {
        let node = self.store.find_mut(key).ok_or(MetaError::NotFound(key))?;
        node.flags.skip_cp = true;
        Ok(())
    }

    /// Clears a previously set checkpoint exclusion.
    pub fn clear_skip(&mut self, key: Key) -> Result<(), MetaError> {
        let node = self.store.find_mut(key).ok_or(MetaError::NotFound(key))?;
        node.flags.skip_cp = false;
        Ok(())
    }

    fn dir_attr(&self, dir: FileId) -> Result<&FileAttr, MetaError> {
        let attr = self.getattr(dir)?;
        if !attr.is_dir() {
            return Err(MetaError::NotADirectory(dir));
        }
        Ok(attr)
    }

    fn find_entry(&self, dir: FileId, name: &str) -> Option<&DirEntry> {
        self.store
            .range(NodeKind::DirEntry, dir.as_i64(), Key::MATCH_ANY)
            .map(|node| node.as_dentry())
            .find(|entry| entry.name == name)
    }

    /// True when `candidate` lies inside the subtree rooted at `root`
    /// (including `root` itself).
    fn in_subtree(&self, root: FileId, candidate: FileId) -> bool {
        if root == candidate {
            return true;
        }
        let mut queue = vec![root];
        while let Some(dir) = queue.pop() {
            for entry in self
                .store
                .range(NodeKind::DirEntry, dir.as_i64(), Key::MATCH_ANY)
                .map(|node| node.as_dentry())
            {
                if entry.id == candidate {
                    return true;
                }
                if self.getattr(entry.id).map(|a| a.is_dir()).unwrap_or(false) {
                    queue.push(entry.id);
                }
            }
        }
        false
    }

    fn drop_chunks_from(&mut self, file: FileId, from_offset: i64) -> Result<Vec<ChunkId>, MetaError> {
        let keys: Vec<Key> = self
            .store
            .range(NodeKind::ChunkInfo, file.as_i64(), from_offset)
            .map(|node| node.key())
            .collect();
        let mut freed = Vec::with_capacity(keys.len());
        for key in keys {
            let node = self.store.remove(key)?;
            freed.push(node.as_chunk_info().chunk_id);
        }
        Ok(freed)
    }

    fn touch(&mut self, fid: FileId) {
        let key = Key::new(NodeKind::FileAttr, fid.as_i64(), 0);
        if let Some(node) = self.store.find_mut(key) {
            node.as_fattr_mut().mtime = Timestamp::now();
        }
    }

    /// Flag upkeep when `dir` gains a subdirectory.
    fn subdir_added(&mut self, dir: FileId) {
        let key = Key::new(NodeKind::FileAttr, dir.as_i64(), 0);
        if let Some(node) = self.store.find_mut(key) {
            node.flags.leaf_parent = false;
            node.as_fattr_mut().mtime = Timestamp::now();
        }
    }
}

impl Default for MetaTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry names are single path components. Empty names, the resolution
/// tokens, and names holding a separator or a control character never
/// enter the tree; checkpoint lines embed names between `/` delimiters,
/// one record per line, and rely on this.
fn check_name(name: &str) -> Result<(), MetaError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.chars().any(char::is_control)
    {
        return Err(MetaError::InvalidName(name.to_string()));
    }
    Ok(())
}
