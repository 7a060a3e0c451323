//! Whole-tree checkpoints.
//!
//! A checkpoint is one plain text file: a fixed header carrying the
//! format version, the checkpoint generation, both generator seeds and
//! the chunk version increment, then one line per stored node in key
//! order. Writes go to a temp file that is fsynced and renamed into
//! place, so a reader only ever sees a complete checkpoint; a crash
//! mid-write leaves the previous file authoritative.
//!
//! Loading restores the counters from the header before any entity is
//! touched, so ids handed out after recovery can never collide with ids
//! already in the tree.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use tracing::info;

use crate::node::{Key, MetaNode, NodeKind};
use crate::tree::MetaTree;
use crate::types::{FileId, MetaError, Timestamp};

/// Name of the checkpoint file within the checkpoint directory.
pub const CHECKPOINT_FILENAME: &str = "checkpoint.txt";

/// Line format version this build writes and accepts.
const FORMAT_VERSION: i64 = 1;

/// Reads and writes checkpoints in one directory.
pub struct CheckpointDir {
    dir: PathBuf,
}

impl CheckpointDir {
    /// Creates a handle for checkpoints under `dir`. The directory is
    /// created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CheckpointDir { dir: dir.into() }
    }

    /// Path of the live checkpoint file.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILENAME)
    }

    /// True when a checkpoint exists to load.
    pub fn has_checkpoint(&self) -> bool {
        self.file_path().exists()
    }

    /// Writes the whole tree as a new checkpoint and returns the number
    /// of entity lines written.
    ///
    /// Nodes flagged skip are left out and keep their flags untouched.
    /// Every written node gets its parity stamped to the new generation
    /// and its new-since-checkpoint flag cleared.
    pub fn save(&self, tree: &mut MetaTree) -> Result<usize, MetaError> {
        fs::create_dir_all(&self.dir)?;
        let generation = tree.advance_generation();
        let parity = generation % 2 == 1;
        let now = Timestamp::now();

        let final_path = self.file_path();
        let mut tmp_path = final_path.clone();
        tmp_path.set_extension("tmp");

        let mut out = BufWriter::new(File::create(&tmp_path)?);
        writeln!(out, "checkpoint/version/{}", FORMAT_VERSION)?;
        writeln!(out, "generation/{}", generation)?;
        writeln!(out, "fid/{}", tree.fid_seed())?;
        writeln!(out, "chunkid/{}", tree.chunk_seed())?;
        writeln!(out, "chunkversioninc/{}", tree.version_inc())?;
        writeln!(out, "time/{}/{}", now.secs, now.nanos)?;

        let mut entities = 0usize;
        for (_, node) in tree.store_mut().iter_mut() {
            if node.flags.skip_cp {
                continue;
            }
            writeln!(out, "{}", node.render())?;
            node.flags.cp_parity = parity;
            node.flags.new_since_cp = false;
            entities += 1;
        }

        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(&tmp_path, &final_path)?;

        info!(
            path = %final_path.display(),
            entities,
            generation,
            "wrote checkpoint"
        );
        Ok(entities)
    }

    /// Loads the checkpoint back into a fresh tree.
    ///
    /// Any malformed line fails the whole load; a damaged checkpoint is
    /// reported, never partially applied.
    pub fn load(&self) -> Result<MetaTree, MetaError> {
        let path = self.file_path();
        let file = File::open(&path)?;
        let mut lines = BufReader::new(file).lines();
        let mut lineno = 0usize;

        let line = next_header_line(&mut lines, &mut lineno)?;
        let mut parts = line.split('/');
        if parts.next() != Some("checkpoint") || parts.next() != Some("version") {
            return Err(bad(lineno, "not a checkpoint header".to_string()));
        }
        let version: i64 = match parts.next().map(str::parse) {
            Some(Ok(v)) => v,
            _ => return Err(bad(lineno, "bad version value".to_string())),
        };
        if version != FORMAT_VERSION {
            return Err(bad(lineno, format!("unsupported version {}", version)));
        }

        let line = next_header_line(&mut lines, &mut lineno)?;
        let generation = header_i64(&line, "generation", lineno)?;
        if generation < 0 {
            return Err(bad(lineno, "negative generation".to_string()));
        }
        let generation = generation as u64;
        let parity = generation % 2 == 1;

        let line = next_header_line(&mut lines, &mut lineno)?;
        let fid_seed = header_i64(&line, "fid", lineno)?;
        let line = next_header_line(&mut lines, &mut lineno)?;
        let chunk_seed = header_i64(&line, "chunkid", lineno)?;
        let line = next_header_line(&mut lines, &mut lineno)?;
        let version_inc = header_i64(&line, "chunkversioninc", lineno)?;

        let line = next_header_line(&mut lines, &mut lineno)?;
        let mut time_parts = line.split('/');
        if time_parts.next() != Some("time") {
            return Err(bad(lineno, "expected time line".to_string()));
        }
        for _ in 0..2 {
            let value = time_parts
                .next()
                .ok_or_else(|| bad(lineno, "truncated time line".to_string()))?;
            value
                .parse::<i64>()
                .map_err(|_| bad(lineno, format!("bad time value '{}'", value)))?;
        }

        // Counters are in place; now the entities.
        let mut tree = MetaTree::restore(fid_seed, chunk_seed, version_inc, generation);
        for line in lines {
            lineno += 1;
            let line = line?;
            let mut node =
                MetaNode::parse(&line).map_err(|reason| bad(lineno, reason))?;
            node.flags.cp_parity = parity;
            if let Some(attr) = node.fattr() {
                if attr.id == FileId::ROOT {
                    node.flags.is_root = true;
                }
            }
            let key = node.key();
            tree.store_mut()
                .insert(node)
                .map_err(|_| bad(lineno, format!("duplicate key {}", key)))?;
        }

        if tree.getattr(FileId::ROOT).is_err() {
            return Err(bad(lineno, "no root attributes".to_string()));
        }
        derive_leaf_parents(&mut tree);

        info!(
            path = %path.display(),
            entities = tree.store().len(),
            generation,
            "loaded checkpoint"
        );
        Ok(tree)
    }
}

/// Marks every directory that holds no subdirectory as a leaf parent.
fn derive_leaf_parents(tree: &mut MetaTree) {
    let dirs: Vec<i64> = tree
        .store()
        .iter_kind(NodeKind::FileAttr)
        .filter(|node| node.as_fattr().is_dir())
        .map(|node| node.as_fattr().id.as_i64())
        .collect();
    let subdir_parents: Vec<i64> = tree
        .store()
        .iter_kind(NodeKind::DirEntry)
        .filter_map(|node| {
            let entry = node.as_dentry();
            match tree.getattr(entry.id) {
                Ok(attr) if attr.is_dir() => Some(entry.dir.as_i64()),
                _ => None,
            }
        })
        .collect();
    for id in dirs {
        if let Some(node) = tree.store_mut().find_mut(Key::new(NodeKind::FileAttr, id, 0)) {
            node.flags.leaf_parent = true;
        }
    }
    for id in subdir_parents {
        if let Some(node) = tree.store_mut().find_mut(Key::new(NodeKind::FileAttr, id, 0)) {
            node.flags.leaf_parent = false;
        }
    }
}

fn next_header_line(
    lines: &mut io::Lines<BufReader<File>>,
    lineno: &mut usize,
) -> Result<String, MetaError> {
    *lineno += 1;
    match lines.next() {
        Some(line) => Ok(line?),
        None => Err(bad(*lineno, "truncated header".to_string())),
    }
}

fn header_i64(line: &str, tag: &str, lineno: usize) -> Result<i64, MetaError> {
    let mut parts = line.split('/');
    if parts.next() != Some(tag) {
        return Err(bad(lineno, format!("expected {} line", tag)));
    }
    let value = parts
        .next()
        .ok_or_else(|| bad(lineno, format!("missing {} value", tag)))?;
    let parsed = value
        .parse()
        .map_err(|_| bad(lineno, format!("bad {} value '{}'", tag, value)))?;
    if parts.next().is_some() {
        return Err(bad(lineno, format!("trailing data on {} line", tag)));
    }
    Ok(parsed)
}

fn bad(line: usize, reason: String) -> MetaError {
    MetaError::BadCheckpoint { line, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeBody;
    use tempfile::tempdir;

    fn populated_tree() -> MetaTree {
        let mut tree = MetaTree::new();
        let foo = tree.create(FileId::ROOT, "foo", 3).unwrap();
        tree.allocate_chunk(foo, 0).unwrap();
        let sub = tree.mkdir(FileId::ROOT, "sub").unwrap();
        tree.create(sub, "nested", 2).unwrap();
        tree
    }

    fn bodies(tree: &MetaTree) -> Vec<(Key, NodeBody)> {
        tree.store()
            .iter()
            .map(|(k, n)| (*k, n.body.clone()))
            .collect()
    }

    #[test]
    fn test_save_counts_entity_lines() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = MetaTree::new();
        assert_eq!(cp.save(&mut tree).unwrap(), 1);

        let mut tree = populated_tree();
        // 4 fattrs + 3 dentries + 1 chunkinfo.
        assert_eq!(cp.save(&mut tree).unwrap(), 8);
        assert!(cp.has_checkpoint());
    }

    #[test]
    fn test_save_writes_header_first() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = MetaTree::new();
        cp.save(&mut tree).unwrap();

        let text = fs::read_to_string(cp.file_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "checkpoint/version/1");
        assert_eq!(lines[1], "generation/1");
        assert_eq!(lines[2], "fid/1");
        assert_eq!(lines[3], "chunkid/0");
        assert_eq!(lines[4], "chunkversioninc/1");
        assert!(lines[5].starts_with("time/"));
        assert!(lines[6].starts_with("fattr/dir/id/1/"));
    }

    #[test]
    fn test_save_stamps_flags() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = populated_tree();
        assert!(tree.store().iter().any(|(_, n)| n.flags.new_since_cp));

        cp.save(&mut tree).unwrap();
        assert_eq!(tree.generation(), 1);
        assert!(tree.store().iter().all(|(_, n)| !n.flags.new_since_cp));
        assert!(tree.store().iter().all(|(_, n)| n.flags.cp_parity));

        cp.save(&mut tree).unwrap();
        assert_eq!(tree.generation(), 2);
        assert!(tree.store().iter().all(|(_, n)| !n.flags.cp_parity));
    }

    #[test]
    fn test_skip_flagged_nodes_excluded() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = populated_tree();
        let foo = tree.lookup_path("/foo").unwrap();
        tree.mark_skip(Key::new(NodeKind::FileAttr, foo.as_i64(), 0))
            .unwrap();

        let written = cp.save(&mut tree).unwrap();
        assert_eq!(written, 7);
        let text = fs::read_to_string(cp.file_path()).unwrap();
        assert!(!text.contains(&format!("fattr/file/id/{}/", foo)));
        // The skipped node still carries its pre-save flags.
        let node = tree
            .store()
            .find(Key::new(NodeKind::FileAttr, foo.as_i64(), 0))
            .unwrap();
        assert!(node.flags.new_since_cp);
        assert!(!node.flags.cp_parity);
    }

    #[test]
    fn test_round_trip_restores_everything() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = populated_tree();
        tree.bump_version_inc();
        cp.save(&mut tree).unwrap();

        let loaded = cp.load().unwrap();
        assert_eq!(loaded.fid_seed(), tree.fid_seed());
        assert_eq!(loaded.chunk_seed(), tree.chunk_seed());
        assert_eq!(loaded.version_inc(), tree.version_inc());
        assert_eq!(loaded.generation(), tree.generation());
        assert_eq!(bodies(&loaded), bodies(&tree));
    }

    #[test]
    fn test_line_breaking_names_never_reach_disk() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = MetaTree::new();
        assert!(matches!(
            tree.create(FileId::ROOT, "two\nlines", 1),
            Err(MetaError::InvalidName(_))
        ));
        // The refused create consumed no file id.
        let plain = tree.create(FileId::ROOT, "plain", 1).unwrap();
        assert_eq!(plain, FileId::new(2));

        cp.save(&mut tree).unwrap();
        let loaded = cp.load().unwrap();
        assert_eq!(loaded.store().len(), 3);
        assert_eq!(loaded.lookup_path("/plain").unwrap(), plain);
    }

    #[test]
    fn test_load_stamps_parity_and_root() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = populated_tree();
        cp.save(&mut tree).unwrap();

        let loaded = cp.load().unwrap();
        assert!(loaded.store().iter().all(|(_, n)| n.flags.cp_parity));
        assert!(loaded.store().iter().all(|(_, n)| !n.flags.new_since_cp));
        let root = loaded
            .store()
            .find(Key::new(NodeKind::FileAttr, FileId::ROOT.as_i64(), 0))
            .unwrap();
        assert!(root.flags.is_root);
    }

    #[test]
    fn test_load_rederives_leaf_parents() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = populated_tree();
        cp.save(&mut tree).unwrap();

        let loaded = cp.load().unwrap();
        let root = loaded
            .store()
            .find(Key::new(NodeKind::FileAttr, FileId::ROOT.as_i64(), 0))
            .unwrap();
        // Root holds the "sub" directory.
        assert!(!root.flags.leaf_parent);
        let sub = loaded.lookup_path("/sub").unwrap();
        let sub_node = loaded
            .store()
            .find(Key::new(NodeKind::FileAttr, sub.as_i64(), 0))
            .unwrap();
        assert!(sub_node.flags.leaf_parent);
    }

    #[test]
    fn test_ids_continue_after_reload() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = populated_tree();
        let last = tree.fid_seed();
        cp.save(&mut tree).unwrap();

        let mut loaded = cp.load().unwrap();
        let next = loaded.create(FileId::ROOT, "after", 1).unwrap();
        assert_eq!(next.as_i64(), last + 1);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path().join("empty"));
        assert!(matches!(cp.load(), Err(MetaError::Io(_))));
    }

    #[test]
    fn test_load_rejects_garbage_entity_line() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = MetaTree::new();
        cp.save(&mut tree).unwrap();
        let mut text = fs::read_to_string(cp.file_path()).unwrap();
        text.push_str("gibberish/1/2\n");
        fs::write(cp.file_path(), text).unwrap();

        match cp.load() {
            Err(MetaError::BadCheckpoint { line, reason }) => {
                assert_eq!(line, 8);
                assert!(reason.contains("unknown node type"));
            }
            other => panic!("expected BadCheckpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_load_rejects_wrong_header() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        let path = dir.path().join(CHECKPOINT_FILENAME);
        fs::write(&path, "journal/version/1\n").unwrap();
        let cp = CheckpointDir::new(dir.path());
        match cp.load() {
            Err(MetaError::BadCheckpoint { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected BadCheckpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_load_rejects_unsupported_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILENAME);
        fs::write(&path, "checkpoint/version/9\n").unwrap();
        let cp = CheckpointDir::new(dir.path());
        match cp.load() {
            Err(MetaError::BadCheckpoint { reason, .. }) => {
                assert!(reason.contains("unsupported version"))
            }
            other => panic!("expected BadCheckpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_load_rejects_duplicate_entity() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = MetaTree::new();
        cp.save(&mut tree).unwrap();
        let mut text = fs::read_to_string(cp.file_path()).unwrap();
        let root_line = text.lines().nth(6).unwrap().to_string();
        text.push_str(&root_line);
        text.push('\n');
        fs::write(cp.file_path(), text).unwrap();

        match cp.load() {
            Err(MetaError::BadCheckpoint { reason, .. }) => {
                assert!(reason.contains("duplicate key"))
            }
            other => panic!("expected BadCheckpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_load_requires_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILENAME);
        let text = "checkpoint/version/1\n\
                    generation/1\n\
                    fid/5\n\
                    chunkid/0\n\
                    chunkversioninc/1\n\
                    time/0/0\n\
                    fattr/file/id/5/chunkcount/0/numreplicas/1/mtime/0/0/ctime/0/0/crtime/0/0\n";
        fs::write(&path, text).unwrap();
        let cp = CheckpointDir::new(dir.path());
        match cp.load() {
            Err(MetaError::BadCheckpoint { reason, .. }) => {
                assert!(reason.contains("no root"))
            }
            other => panic!("expected BadCheckpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_save_leaves_previous_checkpoint() {
        let dir = tempdir().unwrap();
        let cp = CheckpointDir::new(dir.path());
        let mut tree = populated_tree();
        cp.save(&mut tree).unwrap();
        let before = fs::read_to_string(cp.file_path()).unwrap();

        // A stray temp file from an interrupted write must not disturb
        // the live checkpoint.
        fs::write(cp.file_path().with_extension("tmp"), "partial").unwrap();
        let after = fs::read_to_string(cp.file_path()).unwrap();
        assert_eq!(before, after);
        let loaded = cp.load().unwrap();
        assert_eq!(bodies(&loaded), bodies(&tree));
    }
}
