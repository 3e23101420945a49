//! Append-only block log over a single regular file.
//!
//! All durable state lives in one file: node, leaf-link and metadata blocks
//! appended as they are produced, each commit sealed by a one-unit commit
//! block naming the snapshot header. Blocks are immutable once flushed; the
//! latest commit is found on open by scanning backwards one unit at a time.
//! The file carries an exclusive advisory lock for the lifetime of the
//! engine, so a second engine instance fails loudly instead of interleaving
//! writes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::codec::{self, UNIT};
use crate::errors::{Error, Result};
use crate::tree::{LeafLinks, Node};
use crate::types::{BlockPtr, Metadata, TreeHeader};

/// Read access to blocks by pointer. Implemented by the writer-side
/// [`BlockLog`] (which can still see queued, unflushed blocks) and by
/// [`Snapshot`] handles given to readers.
pub trait BlockSource {
    fn read_span(&self, ptr: BlockPtr) -> Result<Vec<u8>>;

    fn get_node(&self, ptr: BlockPtr) -> Result<Node> {
        codec::decode_node(&self.read_span(ptr)?)
    }

    fn get_leaf_links(&self, ptr: BlockPtr) -> Result<LeafLinks> {
        codec::decode_leaf_links(&self.read_span(ptr)?)
    }

    fn get_metadata(&self, ptr: BlockPtr) -> Result<Metadata> {
        codec::decode_metadata(&self.read_span(ptr)?)
    }
}

/// Writer side of the log: owns the write queue, the append frontier and the
/// session cache of leaf positions. All mutation goes through exactly one of
/// these per store file.
#[derive(Debug)]
pub struct BlockLog {
    file: Arc<File>,
    path: PathBuf,
    /// Offset at which the next enqueued block will land.
    frontier: u64,
    /// Encoded blocks not yet written to the file.
    queue: Vec<u8>,
    /// File offset of the first queued byte.
    queue_start: u64,
    /// Offset just past the last durable commit block.
    committed_end: u64,
    /// Positions of leaves written in this session, by leaf id.
    leaf_cache: HashMap<u64, BlockPtr>,
}

fn lock_exclusive(file: &File) -> Result<()> {
    fs2::FileExt::try_lock_exclusive(file).map_err(|e| {
        if e.kind() == ErrorKind::WouldBlock { Error::LockBusy } else { Error::Io(e) }
    })
}

impl BlockLog {
    /// Open (or create) the log at `path`, take the exclusive lock and
    /// locate the latest commit. Returns the log and the recovered header,
    /// or `None` when no well-formed commit exists (fresh database).
    ///
    /// # Errors
    /// `LockBusy` when another engine instance holds the file.
    pub fn open(path: &Path) -> Result<(Self, Option<TreeHeader>)> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        lock_exclusive(&file)?;
        let len = file.metadata()?.len();
        let found = Self::scan_latest_commit(&file, len)?;
        // A crash can leave a partial unit at the tail; the frontier stays
        // unit-aligned so every block start remains scannable.
        let frontier = len.div_ceil(UNIT as u64) * UNIT as u64;
        let committed_end = found.map_or(0, |(_, end)| end);
        match found {
            Some((_, end)) => debug!("opened log {}: last commit ends at {end}", path.display()),
            None => debug!("opened log {}: no commit found", path.display()),
        }
        let log = Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            frontier,
            queue: Vec::new(),
            queue_start: frontier,
            committed_end,
            leaf_cache: HashMap::new(),
        };
        Ok((log, found.map(|(header, _)| header)))
    }

    /// Create a fresh, truncated log at `path` (the vacuum destination).
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        lock_exclusive(&file)?;
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            frontier: 0,
            queue: Vec::new(),
            queue_start: 0,
            committed_end: 0,
            leaf_cache: HashMap::new(),
        })
    }

    fn scan_latest_commit(file: &File, len: u64) -> Result<Option<(TreeHeader, u64)>> {
        let unit = UNIT as u64;
        let mut off = len / unit * unit;
        let mut block = vec![0u8; UNIT];
        while off >= unit {
            off -= unit;
            file.read_exact_at(&mut block, off)?;
            if let Some(header) = codec::try_decode_commit(&block, off) {
                return Ok(Some((header, off + unit)));
            }
        }
        Ok(None)
    }

    fn enqueue(&mut self, block: Vec<u8>) -> Result<BlockPtr> {
        let ptr = BlockPtr { offset: self.frontier, len: codec::padded(block.len()) as u32 };
        if self.queue.is_empty() {
            self.queue_start = self.frontier;
        }
        self.queue.extend_from_slice(&block);
        self.frontier += u64::from(ptr.len);
        Ok(ptr)
    }

    /// Queue a node block at the frontier. Leaf positions are also remembered
    /// in the session cache for the by-id read path.
    pub fn put_node(&mut self, node: &Node) -> Result<BlockPtr> {
        let ptr = self.enqueue(codec::encode_node(node)?)?;
        if let Node::Leaf(leaf) = node {
            self.leaf_cache.insert(leaf.id, ptr);
        }
        Ok(ptr)
    }

    pub fn put_leaf_links(&mut self, links: &LeafLinks) -> Result<BlockPtr> {
        self.enqueue(codec::encode_leaf_links(links)?)
    }

    pub fn put_metadata(&mut self, metadata: &Metadata) -> Result<BlockPtr> {
        self.enqueue(codec::encode_metadata(metadata)?)
    }

    /// Write all queued blocks contiguously at the position recorded when the
    /// first of them was enqueued. Issued between tree operations to cap
    /// queue memory, and by every commit.
    ///
    /// # Errors
    /// `WrongWritePosition` when the queue bookkeeping disagrees with the
    /// frontier; this is an internal bug, not an on-disk condition.
    pub fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let end = self.queue_start + self.queue.len() as u64;
        if end != self.frontier {
            return Err(Error::WrongWritePosition { queued: end, frontier: self.frontier });
        }
        self.file.write_all_at(&self.queue, self.queue_start)?;
        self.queue.clear();
        self.queue_start = self.frontier;
        Ok(())
    }

    /// Append a commit block naming `header`, flush the queue and fsync.
    /// The snapshot is durable only once this returns.
    pub fn commit(&mut self, header: &TreeHeader) -> Result<()> {
        self.enqueue(codec::encode_commit(header)?)?;
        self.flush()?;
        self.file.sync_data()?;
        self.committed_end = self.frontier;
        debug!("commit at {}: log is {} bytes", self.committed_end - UNIT as u64, self.frontier);
        Ok(())
    }

    /// Drop queued blocks and move the frontier back to `to`. Used to discard
    /// a cancelled transaction (back to the last commit) or a failed
    /// operation (back to the mark taken before it ran); the abandoned bytes
    /// are overwritten by subsequent appends.
    pub fn rewind(&mut self, to: u64) {
        debug_assert!(to >= self.committed_end);
        self.queue.clear();
        self.queue_start = to;
        self.frontier = to;
        self.leaf_cache.retain(|_, ptr| ptr.end() <= to);
    }

    /// Swap a freshly written log into this one's path: rename `fresh` over
    /// the primary file and adopt its file, which carries its own lock
    /// across the rename. The replaced file ends up in `fresh` and is
    /// unlocked when it drops; readers holding a [`Snapshot`] keep it
    /// readable until they drain.
    pub fn swap_in(&mut self, mut fresh: BlockLog) -> Result<()> {
        std::fs::rename(&fresh.path, &self.path)?;
        info!(
            "swapped {} into {}: {} -> {} bytes",
            fresh.path.display(),
            self.path.display(),
            self.frontier,
            fresh.frontier
        );
        std::mem::swap(&mut self.file, &mut fresh.file);
        self.frontier = fresh.frontier;
        self.queue = std::mem::take(&mut fresh.queue);
        self.queue_start = fresh.queue_start;
        self.committed_end = fresh.committed_end;
        self.leaf_cache = std::mem::take(&mut fresh.leaf_cache);
        Ok(())
    }

    /// Offset at which the next block will be enqueued.
    #[must_use]
    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    /// Bytes currently queued and not yet flushed.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.queue.len()
    }

    /// Offset just past the last durable commit.
    #[must_use]
    pub fn committed_end(&self) -> u64 {
        self.committed_end
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand out an immutable view of the committed state for lock-free
    /// readers. The snapshot owns its own file handle, so it stays readable
    /// across a vacuum swap, and its by-id reads are bounded by the commit
    /// position captured here.
    #[must_use]
    pub fn snapshot(&self, header: TreeHeader) -> Snapshot {
        let end = self.committed_end;
        let leaf_cache = self
            .leaf_cache
            .iter()
            .filter(|(_, ptr)| ptr.end() <= end)
            .map(|(&id, &ptr)| (id, ptr))
            .collect();
        Snapshot { file: Arc::clone(&self.file), header, end, leaf_cache }
    }
}

impl Drop for BlockLog {
    fn drop(&mut self) {
        // Snapshots may still share the fd; release the advisory lock now so
        // a new engine instance can take over, without closing their handle.
        let _ = fs2::FileExt::unlock(&*self.file);
    }
}

impl BlockSource for BlockLog {
    fn read_span(&self, ptr: BlockPtr) -> Result<Vec<u8>> {
        let len = ptr.len as usize;
        let mut buf = vec![0u8; len];
        if ptr.offset >= self.queue_start {
            // Still queued; blocks are enqueued whole, so the span cannot
            // straddle the flushed boundary.
            let start = (ptr.offset - self.queue_start) as usize;
            if start + len > self.queue.len() {
                return Err(Error::BadLength { len: ptr.len, size: self.queue.len().saturating_sub(start) });
            }
            buf.copy_from_slice(&self.queue[start..start + len]);
        } else {
            self.file.read_exact_at(&mut buf, ptr.offset)?;
        }
        Ok(buf)
    }
}

/// A consistent read-only view of one committed snapshot: header, file
/// handle and the commit bound for by-id scans. Cheap to clone around;
/// traversals against it never take the writer lock.
pub struct Snapshot {
    file: Arc<File>,
    pub header: TreeHeader,
    end: u64,
    leaf_cache: HashMap<u64, BlockPtr>,
}

impl Snapshot {
    /// Locate a leaf by its stable id: first the session cache, then a
    /// backward scan from the snapshot's commit position, one unit at a
    /// time, matching node headers. The bound keeps the scan from observing
    /// versions written after this snapshot was captured.
    pub fn get_node_by_id(&self, id: u64) -> Result<Node> {
        if let Some(ptr) = self.leaf_cache.get(&id) {
            return self.get_node(*ptr);
        }
        let unit = UNIT as u64;
        let mut header = [0u8; codec::NODE_HEADER_LEN];
        let mut off = self.end;
        while off >= unit {
            off -= unit;
            self.file.read_exact_at(&mut header, off)?;
            if let Some((found, len)) = codec::peek_node_header(&header)
                && found == id
            {
                let len = codec::padded(codec::NODE_HEADER_LEN + len as usize) as u32;
                return self.get_node(BlockPtr { offset: off, len });
            }
        }
        Err(Error::MissingLeaf(id))
    }
}

impl BlockSource for Snapshot {
    fn read_span(&self, ptr: BlockPtr) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; ptr.len as usize];
        self.file.read_exact_at(&mut buf, ptr.offset)?;
        Ok(buf)
    }
}
