//! The engine: single-writer gate, transactions and the public operations.
//!
//! One `parking_lot::Mutex` serialises every mutating and gating operation.
//! The writer owns the block log, the committed `current` header, the pending
//! transaction (at most one) and the commit generation counter. Readers take
//! the lock only long enough to capture a snapshot and then traverse the
//! immutable block graph on their own file handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::blocklog::{BlockLog, BlockSource, Snapshot};
use crate::errors::{Error, Result};
use crate::scan::Scan;
use crate::tree;
use crate::types::{CallerId, Key, Metadata, TreeHeader, Value};
use crate::vacuum;

/// Primary store file inside the configured directory.
pub const DB_FILE: &str = "db.monsoon";

/// An open store. Cloning is cheap and shares the underlying engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    capacity: usize,
    gen_limit: u64,
    writer: Mutex<Writer>,
}

struct Writer {
    log: BlockLog,
    current: TreeHeader,
    tx: Option<Tx>,
    generation: u64,
}

struct Tx {
    holder: CallerId,
    header: TreeHeader,
}

impl Engine {
    /// Open (or create) the store in `dir`. `capacity` is the node branching
    /// factor, fixed per handle: even and at least 4. `gen_limit` is the
    /// number of commits after which a vacuum is attempted.
    ///
    /// # Errors
    /// `InvalidCapacity` for a bad branching factor, `LockBusy` when another
    /// engine instance owns the store file.
    pub fn open(dir: impl AsRef<Path>, capacity: usize, gen_limit: u64) -> Result<Self> {
        if capacity < 4 || capacity % 2 != 0 {
            return Err(Error::InvalidCapacity(capacity));
        }
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(DB_FILE);
        let (mut log, found) = BlockLog::open(&path)?;
        let current = match found {
            Some(header) => {
                info!("opened store at {}: recovered last commit", path.display());
                header
            }
            None => {
                info!("opened store at {}: initializing fresh tree", path.display());
                tree::bootstrap(&mut log)?
            }
        };
        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                capacity,
                gen_limit,
                writer: Mutex::new(Writer { log, current, tx: None, generation: 0 }),
            }),
        })
    }

    /// Insert or update one pair. Outside a transaction the change commits
    /// durably before this returns; inside one it becomes visible to other
    /// callers only at `end_transaction`.
    pub fn put(&self, caller: CallerId, key: Key, value: Value) -> Result<()> {
        self.mutate(caller, move |log, header, capacity| {
            tree::insert(log, header, capacity, key, value).map(Some)
        })
    }

    /// Remove one key. Removing an absent key succeeds without writing.
    pub fn remove(&self, caller: CallerId, key: Key) -> Result<()> {
        self.mutate(caller, move |log, header, capacity| {
            tree::remove(log, header, capacity, &key)
        })
    }

    /// Point lookup against the caller's view: the pending transaction
    /// header for its holder, the committed state for everyone else.
    pub fn get(&self, caller: CallerId, key: &[u8]) -> Result<Option<Value>> {
        let snapshot = self.view(caller);
        tree::search(&snapshot, snapshot.header.root, key)
    }

    /// Replace the metadata block.
    pub fn put_metadata(&self, caller: CallerId, pairs: Metadata) -> Result<()> {
        self.mutate(caller, move |log, header, _capacity| {
            let metadata = log.put_metadata(&pairs)?;
            Ok(Some(TreeHeader { metadata, ..*header }))
        })
    }

    pub fn get_metadata(&self, caller: CallerId) -> Result<Metadata> {
        let snapshot = self.view(caller);
        snapshot.get_metadata(snapshot.header.metadata)
    }

    /// Lazy range scan over `[lower, upper]`, either side open when absent.
    /// The snapshot is captured from the committed state at the first pull;
    /// later commits and vacuums do not affect an already-started scan.
    #[must_use]
    pub fn select(&self, lower: Option<Key>, upper: Option<Key>) -> Scan {
        let inner = Arc::clone(&self.inner);
        Scan::new(
            lower,
            upper,
            Box::new(move || {
                let w = inner.writer.lock();
                Ok(w.log.snapshot(w.current))
            }),
        )
    }

    /// Begin a transaction for `caller`: a private header seeded from the
    /// committed state that its writes mutate in place of `current`.
    pub fn start_transaction(&self, caller: CallerId) -> Result<()> {
        let mut w = self.inner.writer.lock();
        match &w.tx {
            Some(tx) if tx.holder == caller => Err(Error::TxAlreadyStarted),
            Some(_) => Err(Error::TxOccupied),
            None => {
                debug!("transaction started by {:?}", caller.0);
                w.tx = Some(Tx { holder: caller, header: w.current });
                Ok(())
            }
        }
    }

    /// Publish the caller's transaction: commit its header durably and make
    /// it the current state.
    pub fn end_transaction(&self, caller: CallerId) -> Result<()> {
        let mut w = self.inner.writer.lock();
        let w = &mut *w;
        match w.tx.take() {
            Some(tx) if tx.holder == caller => {
                let mark = w.log.frontier();
                match w.log.commit(&tx.header) {
                    Ok(()) => {
                        debug!("transaction committed by {:?}", caller.0);
                        w.current = tx.header;
                        w.generation += 1;
                        self.maybe_vacuum(w);
                        Ok(())
                    }
                    Err(e) => {
                        w.log.rewind(mark);
                        w.tx = Some(tx);
                        Err(e)
                    }
                }
            }
            other => {
                w.tx = other;
                Err(Error::TxNotHolder)
            }
        }
    }

    /// Discard the caller's transaction. The blocks it appended are abandoned
    /// and will be overwritten by subsequent appends.
    pub fn cancel_transaction(&self, caller: CallerId) -> Result<()> {
        let mut w = self.inner.writer.lock();
        let w = &mut *w;
        match w.tx.take() {
            Some(tx) if tx.holder == caller => {
                debug!("transaction cancelled by {:?}", caller.0);
                let end = w.log.committed_end();
                w.log.rewind(end);
                Ok(())
            }
            other => {
                w.tx = other;
                Err(Error::TxNotHolder)
            }
        }
    }

    /// Liveness notification from the dispatcher: the caller is gone. If it
    /// holds the open transaction, the transaction is discarded silently.
    pub fn caller_terminated(&self, caller: CallerId) {
        let mut w = self.inner.writer.lock();
        let w = &mut *w;
        if matches!(&w.tx, Some(tx) if tx.holder == caller) {
            info!("transaction holder {:?} lost; discarding transaction", caller.0);
            w.tx = None;
            let end = w.log.committed_end();
            w.log.rewind(end);
        }
    }

    /// Capture the committed snapshot, for readers that traverse on their
    /// own (shared block source plus a copy of the current header).
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let w = self.inner.writer.lock();
        w.log.snapshot(w.current)
    }

    fn view(&self, caller: CallerId) -> Snapshot {
        let w = self.inner.writer.lock();
        let header = match &w.tx {
            Some(tx) if tx.holder == caller => tx.header,
            _ => w.current,
        };
        w.log.snapshot(header)
    }

    /// The single write path: route the mutation to the transaction header
    /// for its holder, reject other callers while a transaction is open, or
    /// commit immediately when none is. A closure returning `None` made no
    /// change and neither flushes nor commits.
    fn mutate<F>(&self, caller: CallerId, op: F) -> Result<()>
    where
        F: FnOnce(&mut BlockLog, &TreeHeader, usize) -> Result<Option<TreeHeader>>,
    {
        let mut w = self.inner.writer.lock();
        let w = &mut *w;
        match &mut w.tx {
            Some(tx) if tx.holder == caller => {
                let mark = w.log.frontier();
                let flushed = op(&mut w.log, &tx.header, self.inner.capacity)
                    .and_then(|header| match header {
                        Some(header) => {
                            w.log.flush()?;
                            Ok(Some(header))
                        }
                        None => Ok(None),
                    });
                match flushed {
                    Ok(Some(header)) => {
                        tx.header = header;
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => {
                        w.log.rewind(mark);
                        Err(e)
                    }
                }
            }
            Some(_) => Err(Error::TxNotHolder),
            None => {
                let mark = w.log.frontier();
                let committed = op(&mut w.log, &w.current, self.inner.capacity)
                    .and_then(|header| match header {
                        Some(header) => {
                            w.log.commit(&header)?;
                            Ok(Some(header))
                        }
                        None => Ok(None),
                    });
                match committed {
                    Ok(Some(header)) => {
                        w.current = header;
                        w.generation += 1;
                        self.maybe_vacuum(w);
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => {
                        w.log.rewind(mark);
                        Err(e)
                    }
                }
            }
        }
    }

    /// After a commit: compact once the generation counter passes the limit
    /// and no transaction is in flight. The triggering operation has already
    /// committed, so a failed vacuum is logged and retried after the next
    /// commit instead of failing the caller.
    fn maybe_vacuum(&self, w: &mut Writer) {
        if w.generation > self.inner.gen_limit && w.tx.is_none() {
            match vacuum::run(&self.inner.dir, &mut w.log, &w.current) {
                Ok(header) => {
                    w.current = header;
                    w.generation = 0;
                }
                Err(e) => error!("vacuum failed; keeping current log: {e}"),
            }
        }
    }
}
