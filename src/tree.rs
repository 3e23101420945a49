//! Copy-on-write B+tree over the block log.
//!
//! Mutations never touch an existing node: every changed node is rewritten at
//! the frontier and its new pointer replaces the old one in the parent, up to
//! the root. Leaves keep a stable id across content rewrites so the leaf-link
//! chain (the doubly-linked list over leaves in key order) only changes on
//! splits and merges.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::blocklog::{BlockLog, BlockSource, Snapshot};
use crate::errors::{Error, Result};
use crate::types::{BlockPtr, Key, Metadata, TreeHeader, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(Leaf),
    Interior(Interior),
}

/// Ordered `(key, value)` pairs plus the stable leaf id (never zero).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub id: u64,
    pub entries: Vec<(Key, Value)>,
}

/// `n` separator keys partitioning `n + 1` children: everything reachable
/// from child `i` is `< separators[i]`, everything from child `i + 1` is
/// `>= separators[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interior {
    pub separators: Vec<Key>,
    pub children: Vec<BlockPtr>,
}

/// Sibling pointers of one leaf; `None` marks the head or tail of the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub prev: Option<u64>,
    pub next: Option<u64>,
}

/// The doubly-linked list over all leaves in ascending key order, stored as a
/// single block and rewritten on every structural leaf change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafLinks {
    links: BTreeMap<u64, Link>,
}

impl LeafLinks {
    /// A chain holding exactly one leaf.
    #[must_use]
    pub fn single(id: u64) -> Self {
        let mut links = BTreeMap::new();
        links.insert(id, Link::default());
        Self { links }
    }

    /// The leaf with no predecessor.
    #[must_use]
    pub fn head(&self) -> Option<u64> {
        self.links.iter().find(|(_, link)| link.prev.is_none()).map(|(&id, _)| id)
    }

    #[must_use]
    pub fn next(&self, id: u64) -> Option<u64> {
        self.links.get(&id).and_then(|link| link.next)
    }

    #[must_use]
    pub fn prev(&self, id: u64) -> Option<u64> {
        self.links.get(&id).and_then(|link| link.prev)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.links.keys().copied()
    }

    /// Highest leaf id present; new ids are minted above it.
    #[must_use]
    pub fn max_id(&self) -> u64 {
        self.links.last_key_value().map_or(0, |(&id, _)| id)
    }

    /// Replace `old` by the pair `left`, `right` in chain position. The old
    /// leaf may be the head (no prev) or the tail (no next); both neighbours
    /// are repointed only when present.
    pub fn split(&mut self, old: u64, left: u64, right: u64) {
        let Link { prev, next } = self.links.remove(&old).unwrap_or_default();
        self.links.insert(left, Link { prev, next: Some(right) });
        self.links.insert(right, Link { prev: Some(left), next });
        if let Some(p) = prev
            && let Some(link) = self.links.get_mut(&p)
        {
            link.next = Some(left);
        }
        if let Some(n) = next
            && let Some(link) = self.links.get_mut(&n)
        {
            link.prev = Some(right);
        }
    }

    /// Replace the adjacent pair `left`, `right` by the single leaf `merged`.
    pub fn merge(&mut self, left: u64, right: u64, merged: u64) {
        let prev = self.links.remove(&left).unwrap_or_default().prev;
        let next = self.links.remove(&right).unwrap_or_default().next;
        self.links.insert(merged, Link { prev, next });
        if let Some(p) = prev
            && let Some(link) = self.links.get_mut(&p)
        {
            link.next = Some(merged);
        }
        if let Some(n) = next
            && let Some(link) = self.links.get_mut(&n)
        {
            link.prev = Some(merged);
        }
    }
}

/// Child to descend into: `i` while `key < separators[i]`, the last child
/// once the key is at or past every separator.
fn child_index(separators: &[Key], key: &[u8]) -> usize {
    match separators.binary_search_by(|sep| sep.as_slice().cmp(key)) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

fn leaf_underflow(capacity: usize, entries: usize) -> bool {
    entries < capacity / 2
}

fn interior_underflow(capacity: usize, children: usize) -> bool {
    children < capacity / 2
}

/// Point lookup from `root`.
pub fn search(src: &impl BlockSource, root: BlockPtr, key: &[u8]) -> Result<Option<Value>> {
    let mut ptr = root;
    loop {
        match src.get_node(ptr)? {
            Node::Leaf(leaf) => {
                return Ok(leaf
                    .entries
                    .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                    .ok()
                    .map(|i| leaf.entries[i].1.clone()));
            }
            Node::Interior(int) => ptr = int.children[child_index(&int.separators, key)],
        }
    }
}

/// Descend to the leaf owning `key` (used by range scans to find the lower
/// bound's leaf).
pub fn find_leaf(src: &impl BlockSource, root: BlockPtr, key: &[u8]) -> Result<Leaf> {
    let mut ptr = root;
    loop {
        match src.get_node(ptr)? {
            Node::Leaf(leaf) => return Ok(leaf),
            Node::Interior(int) => ptr = int.children[child_index(&int.separators, key)],
        }
    }
}

/// Write the empty tree: one empty leaf, its singleton chain, empty
/// metadata, all sealed by a commit so a header always exists.
pub fn bootstrap(log: &mut BlockLog) -> Result<TreeHeader> {
    let root = log.put_node(&Node::Leaf(Leaf { id: 1, entries: Vec::new() }))?;
    let leaf_links = log.put_leaf_links(&LeafLinks::single(1))?;
    let metadata = log.put_metadata(&Metadata::new())?;
    let header = TreeHeader { root, leaf_links, metadata };
    log.commit(&header)?;
    Ok(header)
}

struct TreeCtx {
    capacity: usize,
    links: LeafLinks,
    links_dirty: bool,
}

enum InsertOutcome {
    Updated(BlockPtr),
    Split(BlockPtr, Key, BlockPtr),
}

/// Insert or update `key`, producing the header of the new tree version.
/// The metadata pointer is carried over unchanged.
pub fn insert(
    log: &mut BlockLog,
    header: &TreeHeader,
    capacity: usize,
    key: Key,
    value: Value,
) -> Result<TreeHeader> {
    let mut ctx = TreeCtx {
        capacity,
        links: log.get_leaf_links(header.leaf_links)?,
        links_dirty: false,
    };
    let root = match insert_node(log, &mut ctx, header.root, key, value)? {
        InsertOutcome::Updated(ptr) => ptr,
        InsertOutcome::Split(left, sep, right) => log.put_node(&Node::Interior(Interior {
            separators: vec![sep],
            children: vec![left, right],
        }))?,
    };
    let leaf_links =
        if ctx.links_dirty { log.put_leaf_links(&ctx.links)? } else { header.leaf_links };
    Ok(TreeHeader { root, leaf_links, metadata: header.metadata })
}

fn insert_node(
    log: &mut BlockLog,
    ctx: &mut TreeCtx,
    ptr: BlockPtr,
    key: Key,
    value: Value,
) -> Result<InsertOutcome> {
    match log.get_node(ptr)? {
        Node::Leaf(mut leaf) => {
            match leaf.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(i) => {
                    // Update in place; same id, new version.
                    leaf.entries[i].1 = value;
                    return Ok(InsertOutcome::Updated(log.put_node(&Node::Leaf(leaf))?));
                }
                Err(i) => leaf.entries.insert(i, (key, value)),
            }
            if leaf.entries.len() < ctx.capacity {
                return Ok(InsertOutcome::Updated(log.put_node(&Node::Leaf(leaf))?));
            }
            // Full leaf: split at capacity/2, mint two fresh ids and splice
            // them into the chain where the old leaf sat.
            let mid = ctx.capacity / 2;
            let right_entries = leaf.entries.split_off(mid);
            let sep = right_entries[0].0.clone();
            let left_id = ctx.links.max_id() + 1;
            let right_id = left_id + 1;
            ctx.links.split(leaf.id, left_id, right_id);
            ctx.links_dirty = true;
            let left = log.put_node(&Node::Leaf(Leaf { id: left_id, entries: leaf.entries }))?;
            let right = log.put_node(&Node::Leaf(Leaf { id: right_id, entries: right_entries }))?;
            Ok(InsertOutcome::Split(left, sep, right))
        }
        Node::Interior(mut int) => {
            let idx = child_index(&int.separators, &key);
            match insert_node(log, ctx, int.children[idx], key, value)? {
                InsertOutcome::Updated(child) => {
                    int.children[idx] = child;
                    Ok(InsertOutcome::Updated(log.put_node(&Node::Interior(int))?))
                }
                InsertOutcome::Split(left, sep, right) => {
                    int.children[idx] = left;
                    int.separators.insert(idx, sep);
                    int.children.insert(idx + 1, right);
                    if int.separators.len() < ctx.capacity {
                        return Ok(InsertOutcome::Updated(log.put_node(&Node::Interior(int))?));
                    }
                    // Interior split: the middle key moves up, not down.
                    let mid = ctx.capacity / 2;
                    let promoted = int.separators[mid].clone();
                    let right_seps = int.separators.split_off(mid + 1);
                    int.separators.pop();
                    let right_children = int.children.split_off(mid + 1);
                    let left_ptr = log.put_node(&Node::Interior(int))?;
                    let right_ptr = log.put_node(&Node::Interior(Interior {
                        separators: right_seps,
                        children: right_children,
                    }))?;
                    Ok(InsertOutcome::Split(left_ptr, promoted, right_ptr))
                }
            }
        }
    }
}

enum RemoveOutcome {
    NotFound,
    Done(BlockPtr),
    /// Node fell below its fill bound; content is handed up unwritten so the
    /// parent can rotate or merge before anything lands in the log.
    Underflow(Node),
}

/// Remove `key` if present. `Ok(None)` means the key was absent and nothing
/// was written; the caller treats that as success.
pub fn remove(
    log: &mut BlockLog,
    header: &TreeHeader,
    capacity: usize,
    key: &[u8],
) -> Result<Option<TreeHeader>> {
    let mut ctx = TreeCtx {
        capacity,
        links: log.get_leaf_links(header.leaf_links)?,
        links_dirty: false,
    };
    let root = match remove_node(log, &mut ctx, header.root, key)? {
        RemoveOutcome::NotFound => return Ok(None),
        RemoveOutcome::Done(ptr) => ptr,
        // The root is exempt from fill bounds; an interior root left with a
        // single child collapses onto it.
        RemoveOutcome::Underflow(Node::Interior(int)) if int.separators.is_empty() => {
            int.children[0]
        }
        RemoveOutcome::Underflow(node) => log.put_node(&node)?,
    };
    let leaf_links =
        if ctx.links_dirty { log.put_leaf_links(&ctx.links)? } else { header.leaf_links };
    Ok(Some(TreeHeader { root, leaf_links, metadata: header.metadata }))
}

fn remove_node(
    log: &mut BlockLog,
    ctx: &mut TreeCtx,
    ptr: BlockPtr,
    key: &[u8],
) -> Result<RemoveOutcome> {
    match log.get_node(ptr)? {
        Node::Leaf(mut leaf) => {
            let Ok(i) = leaf.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) else {
                return Ok(RemoveOutcome::NotFound);
            };
            leaf.entries.remove(i);
            if leaf_underflow(ctx.capacity, leaf.entries.len()) {
                Ok(RemoveOutcome::Underflow(Node::Leaf(leaf)))
            } else {
                Ok(RemoveOutcome::Done(log.put_node(&Node::Leaf(leaf))?))
            }
        }
        Node::Interior(mut int) => {
            let idx = child_index(&int.separators, key);
            match remove_node(log, ctx, int.children[idx], key)? {
                RemoveOutcome::NotFound => Ok(RemoveOutcome::NotFound),
                RemoveOutcome::Done(child) => {
                    int.children[idx] = child;
                    Ok(RemoveOutcome::Done(log.put_node(&Node::Interior(int))?))
                }
                RemoveOutcome::Underflow(child) => {
                    rebalance(log, ctx, &mut int, idx, child)?;
                    if interior_underflow(ctx.capacity, int.children.len()) {
                        Ok(RemoveOutcome::Underflow(Node::Interior(int)))
                    } else {
                        Ok(RemoveOutcome::Done(log.put_node(&Node::Interior(int))?))
                    }
                }
            }
        }
    }
}

/// Restore the fill bound of `int.children[idx]` (content in `child`, not yet
/// written) against a sibling: borrow one element when the sibling is above
/// its minimum, merge the two nodes otherwise. The right sibling is preferred
/// when one exists.
fn rebalance(
    log: &mut BlockLog,
    ctx: &mut TreeCtx,
    int: &mut Interior,
    idx: usize,
    child: Node,
) -> Result<()> {
    let from_right = idx + 1 < int.children.len();
    let sib_idx = if from_right { idx + 1 } else { idx - 1 };
    let sibling = log.get_node(int.children[sib_idx])?;
    match (child, sibling) {
        (Node::Leaf(mut child), Node::Leaf(mut sibling)) => {
            if sibling.entries.len() > ctx.capacity / 2 {
                // Rotate one pair across the boundary; ids are stable so the
                // chain is untouched, only the separator moves.
                if from_right {
                    child.entries.push(sibling.entries.remove(0));
                    int.separators[idx] = sibling.entries[0].0.clone();
                } else {
                    let moved = sibling.entries.pop().unwrap();
                    int.separators[idx - 1] = moved.0.clone();
                    child.entries.insert(0, moved);
                }
                int.children[idx] = log.put_node(&Node::Leaf(child))?;
                int.children[sib_idx] = log.put_node(&Node::Leaf(sibling))?;
            } else {
                let (mut left, right, li) = if from_right {
                    (child, sibling, idx)
                } else {
                    (sibling, child, sib_idx)
                };
                let merged_id = ctx.links.max_id() + 1;
                ctx.links.merge(left.id, right.id, merged_id);
                ctx.links_dirty = true;
                left.entries.extend(right.entries);
                let merged =
                    log.put_node(&Node::Leaf(Leaf { id: merged_id, entries: left.entries }))?;
                int.separators.remove(li);
                int.children.remove(li + 1);
                int.children[li] = merged;
            }
        }
        (Node::Interior(mut child), Node::Interior(mut sibling)) => {
            if sibling.children.len() > ctx.capacity / 2 {
                // Rotate through the parent: its separator comes down, the
                // sibling's edge key goes up, one child pointer moves over.
                if from_right {
                    child.separators.push(int.separators[idx].clone());
                    child.children.push(sibling.children.remove(0));
                    int.separators[idx] = sibling.separators.remove(0);
                } else {
                    child.separators.insert(0, int.separators[idx - 1].clone());
                    child.children.insert(0, sibling.children.pop().unwrap());
                    int.separators[idx - 1] = sibling.separators.pop().unwrap();
                }
                int.children[idx] = log.put_node(&Node::Interior(child))?;
                int.children[sib_idx] = log.put_node(&Node::Interior(sibling))?;
            } else {
                let (mut left, right, li) = if from_right {
                    (child, sibling, idx)
                } else {
                    (sibling, child, sib_idx)
                };
                left.separators.push(int.separators[li].clone());
                left.separators.extend(right.separators);
                left.children.extend(right.children);
                let merged = log.put_node(&Node::Interior(left))?;
                int.separators.remove(li);
                int.children.remove(li + 1);
                int.children[li] = merged;
            }
        }
        _ => return Err(Error::Corrupt("siblings at the same depth differ in kind")),
    }
    Ok(())
}

const COPY_FLUSH_BYTES: usize = 256 * 1024;

/// Re-append the live tree of `src` into `dst` in post-order, rewriting child
/// pointers as new positions are assigned. Leaf ids are preserved, so the
/// chain and metadata blocks carry over as-is. Commits `dst` and returns its
/// header.
pub fn copy_tree(src: &Snapshot, dst: &mut BlockLog) -> Result<TreeHeader> {
    let root = copy_node(src, dst, src.header.root)?;
    let links = src.get_leaf_links(src.header.leaf_links)?;
    let leaf_links = dst.put_leaf_links(&links)?;
    let metadata_pairs = src.get_metadata(src.header.metadata)?;
    let metadata = dst.put_metadata(&metadata_pairs)?;
    let header = TreeHeader { root, leaf_links, metadata };
    dst.commit(&header)?;
    Ok(header)
}

fn copy_node(src: &Snapshot, dst: &mut BlockLog, ptr: BlockPtr) -> Result<BlockPtr> {
    let new_ptr = match src.get_node(ptr)? {
        Node::Leaf(leaf) => dst.put_node(&Node::Leaf(leaf))?,
        Node::Interior(mut int) => {
            for child in &mut int.children {
                *child = copy_node(src, dst, *child)?;
            }
            dst.put_node(&Node::Interior(int))?
        }
    };
    if dst.queued_bytes() >= COPY_FLUSH_BYTES {
        dst.flush()?;
    }
    Ok(new_ptr)
}
