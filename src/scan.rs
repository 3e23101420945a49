//! Lazy range scans over the leaf chain.
//!
//! A scan captures nothing at construction; on the first pull it asks the
//! gate for the then-current snapshot (one callback invocation), then streams
//! leaves by stable id along the chain. Because blocks are immutable and the
//! snapshot owns its own file handle, concurrent commits and even a vacuum
//! swap cannot change what an already-started scan yields.

use std::collections::VecDeque;

use crate::blocklog::{BlockSource, Snapshot};
use crate::errors::{Error, Result};
use crate::tree::{self, Leaf, LeafLinks, Node};
use crate::types::{Key, Value};

type CaptureFn = Box<dyn FnOnce() -> Result<Snapshot> + Send>;

/// Ordered stream of `(key, value)` pairs within `[lower, upper]`, both
/// bounds inclusive and optional. Obtained from [`crate::Engine::select`].
pub struct Scan {
    lower: Option<Key>,
    upper: Option<Key>,
    state: State,
}

enum State {
    Pending(CaptureFn),
    Streaming(Streaming),
    Done,
}

struct Streaming {
    snapshot: Snapshot,
    links: LeafLinks,
    buffered: VecDeque<(Key, Value)>,
    next_leaf: Option<u64>,
}

fn leaf_by_id(snapshot: &Snapshot, id: u64) -> Result<Leaf> {
    match snapshot.get_node_by_id(id)? {
        Node::Leaf(leaf) => Ok(leaf),
        Node::Interior(_) => Err(Error::Corrupt("leaf id resolved to an interior node")),
    }
}

impl Scan {
    pub(crate) fn new(lower: Option<Key>, upper: Option<Key>, capture: CaptureFn) -> Self {
        Self { lower, upper, state: State::Pending(capture) }
    }

    fn begin(&self, capture: CaptureFn) -> Result<Streaming> {
        let snapshot = capture()?;
        let links = snapshot.get_leaf_links(snapshot.header.leaf_links)?;
        let mut buffered = VecDeque::new();
        let next_leaf = if let Some(lower) = &self.lower {
            let leaf = tree::find_leaf(&snapshot, snapshot.header.root, lower)?;
            let next = links.next(leaf.id);
            buffered.extend(leaf.entries.into_iter().filter(|(k, _)| k >= lower));
            next
        } else if let Some(head) = links.head() {
            let leaf = leaf_by_id(&snapshot, head)?;
            let next = links.next(head);
            buffered.extend(leaf.entries);
            next
        } else {
            None
        };
        Ok(Streaming { snapshot, links, buffered, next_leaf })
    }
}

impl Iterator for Scan {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                State::Done => return None,
                State::Pending(_) => {
                    let State::Pending(capture) = std::mem::replace(&mut self.state, State::Done)
                    else {
                        unreachable!()
                    };
                    match self.begin(capture) {
                        Ok(streaming) => self.state = State::Streaming(streaming),
                        Err(e) => return Some(Err(e)),
                    }
                }
                State::Streaming(s) => {
                    if let Some((key, value)) = s.buffered.pop_front() {
                        if let Some(upper) = &self.upper
                            && &key > upper
                        {
                            self.state = State::Done;
                            return None;
                        }
                        return Some(Ok((key, value)));
                    }
                    let Some(id) = s.next_leaf else {
                        self.state = State::Done;
                        return None;
                    };
                    match leaf_by_id(&s.snapshot, id) {
                        Ok(leaf) => {
                            s.next_leaf = s.links.next(id);
                            s.buffered.extend(leaf.entries);
                        }
                        Err(e) => {
                            self.state = State::Done;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}
