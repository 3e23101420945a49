#![allow(dead_code)]

// Shared helpers: key/value builders and the structural invariant checker
// used after committed operations.

use monsoon::blocklog::BlockSource;
use monsoon::tree::{Leaf, Node};
use monsoon::types::{BlockPtr, Key, TreeHeader, Value};

/// Big-endian integer key, so numeric order matches byte order.
pub fn k(n: u64) -> Key {
    n.to_be_bytes().to_vec()
}

pub fn v(s: &str) -> Value {
    s.as_bytes().to_vec()
}

pub fn vn(n: u64) -> Value {
    format!("v{n}").into_bytes()
}

pub fn keys_of(leaf: &Leaf) -> Vec<Key> {
    leaf.entries.iter().map(|(key, _)| key.clone()).collect()
}

/// All pairs in key order, by in-order tree traversal.
pub fn collect(src: &impl BlockSource, header: &TreeHeader) -> Vec<(Key, Value)> {
    let mut pairs = Vec::new();
    collect_walk(src, header.root, &mut pairs);
    pairs
}

fn collect_walk(src: &impl BlockSource, ptr: BlockPtr, pairs: &mut Vec<(Key, Value)>) {
    match src.get_node(ptr).unwrap() {
        Node::Leaf(leaf) => pairs.extend(leaf.entries),
        Node::Interior(int) => {
            for child in &int.children {
                collect_walk(src, *child, pairs);
            }
        }
    }
}

/// Assert every structural invariant of a committed tree: strict key order,
/// fill bounds with the root exempt, equal root-to-leaf depths, separator
/// partitioning, and a leaf chain that is a permutation of the reachable
/// leaves in in-order sequence with mirrored prev/next pointers.
pub fn check_invariants(src: &impl BlockSource, header: &TreeHeader, capacity: usize) {
    let mut leaves = Vec::new();
    walk(src, header.root, true, capacity, &mut leaves);

    let keys: Vec<&Key> =
        leaves.iter().flat_map(|leaf| leaf.entries.iter().map(|(key, _)| key)).collect();
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "keys not strictly increasing: {:?} !< {:?}", pair[0], pair[1]);
    }

    let links = src.get_leaf_links(header.leaf_links).unwrap();
    assert_eq!(links.len(), leaves.len(), "chain size differs from reachable leaf count");
    let mut chain = Vec::new();
    let mut cursor = links.head();
    while let Some(id) = cursor {
        chain.push(id);
        cursor = links.next(id);
    }
    let in_order: Vec<u64> = leaves.iter().map(|leaf| leaf.id).collect();
    assert_eq!(chain, in_order, "chain order differs from in-order leaf traversal");
    if let Some(&first) = chain.first() {
        assert_eq!(links.prev(first), None, "head leaf has a predecessor");
    }
    for pair in chain.windows(2) {
        assert_eq!(links.prev(pair[1]), Some(pair[0]), "prev does not mirror next");
    }
    if let Some(&last) = chain.last() {
        assert_eq!(links.next(last), None, "tail leaf has a successor");
    }
}

fn walk(
    src: &impl BlockSource,
    ptr: BlockPtr,
    is_root: bool,
    capacity: usize,
    leaves: &mut Vec<Leaf>,
) -> (usize, Option<Key>, Option<Key>) {
    match src.get_node(ptr).unwrap() {
        Node::Leaf(leaf) => {
            assert!(leaf.entries.len() <= capacity - 1, "leaf overflow: {}", leaf.entries.len());
            if !is_root {
                assert!(
                    leaf.entries.len() >= capacity / 2,
                    "leaf underflow: {}",
                    leaf.entries.len()
                );
            }
            for pair in leaf.entries.windows(2) {
                assert!(pair[0].0 < pair[1].0, "leaf entries out of order");
            }
            let min = leaf.entries.first().map(|(key, _)| key.clone());
            let max = leaf.entries.last().map(|(key, _)| key.clone());
            leaves.push(leaf);
            (1, min, max)
        }
        Node::Interior(int) => {
            assert_eq!(int.children.len(), int.separators.len() + 1);
            assert!(int.children.len() <= capacity, "interior overflow");
            if is_root {
                assert!(int.children.len() >= 2, "interior root without separator");
            } else {
                assert!(int.children.len() >= capacity / 2, "interior underflow");
            }
            for pair in int.separators.windows(2) {
                assert!(pair[0] < pair[1], "separators out of order");
            }
            let mut depth = None;
            let mut min_all = None;
            let mut max_all = None;
            for (i, child) in int.children.iter().enumerate() {
                let (d, min, max) = walk(src, *child, false, capacity, leaves);
                match depth {
                    None => depth = Some(d),
                    Some(d0) => assert_eq!(d0, d, "leaf depth varies across subtrees"),
                }
                if i == 0 {
                    min_all = min.clone();
                }
                max_all = max.clone().or(max_all);
                if i < int.separators.len()
                    && let Some(max) = &max
                {
                    assert!(max < &int.separators[i], "child max not below separator");
                }
                if i > 0
                    && let Some(min) = &min
                {
                    assert!(min >= &int.separators[i - 1], "child min below separator");
                }
            }
            (depth.unwrap() + 1, min_all, max_all)
        }
    }
}
