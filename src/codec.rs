//! Block codec: typed headers plus bincode payloads.
//!
//! Every block is a whole number of 1024-byte units and opens with a 16-bit
//! magic naming its kind. Header integers are big-endian; payloads are
//! bincode-encoded values. Decoding validates the magic and the payload
//! bounds and fails with a typed error on mismatch.

use bincode::config::standard;
use bincode::serde::{decode_from_slice, encode_to_vec};

use crate::errors::{Error, Result};
use crate::tree::{Interior, Leaf, LeafLinks, Node};
use crate::types::{BlockPtr, Key, Metadata, TreeHeader, Value};

/// Allocation unit of the log; all blocks are padded to a multiple of this.
pub const UNIT: usize = 1024;

pub const MAGIC_COMMIT: u16 = 0xFAFA;
pub const MAGIC_NODE: u16 = 0xFBFB;
pub const MAGIC_LINKS: u16 = 0xFCFC;
pub const MAGIC_META: u16 = 0xFDFD;

/// Node blocks: magic, 64-bit leaf id (zero for interior nodes), payload length.
pub const NODE_HEADER_LEN: usize = 2 + 8 + 4;

/// Leaf-link and metadata blocks: magic, payload length.
pub const BLOB_HEADER_LEN: usize = 2 + 4;

/// Commit blocks: magic, then three (offset, length) pointer pairs.
pub const COMMIT_HEADER_LEN: usize = 2 + 3 * 8;

/// Round `len` up to a whole number of units.
#[must_use]
pub fn padded(len: usize) -> usize {
    len.div_ceil(UNIT) * UNIT
}

fn fit_u32(n: u64) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::PtrOverflow(n))
}

fn check_magic(bytes: &[u8], expected: u16) -> Result<()> {
    if bytes.len() < 2 {
        return Err(Error::BadLength { len: 0, size: bytes.len() });
    }
    let found = u16::from_be_bytes([bytes[0], bytes[1]]);
    if found != expected {
        return Err(Error::BadMagic { expected, found });
    }
    Ok(())
}

fn payload<'a>(bytes: &'a [u8], header_len: usize, len_at: usize) -> Result<&'a [u8]> {
    if bytes.len() < header_len {
        return Err(Error::BadLength { len: 0, size: bytes.len() });
    }
    let len = u32::from_be_bytes(bytes[len_at..len_at + 4].try_into().unwrap());
    let end = header_len + len as usize;
    if end > bytes.len() {
        return Err(Error::BadLength { len, size: bytes.len() });
    }
    Ok(&bytes[header_len..end])
}

/// Encode a leaf or interior node into a padded block. The header carries the
/// leaf id so leaves can later be found by a backward id scan; interior nodes
/// store id zero.
pub fn encode_node(node: &Node) -> Result<Vec<u8>> {
    let (id, body) = match node {
        Node::Leaf(leaf) => (leaf.id, encode_to_vec(&leaf.entries, standard())?),
        Node::Interior(int) => {
            (0, encode_to_vec((&int.separators, &int.children), standard())?)
        }
    };
    let len = fit_u32(body.len() as u64)?;
    let mut block = Vec::with_capacity(padded(NODE_HEADER_LEN + body.len()));
    block.extend_from_slice(&MAGIC_NODE.to_be_bytes());
    block.extend_from_slice(&id.to_be_bytes());
    block.extend_from_slice(&len.to_be_bytes());
    block.extend_from_slice(&body);
    block.resize(padded(block.len()), 0);
    Ok(block)
}

pub fn decode_node(bytes: &[u8]) -> Result<Node> {
    check_magic(bytes, MAGIC_NODE)?;
    if bytes.len() < NODE_HEADER_LEN {
        return Err(Error::BadLength { len: 0, size: bytes.len() });
    }
    let id = u64::from_be_bytes(bytes[2..10].try_into().unwrap());
    let body = payload(bytes, NODE_HEADER_LEN, 10)?;
    if id == 0 {
        let ((separators, children), _): ((Vec<Key>, Vec<BlockPtr>), usize) =
            decode_from_slice(body, standard())?;
        Ok(Node::Interior(Interior { separators, children }))
    } else {
        let (entries, _): (Vec<(Key, Value)>, usize) = decode_from_slice(body, standard())?;
        Ok(Node::Leaf(Leaf { id, entries }))
    }
}

/// Peek at a node header without decoding the payload. Returns the leaf id
/// and payload length when the bytes open with the node magic.
#[must_use]
pub fn peek_node_header(bytes: &[u8; NODE_HEADER_LEN]) -> Option<(u64, u32)> {
    if u16::from_be_bytes([bytes[0], bytes[1]]) != MAGIC_NODE {
        return None;
    }
    let id = u64::from_be_bytes(bytes[2..10].try_into().unwrap());
    let len = u32::from_be_bytes(bytes[10..14].try_into().unwrap());
    Some((id, len))
}

fn encode_blob(magic: u16, body: Vec<u8>) -> Result<Vec<u8>> {
    let len = fit_u32(body.len() as u64)?;
    let mut block = Vec::with_capacity(padded(BLOB_HEADER_LEN + body.len()));
    block.extend_from_slice(&magic.to_be_bytes());
    block.extend_from_slice(&len.to_be_bytes());
    block.extend_from_slice(&body);
    block.resize(padded(block.len()), 0);
    Ok(block)
}

pub fn encode_leaf_links(links: &LeafLinks) -> Result<Vec<u8>> {
    encode_blob(MAGIC_LINKS, encode_to_vec(links, standard())?)
}

pub fn decode_leaf_links(bytes: &[u8]) -> Result<LeafLinks> {
    check_magic(bytes, MAGIC_LINKS)?;
    let (links, _) = decode_from_slice(payload(bytes, BLOB_HEADER_LEN, 2)?, standard())?;
    Ok(links)
}

pub fn encode_metadata(metadata: &Metadata) -> Result<Vec<u8>> {
    encode_blob(MAGIC_META, encode_to_vec(metadata, standard())?)
}

pub fn decode_metadata(bytes: &[u8]) -> Result<Metadata> {
    check_magic(bytes, MAGIC_META)?;
    let (metadata, _) = decode_from_slice(payload(bytes, BLOB_HEADER_LEN, 2)?, standard())?;
    Ok(metadata)
}

fn put_ptr(block: &mut Vec<u8>, ptr: BlockPtr) -> Result<()> {
    block.extend_from_slice(&fit_u32(ptr.offset)?.to_be_bytes());
    block.extend_from_slice(&ptr.len.to_be_bytes());
    Ok(())
}

/// Encode a commit block naming the three pointers of a snapshot header.
/// Commit blocks are exactly one unit.
pub fn encode_commit(header: &TreeHeader) -> Result<Vec<u8>> {
    let mut block = Vec::with_capacity(UNIT);
    block.extend_from_slice(&MAGIC_COMMIT.to_be_bytes());
    put_ptr(&mut block, header.root)?;
    put_ptr(&mut block, header.leaf_links)?;
    put_ptr(&mut block, header.metadata)?;
    block.resize(UNIT, 0);
    Ok(block)
}

fn get_ptr(bytes: &[u8], at: usize) -> BlockPtr {
    BlockPtr {
        offset: u64::from(u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap())),
        len: u32::from_be_bytes(bytes[at + 4..at + 8].try_into().unwrap()),
    }
}

fn plausible_ptr(ptr: BlockPtr, commit_at: u64) -> bool {
    ptr.len > 0
        && ptr.len as usize % UNIT == 0
        && ptr.offset % UNIT as u64 == 0
        && ptr.end() <= commit_at
}

/// Try to read `bytes` as a commit block sitting at offset `at` in the log.
///
/// The backward recovery scan steps over arbitrary block interiors, so a
/// matching magic alone is not trusted: the three pointers must be
/// unit-aligned, unit-sized spans that lie entirely before the commit block
/// itself. Anything else is treated as a payload coincidence.
#[must_use]
pub fn try_decode_commit(bytes: &[u8], at: u64) -> Option<TreeHeader> {
    if bytes.len() < COMMIT_HEADER_LEN {
        return None;
    }
    if u16::from_be_bytes([bytes[0], bytes[1]]) != MAGIC_COMMIT {
        return None;
    }
    let header = TreeHeader {
        root: get_ptr(bytes, 2),
        leaf_links: get_ptr(bytes, 10),
        metadata: get_ptr(bytes, 18),
    };
    let ok = plausible_ptr(header.root, at)
        && plausible_ptr(header.leaf_links, at)
        && plausible_ptr(header.metadata, at);
    ok.then_some(header)
}
