use monsoon::codec::{self, UNIT};
use monsoon::errors::Error;
use monsoon::tree::{Interior, Leaf, LeafLinks, Node};
use monsoon::types::{BlockPtr, Metadata, TreeHeader};

mod common;
use common::{k, v};

#[test]
fn test_leaf_block_roundtrip() {
    let leaf = Node::Leaf(Leaf {
        id: 7,
        entries: vec![(k(1), v("one")), (k(2), v("two"))],
    });
    let block = codec::encode_node(&leaf).unwrap();
    assert_eq!(block.len() % UNIT, 0);
    assert_eq!(codec::decode_node(&block).unwrap(), leaf);
}

#[test]
fn test_interior_block_roundtrip() {
    let interior = Node::Interior(Interior {
        separators: vec![k(10), k(20)],
        children: vec![
            BlockPtr { offset: 0, len: 1024 },
            BlockPtr { offset: 1024, len: 2048 },
            BlockPtr { offset: 4096, len: 1024 },
        ],
    });
    let block = codec::encode_node(&interior).unwrap();
    assert_eq!(codec::decode_node(&block).unwrap(), interior);
}

#[test]
fn test_leaf_links_roundtrip() {
    let mut links = LeafLinks::single(1);
    links.split(1, 2, 3);
    let block = codec::encode_leaf_links(&links).unwrap();
    assert_eq!(block.len() % UNIT, 0);
    assert_eq!(codec::decode_leaf_links(&block).unwrap(), links);
}

#[test]
fn test_metadata_roundtrip() {
    let metadata: Metadata =
        vec![("owner".to_string(), v("alice")), ("version".to_string(), vec![0, 1])];
    let block = codec::encode_metadata(&metadata).unwrap();
    assert_eq!(codec::decode_metadata(&block).unwrap(), metadata);
}

#[test]
fn test_magic_mismatch_is_typed() {
    let leaf = Node::Leaf(Leaf { id: 1, entries: vec![(k(1), v("x"))] });
    let block = codec::encode_node(&leaf).unwrap();
    let err = codec::decode_leaf_links(&block).unwrap_err();
    assert!(matches!(err, Error::BadMagic { expected: 0xFCFC, found: 0xFBFB }));
}

#[test]
fn test_node_header_peek() {
    let leaf = Node::Leaf(Leaf { id: 42, entries: vec![(k(9), v("nine"))] });
    let block = codec::encode_node(&leaf).unwrap();
    let header: [u8; codec::NODE_HEADER_LEN] =
        block[..codec::NODE_HEADER_LEN].try_into().unwrap();
    let (id, _) = codec::peek_node_header(&header).unwrap();
    assert_eq!(id, 42);

    let links = codec::encode_leaf_links(&LeafLinks::single(1)).unwrap();
    let header: [u8; codec::NODE_HEADER_LEN] =
        links[..codec::NODE_HEADER_LEN].try_into().unwrap();
    assert!(codec::peek_node_header(&header).is_none());
}

#[test]
fn test_commit_block_roundtrip() {
    let header = TreeHeader {
        root: BlockPtr { offset: 2048, len: 1024 },
        leaf_links: BlockPtr { offset: 3072, len: 1024 },
        metadata: BlockPtr { offset: 4096, len: 1024 },
    };
    let block = codec::encode_commit(&header).unwrap();
    assert_eq!(block.len(), UNIT);
    assert_eq!(codec::try_decode_commit(&block, 5120), Some(header));
}

#[test]
fn test_commit_scan_rejects_implausible_pointers() {
    let header = TreeHeader {
        root: BlockPtr { offset: 2048, len: 1024 },
        leaf_links: BlockPtr { offset: 3072, len: 1024 },
        metadata: BlockPtr { offset: 4096, len: 1024 },
    };
    let block = codec::encode_commit(&header).unwrap();
    // Pointers reaching past the commit block itself are a payload
    // coincidence, not a commit.
    assert_eq!(codec::try_decode_commit(&block, 4096), None);

    let unaligned = TreeHeader {
        root: BlockPtr { offset: 100, len: 1024 },
        leaf_links: BlockPtr { offset: 3072, len: 1024 },
        metadata: BlockPtr { offset: 4096, len: 1024 },
    };
    let block = codec::encode_commit(&unaligned).unwrap();
    assert_eq!(codec::try_decode_commit(&block, 8192), None);

    let wrong_magic = codec::encode_metadata(&Metadata::new()).unwrap();
    assert_eq!(codec::try_decode_commit(&wrong_magic, 8192), None);
}
