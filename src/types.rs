use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Keys are arbitrary byte strings ordered lexicographically.
pub type Key = Vec<u8>;

/// Values are opaque byte strings.
pub type Value = Vec<u8>;

/// Store metadata: an ordered list of named binary values, kept as a single block.
pub type Metadata = Vec<(String, Vec<u8>)>;

/// Locates a block in the log as a byte span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPtr {
    pub offset: u64,
    pub len: u32,
}

impl BlockPtr {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.len)
    }
}

/// The complete description of one committed snapshot: the tree root, the
/// leaf-link block, and the metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    pub root: BlockPtr,
    pub leaf_links: BlockPtr,
    pub metadata: BlockPtr,
}

/// Opaque caller identity supplied by the dispatcher; transactions are gated
/// on it and discarded when the dispatcher reports the caller gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(pub Uuid);

impl CallerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallerId {
    fn default() -> Self {
        Self::new()
    }
}
