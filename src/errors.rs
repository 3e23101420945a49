use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store file is locked by another engine instance")]
    LockBusy,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("bad block magic: expected {expected:#06x}, found {found:#06x}")]
    BadMagic { expected: u16, found: u16 },

    #[error("block payload length {len} exceeds block size {size}")]
    BadLength { len: u32, size: usize },

    #[error("offset or length {0} does not fit the 32-bit on-disk pointer format")]
    PtrOverflow(u64),

    #[error("capacity {0} is invalid: must be even and at least 4")]
    InvalidCapacity(usize),

    #[error("a transaction is in flight and the caller does not hold it")]
    TxNotHolder,

    #[error("caller already holds the open transaction")]
    TxAlreadyStarted,

    #[error("another caller holds the open transaction")]
    TxOccupied,

    #[error("write queue starts at {queued} but the log frontier is at {frontier}")]
    WrongWritePosition { queued: u64, frontier: u64 },

    #[error("leaf {0} not found in the log")]
    MissingLeaf(u64),

    #[error("tree invariant violated: {0}")]
    Corrupt(&'static str),
}
