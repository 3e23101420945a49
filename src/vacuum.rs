//! Compaction: rewrite the live snapshot into a fresh log and swap it in.

use std::path::Path;

use log::info;

use crate::blocklog::BlockLog;
use crate::errors::Result;
use crate::tree;
use crate::types::TreeHeader;

/// Vacuum scratch file, created in the store directory and renamed over the
/// primary on completion.
pub const TMP_FILE: &str = "tmp.monsoon";

/// Copy the live tree under `header` into a fresh log and atomically replace
/// the primary file with it. On error before the swap the primary is
/// untouched and the scratch file is simply left behind for the next attempt
/// to truncate. Returns the header of the compacted log.
pub fn run(dir: &Path, log: &mut BlockLog, header: &TreeHeader) -> Result<TreeHeader> {
    let before = log.frontier();
    let mut fresh = BlockLog::create(&dir.join(TMP_FILE))?;
    let new_header = tree::copy_tree(&log.snapshot(*header), &mut fresh)?;
    let after = fresh.frontier();
    log.swap_in(fresh)?;
    info!("vacuum rewrote live set: {before} -> {after} bytes");
    Ok(new_header)
}
