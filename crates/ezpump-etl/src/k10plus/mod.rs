//! Resumable PICA+ / K10plus import
//!
//! Items are numbered with one id sequence across all files of a store. Each
//! file keeps a checkpoint row in `k10plus_source`, so a run that stopped
//! half-way continues with the next uncommitted item and the next free id.

pub mod importer;
pub mod line;

pub use importer::{ImportOutcome, K10plusImporter, DEFAULT_COMMIT_EVERY};
pub use line::{group_line, parse_line, Line};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Checkpoint of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeToken {
    /// Highest item id assigned so far in the store
    pub item_id_offset: i64,
    /// Number of items of this file that are fully committed
    pub offset: i64,
    /// Whether the file already has a checkpoint row
    pub started: bool,
}

/// Cooperative cancellation shared with a signal handler
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
