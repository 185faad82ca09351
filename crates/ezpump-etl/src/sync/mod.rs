//! Versioned batch synchronization into destination tables
//!
//! A run reads rows from a [`RowProducer`], passes every row through an
//! ordered pipeline of [`RowTransformation`]s and writes the result into one
//! destination table in batches keyed by `__source_unique_id`:
//!
//! 1. **collect**: rows are grouped into batches of `batch_size` distinct ids
//! 2. **transform**: each transformation may drop, rewrite or fan out a row
//! 3. **version check**: stored rows with the same `__version` are skipped,
//!    stored rows with a newer version are conflicts
//! 4. **apply**: new rows are inserted (and their assets attached), older
//!    rows are updated
//!
//! Re-running the same input is a no-op because of step 3.

pub mod assets;
pub mod producer;
pub mod synchronizer;
pub mod transform;

pub use assets::{order_assets, AssetColumn, AssetSourceType, ResolvedAsset};
pub use producer::{FixedRows, QueryRows, RowProducer};
pub use synchronizer::BatchSynchronizer;
pub use transform::{
    apply_pipeline, FilterByEmptyColumns, FilterBySourceId, FixValues, MapFn, Rename,
    RowTransformation,
};

/// Version column compared by the synchronizer
pub const VERSION: &str = "__version";

/// Optional column overriding the source id used to look up `file` rows
pub const FILE_TABLE_ID: &str = "__file_table_id";

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Version assumed for rows (incoming or stored) without one
pub const DEFAULT_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Distinct source ids per batch
    pub batch_size: usize,
    /// Abort on the first rejected row instead of logging and skipping it
    pub stop_on_error: bool,
    /// Run the whole job in one transaction with foreign keys checked at commit
    pub defer_foreign_keys: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            stop_on_error: true,
            defer_foreign_keys: false,
        }
    }
}

impl SyncOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    pub fn with_deferred_foreign_keys(mut self) -> Self {
        self.defer_foreign_keys = true;
        self
    }
}

/// Counters of one synchronization run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Rows read from the producer
    pub read: usize,
    /// Rows left after transformation
    pub produced: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Rows already stored with the same version
    pub unchanged: usize,
    /// Rows whose stored version is newer
    pub conflicts: usize,
    /// Rows without `__source_unique_id`
    pub skipped: usize,
    /// Rows whose insert or update failed
    pub failed: usize,
    /// Asset rows inserted
    pub assets: usize,
    pub batches: usize,
}

impl SyncReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn merge(&mut self, other: &SyncReport) {
        self.read += other.read;
        self.produced += other.produced;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.assets += other.assets;
        self.batches += other.batches;
    }
}
