//! ezpump Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the ezpump migration workspace.
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: content ids for the filestore and the asset fingerprint
//!   used by the remote asset server for duplicate detection
//! - **Logging**: `tracing` subscriber setup shared by every binary
//! - **Timing**: per-step job timing with a summary line at the end
//!
//! # Example
//!
//! ```no_run
//! use ezpump_common::checksum::fingerprint_file;
//!
//! fn main() -> ezpump_common::Result<()> {
//!     let fingerprint = fingerprint_file("scan_0001.tif")?;
//!     tracing::info!(%fingerprint, "computed asset fingerprint");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod timing;

pub use error::{CommonError, Result};
