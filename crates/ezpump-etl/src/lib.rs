//! ezpump Migration Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Moves data from heterogeneous sources into an easydb instance in three
//! resumable stages:
//!
//! 1. **Extract**: foreign SQL, SQLite and CSV sources are unified into one
//!   intermediate SQLite store ([`source`], [`intermediate`]); PICA+/K10plus
//!   dumps are parsed with per-file checkpoints ([`k10plus`]) and asset
//!   content is kept in a content-addressed [`filestore`].
//! 2. **Transform**: rows are written into the schema-shaped destination
//!   store in versioned batches ([`sync`], [`destination`]).
//! 3. **Load**: destination rows are pushed to the remote API and the
//!   returned ids written back ([`loader`], [`api`]).
//!
//! # Example
//!
//! ```no_run
//! use ezpump_etl::api::EasydbClient;
//! use ezpump_etl::destination::{CreatePolicy, Destination};
//! use ezpump_etl::loader::{LoadOptions, Loader};
//! use ezpump_etl::repository::SqliteRepository;
//!
//! #[tokio::main]
//! async fn main() -> ezpump_etl::Result<()> {
//!     let api = EasydbClient::new("https://easydb.example.org", 300, true)?;
//!     api.authenticate("root", "secret").await?;
//!
//!     let destination = Destination::prepare(&api, "./work", CreatePolicy::IfNotExists, &[]).await?;
//!     // ... synchronize rows into destination.db ...
//!
//!     let source = SqliteRepository::open("./work/source.db")?;
//!     let report = Loader::new(&source, &destination, &api, LoadOptions::default())
//!         .load(&[])
//!         .await?;
//!     tracing::info!(pushed = report.pushed, "done");
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod destination;
pub mod error;
pub mod filestore;
pub mod intermediate;
pub mod k10plus;
pub mod loader;
pub mod repository;
pub mod source;
pub mod sync;
pub mod value;

pub use error::{EtlError, Result};
pub use value::{Row, Value};
