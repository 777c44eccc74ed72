//! HorizonDB storage engine.
//!
//! The path from an incoming write of timestamped records through
//! in-memory buffering, commit log durability and partitioned data files,
//! and back out through range filtered reads:
//!
//! ```text
//! write ──> commit log (group commit) ──> mem series (slab backed)
//!                                              │ flush
//!                                              ▼
//!            B+tree catalogue <── metadata ── data file (.ts)
//!
//! read  ──> catalogue range scan ──> per partition: file blocks + mem
//!           snapshots ──> delta decode ──> filtered record iterator
//! ```

pub mod btree;
pub mod catalog;
pub mod commitlog;
pub mod config;
pub mod db;
pub mod error;
pub mod flock;
pub mod model;
pub mod scheduler;
pub mod series;

pub use catalog::{DatabaseDefinition, FieldDefinition, RecordTypeDefinition, TimeSeriesDefinition};
pub use config::Config;
pub use db::HorizonDb;
pub use error::{Error, Result};
pub use model::{Field, FieldType, RangeSet, Record, TimeRange, TimeUnit};
pub use series::{CompressionType, ReadFilter};
