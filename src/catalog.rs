//! Database and time series definitions.
//!
//! The catalog is the schema side of the engine: which databases exist,
//! which time series they hold, and how each series' records are typed,
//! partitioned and compressed. It is deliberately small; the partition
//! catalogue (which partitions exist and where their data lives) is the
//! B+tree's job, not the catalog's.
//!
//! Definitions change rarely, so persistence is a whole-state snapshot:
//! every schema change rewrites `schema.db` through a temp file rename.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::field::{FieldType, TimeUnit};
use crate::model::range::TimeRange;
use crate::series::block::CompressionType;

const SCHEMA_FILE: &str = "schema.db";

/// A named database. Time series definitions hang off the catalog keyed by
/// the database name, so this carries identity only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDefinition {
    pub name: String,
}

impl DatabaseDefinition {
    pub fn new(name: impl Into<String>) -> DatabaseDefinition {
        DatabaseDefinition { name: name.into() }
    }
}

/// One field of a record type, after the implicit leading timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> FieldDefinition {
        FieldDefinition {
            name: name.into(),
            field_type,
        }
    }
}

/// A record type within a time series: its name and its fields. The
/// timestamp is implicit and always first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordTypeDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
}

impl RecordTypeDefinition {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>) -> RecordTypeDefinition {
        RecordTypeDefinition {
            name: name.into(),
            fields,
        }
    }

    /// Field types including the implicit timestamp.
    pub fn field_types(&self) -> Vec<FieldType> {
        let mut types = Vec::with_capacity(self.fields.len() + 1);
        types.push(FieldType::Timestamp);
        types.extend(self.fields.iter().map(|f| f.field_type));
        types
    }
}

/// A time series definition: timestamp resolution, partition width,
/// on-disk compression and the record types it stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesDefinition {
    pub name: String,
    pub timestamp_unit: TimeUnit,
    /// Partition width in timestamp units of this series.
    pub partition_width: i64,
    pub compression: CompressionType,
    pub record_types: Vec<RecordTypeDefinition>,
}

impl TimeSeriesDefinition {
    /// A definition with daily partitions at the given resolution.
    pub fn new(
        name: impl Into<String>,
        timestamp_unit: TimeUnit,
        record_types: Vec<RecordTypeDefinition>,
    ) -> TimeSeriesDefinition {
        let day_secs = 24 * 60 * 60;
        TimeSeriesDefinition {
            name: name.into(),
            timestamp_unit,
            partition_width: day_secs * timestamp_unit.ticks_per_second(),
            compression: CompressionType::Lz4,
            record_types,
        }
    }

    pub fn partition_width(mut self, width: i64) -> TimeSeriesDefinition {
        self.partition_width = width;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> TimeSeriesDefinition {
        self.compression = compression;
        self
    }

    /// The partition interval the given timestamp falls into, aligned to
    /// the partition width.
    pub fn partition_range(&self, timestamp: i64) -> TimeRange {
        let lower = timestamp.div_euclid(self.partition_width) * self.partition_width;
        TimeRange::new(lower, lower + self.partition_width - 1)
    }

    pub fn record_type(&self, index: usize) -> Result<&RecordTypeDefinition> {
        self.record_types.get(index).ok_or_else(|| {
            Error::InvalidRecord(format!(
                "record type {index} not defined for series {}",
                self.name
            ))
        })
    }

    pub fn num_record_types(&self) -> usize {
        self.record_types.len()
    }

    /// Field types for each record type, indexed by record type.
    pub fn field_types(&self) -> Vec<Vec<FieldType>> {
        self.record_types.iter().map(|rt| rt.field_types()).collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogState {
    databases: BTreeMap<String, DatabaseDefinition>,
    series: BTreeMap<(String, String), TimeSeriesDefinition>,
}

/// The persistent schema catalog.
pub struct Catalog {
    path: PathBuf,
    state: RwLock<CatalogState>,
}

impl Catalog {
    /// Loads the catalog from the data directory, starting empty when no
    /// snapshot exists yet.
    pub fn open(data_dir: &Path) -> Result<Catalog> {
        let path = data_dir.join(SCHEMA_FILE);
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            bincode::deserialize(&bytes)?
        } else {
            CatalogState::default()
        };
        Ok(Catalog {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn create_database(&self, definition: DatabaseDefinition) -> Result<()> {
        let mut state = self.state.write()?;
        if state.databases.contains_key(&definition.name) {
            return Err(Error::DuplicateDatabase(definition.name));
        }
        tracing::info!(database = %definition.name, "creating database");
        state.databases.insert(definition.name.clone(), definition);
        self.persist(&state)
    }

    pub fn create_time_series(
        &self,
        database: &str,
        definition: TimeSeriesDefinition,
    ) -> Result<()> {
        let mut state = self.state.write()?;
        if !state.databases.contains_key(database) {
            return Err(Error::UnknownDatabase(database.to_string()));
        }
        let key = (database.to_string(), definition.name.clone());
        if state.series.contains_key(&key) {
            return Err(Error::DuplicateTimeSeries(definition.name));
        }
        tracing::info!(database, series = %definition.name, "creating time series");
        state.series.insert(key, definition);
        self.persist(&state)
    }

    pub fn database(&self, name: &str) -> Result<DatabaseDefinition> {
        self.state
            .read()?
            .databases
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDatabase(name.to_string()))
    }

    pub fn series(&self, database: &str, name: &str) -> Result<TimeSeriesDefinition> {
        let state = self.state.read()?;
        if !state.databases.contains_key(database) {
            return Err(Error::UnknownDatabase(database.to_string()));
        }
        state
            .series
            .get(&(database.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::UnknownTimeSeries(name.to_string()))
    }

    /// All series definitions, used to route commit log replay.
    pub fn all_series(&self) -> Result<Vec<(String, TimeSeriesDefinition)>> {
        Ok(self
            .state
            .read()?
            .series
            .iter()
            .map(|((db, _), def)| (db.clone(), def.clone()))
            .collect())
    }

    fn persist(&self, state: &CatalogState) -> Result<()> {
        let bytes = bincode::serialize(state)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote_series(name: &str) -> TimeSeriesDefinition {
        TimeSeriesDefinition::new(
            name,
            TimeUnit::Nanoseconds,
            vec![RecordTypeDefinition::new(
                "quote",
                vec![
                    FieldDefinition::new("bestBid", FieldType::Decimal),
                    FieldDefinition::new("bestAsk", FieldType::Decimal),
                ],
            )],
        )
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        catalog
            .create_database(DatabaseDefinition::new("test"))
            .unwrap();
        catalog.create_time_series("test", quote_series("DAX")).unwrap();

        let definition = catalog.series("test", "DAX").unwrap();
        assert_eq!(definition.name, "DAX");
        assert_eq!(definition.record_types[0].field_types().len(), 3);
    }

    #[test]
    fn test_duplicates_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        catalog
            .create_database(DatabaseDefinition::new("test"))
            .unwrap();
        assert_eq!(
            catalog.create_database(DatabaseDefinition::new("test")),
            Err(Error::DuplicateDatabase("test".to_string()))
        );

        catalog.create_time_series("test", quote_series("DAX")).unwrap();
        assert_eq!(
            catalog.create_time_series("test", quote_series("DAX")),
            Err(Error::DuplicateTimeSeries("DAX".to_string()))
        );
    }

    #[test]
    fn test_unknown_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        assert_eq!(
            catalog.series("nope", "DAX").unwrap_err(),
            Error::UnknownDatabase("nope".to_string())
        );
        catalog
            .create_database(DatabaseDefinition::new("test"))
            .unwrap();
        assert_eq!(
            catalog.series("test", "DAX").unwrap_err(),
            Error::UnknownTimeSeries("DAX".to_string())
        );
        assert_eq!(
            catalog.create_time_series("missing", quote_series("DAX")),
            Err(Error::UnknownDatabase("missing".to_string()))
        );
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let catalog = Catalog::open(dir.path()).unwrap();
            catalog
                .create_database(DatabaseDefinition::new("test"))
                .unwrap();
            catalog.create_time_series("test", quote_series("DAX")).unwrap();
        }
        let catalog = Catalog::open(dir.path()).unwrap();
        assert!(catalog.series("test", "DAX").is_ok());
        assert!(catalog.database("test").is_ok());
    }

    #[test]
    fn test_partition_alignment() {
        let definition = quote_series("DAX");
        let day_ns = 24 * 60 * 60 * 1_000_000_000i64;
        let range = definition.partition_range(day_ns + 5);
        assert_eq!(range.lower, day_ns);
        assert_eq!(range.upper, 2 * day_ns - 1);
        // Pre-epoch timestamps align downwards, not towards zero.
        let range = definition.partition_range(-1);
        assert_eq!(range.lower, -day_ns);
    }
}
