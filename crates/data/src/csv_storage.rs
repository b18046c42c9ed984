use crate::store::{FactorMeta, FactorRow, FactorStore, ReturnRow, SentimentRow};
use anyhow::{Context, Result};
use csv::Writer;
use factor_lab_core::{InstrumentProfile, InstrumentProfiles};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Locations of the CSV input feed.
#[derive(Debug, Clone, Default)]
pub struct FeedPaths {
    /// `date,instrument,factor_id,value`
    pub factors: PathBuf,
    /// `date,instrument,forward_return`
    pub returns: PathBuf,
    /// `factor_id,name,category`
    pub metadata: Option<PathBuf>,
    /// `instrument,industry,market_cap,avg_daily_value`
    pub profiles: Option<PathBuf>,
    /// `date,score`
    pub sentiment: Option<PathBuf>,
}

pub struct CsvStorage;

impl CsvStorage {
    /// Reads every row of a headered CSV file into `T`.
    ///
    /// Empty cells deserialize to `None` for optional fields.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or a row fails to parse.
    pub fn read_rows<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

        let mut rows = Vec::new();
        for (line, record) in reader.deserialize().enumerate() {
            let row: T = record.with_context(|| {
                format!("Failed to parse row {} of {}", line + 2, path.display())
            })?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Writes serializable records with a header row derived from field names.
    ///
    /// Floats are written with shortest round-trip formatting, so no
    /// precision is lost.
    ///
    /// # Errors
    /// Returns error if file cannot be created or writing fails
    pub fn write_records<T: Serialize>(path: impl AsRef<Path>, records: &[T]) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
        let mut writer = Writer::from_writer(file);

        for record in records {
            writer.serialize(record)?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Loads the full input feed into a fresh [`FactorStore`].
    ///
    /// # Errors
    /// Returns error if any file fails to parse or a record fails validation.
    pub fn load_store(paths: &FeedPaths) -> Result<FactorStore> {
        let mut store = FactorStore::new();

        let metadata: Vec<FactorMeta> = match &paths.metadata {
            Some(path) => Self::read_rows(path)?,
            None => Vec::new(),
        };

        let factor_rows: Vec<FactorRow> = Self::read_rows(&paths.factors)?;
        store
            .ingest_factor_rows(factor_rows, &metadata)
            .context("Factor feed failed validation")?;

        let return_rows: Vec<ReturnRow> = Self::read_rows(&paths.returns)?;
        store
            .ingest_return_rows(return_rows)
            .context("Return feed failed validation")?;

        if let Some(path) = &paths.profiles {
            let profiles: Vec<InstrumentProfile> = Self::read_rows(path)?;
            store.set_profiles(
                InstrumentProfiles::new(profiles).context("Profile feed failed validation")?,
            );
        }

        if let Some(path) = &paths.sentiment {
            let rows: Vec<SentimentRow> = Self::read_rows(path)?;
            store
                .set_sentiment(rows)
                .context("Sentiment feed failed validation")?;
        }

        Ok(store)
    }
}
