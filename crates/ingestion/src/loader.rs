//! Staged, idempotent loading of catalog records.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use storage::{CatalogStore, InsertOutcome};

use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::record::CatalogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Inserted,
    /// A record with the same `(collection, id)` was already stored; nothing changed.
    AlreadyPresent,
}

pub struct CatalogLoader {
    store: Arc<dyn CatalogStore>,
    staging_dir: Option<PathBuf>,
}

impl CatalogLoader {
    pub fn new(store: Arc<dyn CatalogStore>, config: &LoaderConfig) -> Self {
        Self {
            store,
            staging_dir: config.staging_dir.clone(),
        }
    }

    fn stage(&self, record: &CatalogRecord) -> Result<NamedTempFile, LoadError> {
        let line = record
            .to_ndjson_line()
            .map_err(|e| LoadError::Staging(format!("serialize {}: {}", record.id, e)))?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("catalog-").suffix(".ndjson");
        let created = match &self.staging_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        let mut file = created.map_err(|e| LoadError::Staging(e.to_string()))?;
        writeln!(file, "{}", line).map_err(|e| LoadError::Staging(e.to_string()))?;
        file.flush().map_err(|e| LoadError::Staging(e.to_string()))?;
        Ok(file)
    }

    /// Insert `record` unless its identity is already present. The staging
    /// file is removed when this returns, whatever the outcome.
    #[instrument(skip(self, record), fields(collection = %record.collection, id = %record.id))]
    pub async fn load(&self, record: &CatalogRecord) -> Result<LoadOutcome, LoadError> {
        let staged = self.stage(record)?;
        let outcomes = self.store.load_ndjson(staged.path()).await?;

        let outcome = match outcomes.first() {
            Some(InsertOutcome::Inserted) => LoadOutcome::Inserted,
            Some(InsertOutcome::AlreadyPresent) => LoadOutcome::AlreadyPresent,
            None => return Err(LoadError::Staging("staged file produced no rows".into())),
        };
        debug!(?outcome, "Loaded record");
        Ok(outcome)
    }
}
