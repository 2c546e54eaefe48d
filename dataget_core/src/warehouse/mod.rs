pub mod loader;
pub mod queries;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::contracts::{PipelineError, PipelineResult};

/// # NDOC
/// component: `warehouse`
/// purpose: Embedded columnar store the loader appends to and the query layer
///          reads from. The production warehouse's SQL dialect is out of
///          scope; the schema and query semantics here are the contract.
/// invariants:
///   - Fact tables carry `stat_date`, `batch_id`, `fetched_at` and are
///     append-only at batch granularity.
///   - Dataset qualification maps to a `{dataset}__{table}` physical name.
pub struct Warehouse {
    conn: Arc<Mutex<Connection>>,
    quickbi_dataset: String,
    xmp_dataset: String,
}

impl Warehouse {
    pub fn open(
        path: &Path,
        quickbi_dataset: impl Into<String>,
        xmp_dataset: impl Into<String>,
    ) -> PipelineResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|err| PipelineError::storage(format!("cannot open warehouse: {err}")))?;
        Ok(Self::from_connection(conn, quickbi_dataset, xmp_dataset))
    }

    /// In-memory store for tests and dry runs.
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|err| PipelineError::storage(format!("cannot open warehouse: {err}")))?;
        Ok(Self::from_connection(conn, "quickbi_data", "xmp_data"))
    }

    fn from_connection(
        conn: Connection,
        quickbi_dataset: impl Into<String>,
        xmp_dataset: impl Into<String>,
    ) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            quickbi_dataset: quickbi_dataset.into(),
            xmp_dataset: xmp_dataset.into(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("warehouse mutex poisoned")
    }

    /// Physical name of a logical, dataset-qualified table.
    pub fn physical_table(&self, logical: &str) -> String {
        let dataset = if logical.starts_with("quickbi") || logical == "hourly_snapshots" {
            &self.quickbi_dataset
        } else {
            &self.xmp_dataset
        };
        format!("{dataset}__{logical}")
    }
}

impl Clone for Warehouse {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            quickbi_dataset: self.quickbi_dataset.clone(),
            xmp_dataset: self.xmp_dataset.clone(),
        }
    }
}
