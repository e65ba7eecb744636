use crate::config::ServerConfig;
use crate::threads::ThreadStore;
use crate::tools::policy::DispatchLedger;
use crate::workbook::WorkbookStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::task;
use tracing::info;

/// Everything a request handler needs, shared behind one `Arc`.
pub struct AppState {
    config: Arc<ServerConfig>,
    store: Arc<WorkbookStore>,
    threads: Arc<ThreadStore>,
    ledger: DispatchLedger,
}

impl AppState {
    pub fn new(config: Arc<ServerConfig>, store: WorkbookStore, threads: ThreadStore) -> Self {
        let ledger = DispatchLedger::new(config.max_tool_steps, config.require_confirmation);
        let store = store.with_max_range_cells(config.max_range_cells);
        Self {
            config,
            store: Arc::new(store),
            threads: Arc::new(threads),
            ledger,
        }
    }

    /// Load (or seed) the workbook and open the thread database.
    pub fn open(config: Arc<ServerConfig>) -> Result<Self> {
        let started = Instant::now();
        let store = WorkbookStore::open(&config.workbook_path)
            .with_context(|| format!("failed to open workbook {:?}", config.workbook_path))?;
        let threads = ThreadStore::open_path(&config.database_path).with_context(|| {
            format!("failed to open thread database {:?}", config.database_path)
        })?;
        info!(
            workbook = %config.workbook_path.display(),
            database = %config.database_path.display(),
            sheets = store.sheet_names().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "application state ready"
        );
        Ok(Self::new(config, store, threads))
    }

    /// [`open`](Self::open) off the async runtime.
    pub async fn open_blocking(config: Arc<ServerConfig>) -> Result<Self> {
        task::spawn_blocking(move || Self::open(config))
            .await
            .context("state initialization task panicked")?
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    pub fn store(&self) -> Arc<WorkbookStore> {
        self.store.clone()
    }

    pub fn threads(&self) -> Arc<ThreadStore> {
        self.threads.clone()
    }

    pub fn ledger(&self) -> &DispatchLedger {
        &self.ledger
    }
}
