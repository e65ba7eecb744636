#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sheet_chat::address::CellRange;
use sheet_chat::state::AppState;
use sheet_chat::threads::ThreadStore;
use sheet_chat::workbook::WorkbookStore;
use sheet_chat::{ServerConfig, TransportKind};
use tempfile::{TempDir, tempdir};
use umya_spreadsheet::{self, Spreadsheet};

pub fn write_workbook_to_path<F>(path: &Path, f: F)
where
    F: FnOnce(&mut Spreadsheet),
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create dir");
    }
    let mut book = umya_spreadsheet::new_file();
    f(&mut book);
    umya_spreadsheet::writer::xlsx::write(&book, path).expect("write workbook");
}

/// The 3x3 demo grid: a header row and two data rows on Sheet1.
pub fn demo_grid(book: &mut Spreadsheet) {
    let sheet = book.get_sheet_by_name_mut("Sheet1").expect("Sheet1");
    sheet.get_cell_mut("A1").set_value_string("Name");
    sheet.get_cell_mut("B1").set_value_string("Amount");
    sheet.get_cell_mut("C1").set_value_string("Status");
    sheet.get_cell_mut("A2").set_value_string("alice");
    sheet.get_cell_mut("B2").set_value_number(100);
    sheet.get_cell_mut("C2").set_value_string("Active");
    sheet.get_cell_mut("A3").set_value_string("bob");
    sheet.get_cell_mut("B3").set_value_number(200);
    sheet.get_cell_mut("C3").set_value_string("Active");
    sheet.get_cell_mut("D2").set_formula("B2*2");
}

pub struct TestWorkspace {
    _tempdir: TempDir,
    root: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let tempdir = tempdir().expect("tempdir");
        let root = tempdir.path().to_path_buf();
        Self {
            _tempdir: tempdir,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn create_workbook<F>(&self, name: &str, f: F) -> PathBuf
    where
        F: FnOnce(&mut Spreadsheet),
    {
        let path = self.path(name);
        write_workbook_to_path(&path, f);
        path
    }

    /// Config pointing at `demo.xlsx` (created with [`demo_grid`]) and a
    /// database inside the workspace.
    pub fn config(&self) -> ServerConfig {
        let workbook_path = self.path("demo.xlsx");
        if !workbook_path.exists() {
            write_workbook_to_path(&workbook_path, demo_grid);
        }
        ServerConfig {
            workbook_path,
            database_path: self.path("chat.db"),
            view: CellRange::from_a1("Sheet1", "A1", "C3").expect("view"),
            enabled_tools: None,
            transport: TransportKind::Http,
            http_bind_address: "127.0.0.1:8079".parse().unwrap(),
            max_tool_steps: 5,
            require_confirmation: true,
            max_range_cells: 10_000,
            graceful_shutdown_timeout_secs: 10,
        }
    }

    pub fn config_with<F>(&self, configure: F) -> ServerConfig
    where
        F: FnOnce(&mut ServerConfig),
    {
        let mut config = self.config();
        configure(&mut config);
        config
    }

    pub fn app_state(&self) -> Arc<AppState> {
        app_state_with_config(self.config())
    }

    pub fn store(&self) -> WorkbookStore {
        let config = self.config();
        WorkbookStore::open(&config.workbook_path).expect("open store")
    }
}

pub fn app_state_with_config(config: ServerConfig) -> Arc<AppState> {
    let config = Arc::new(config);
    let store = WorkbookStore::open(&config.workbook_path).expect("open store");
    let threads = ThreadStore::open_in_memory().expect("thread store");
    Arc::new(AppState::new(config, store, threads))
}

/// Re-read the workbook from disk, bypassing the in-memory store.
pub fn reload(path: &Path) -> Spreadsheet {
    umya_spreadsheet::reader::xlsx::read(path).expect("reload workbook")
}
