use crate::address::CellRange;
use crate::tools::ToolName;
use crate::workbook::{DEFAULT_MAX_RANGE_CELLS, validate_sheet_name};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_WORKBOOK_PATH: &str = "data/example.xlsx";
const DEFAULT_DATABASE_PATH: &str = "data/chat.db";
const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8079";
const DEFAULT_VIEW_SHEET: &str = "Sheet1";
const DEFAULT_VIEW_FROM: &str = "A1";
const DEFAULT_VIEW_TO: &str = "C3";
const DEFAULT_MAX_TOOL_STEPS: usize = 5;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[value(alias = "stream-http", alias = "stream_http")]
    #[serde(alias = "stream-http", alias = "stream_http")]
    Http,
    Stdio,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::Stdio => write!(f, "stdio"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub workbook_path: PathBuf,
    pub database_path: PathBuf,
    /// Window re-read after every write and served by default to the UI.
    pub view: CellRange,
    pub enabled_tools: Option<HashSet<String>>,
    pub transport: TransportKind,
    pub http_bind_address: SocketAddr,
    pub max_tool_steps: usize,
    pub require_confirmation: bool,
    /// Upper bound on the cells a single range read or write may span.
    pub max_range_cells: usize,
    pub graceful_shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let CliArgs {
            config,
            workbook: cli_workbook,
            database: cli_database,
            view_sheet: cli_view_sheet,
            view_from: cli_view_from,
            view_to: cli_view_to,
            enabled_tools: cli_enabled_tools,
            transport: cli_transport,
            http_bind: cli_http_bind,
            max_tool_steps: cli_max_tool_steps,
            require_confirmation: cli_require_confirmation,
            max_range_cells: cli_max_range_cells,
            shutdown_timeout_secs: cli_shutdown_timeout,
        } = args;

        let file_config = if let Some(path) = config.as_ref() {
            load_config_file(path)?
        } else {
            PartialConfig::default()
        };

        let PartialConfig {
            workbook: file_workbook,
            database: file_database,
            view: file_view,
            enabled_tools: file_enabled_tools,
            transport: file_transport,
            http_bind: file_http_bind,
            max_tool_steps: file_max_tool_steps,
            require_confirmation: file_require_confirmation,
            max_range_cells: file_max_range_cells,
            shutdown_timeout_secs: file_shutdown_timeout,
        } = file_config;
        let file_view = file_view.unwrap_or_default();

        let workbook_path = cli_workbook
            .or(file_workbook)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKBOOK_PATH));
        let database_path = cli_database
            .or(file_database)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));

        let view_sheet = cli_view_sheet
            .or(file_view.sheet)
            .unwrap_or_else(|| DEFAULT_VIEW_SHEET.to_string());
        let view_from = cli_view_from
            .or(file_view.from)
            .unwrap_or_else(|| DEFAULT_VIEW_FROM.to_string());
        let view_to = cli_view_to
            .or(file_view.to)
            .unwrap_or_else(|| DEFAULT_VIEW_TO.to_string());
        let view = CellRange::from_a1(view_sheet, &view_from, &view_to)
            .with_context(|| format!("invalid view window {view_from}:{view_to}"))?;

        let enabled_tools = cli_enabled_tools
            .or(file_enabled_tools)
            .map(|tools| {
                tools
                    .into_iter()
                    .map(|tool| tool.trim().to_ascii_lowercase())
                    .filter(|tool| !tool.is_empty())
                    .collect::<HashSet<_>>()
            })
            .filter(|set| !set.is_empty());

        let transport = cli_transport
            .or(file_transport)
            .unwrap_or(TransportKind::Http);

        let http_bind_address = match cli_http_bind.or(file_http_bind) {
            Some(addr) => addr,
            None => DEFAULT_HTTP_BIND
                .parse()
                .context("default bind address invalid")?,
        };

        let max_tool_steps = cli_max_tool_steps
            .or(file_max_tool_steps)
            .unwrap_or(DEFAULT_MAX_TOOL_STEPS);
        anyhow::ensure!(max_tool_steps >= 1, "max_tool_steps must be at least 1");

        let require_confirmation = cli_require_confirmation
            .or(file_require_confirmation)
            .unwrap_or(true);

        let max_range_cells = cli_max_range_cells
            .or(file_max_range_cells)
            .unwrap_or(DEFAULT_MAX_RANGE_CELLS);
        anyhow::ensure!(max_range_cells >= 1, "max_range_cells must be at least 1");

        let graceful_shutdown_timeout_secs = cli_shutdown_timeout
            .or(file_shutdown_timeout)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        Ok(Self {
            workbook_path,
            database_path,
            view,
            enabled_tools,
            transport,
            http_bind_address,
            max_tool_steps,
            require_confirmation,
            max_range_cells,
            graceful_shutdown_timeout_secs,
        })
    }

    /// Fail-fast checks run once before the server starts.
    pub fn validate(&self) -> Result<()> {
        let extension = self
            .workbook_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        anyhow::ensure!(
            extension.as_deref() == Some("xlsx"),
            "workbook {:?} must be an .xlsx file",
            self.workbook_path
        );
        if self.workbook_path.exists() {
            anyhow::ensure!(
                self.workbook_path.is_file(),
                "workbook {:?} is not a file",
                self.workbook_path
            );
        }
        anyhow::ensure!(
            !self.database_path.is_dir(),
            "database path {:?} is a directory",
            self.database_path
        );
        validate_sheet_name(&self.view.sheet)
            .with_context(|| format!("invalid view sheet {:?}", self.view.sheet))?;
        anyhow::ensure!(self.max_tool_steps >= 1, "max_tool_steps must be at least 1");
        anyhow::ensure!(self.max_range_cells >= 1, "max_range_cells must be at least 1");
        anyhow::ensure!(
            self.view.cell_count() <= self.max_range_cells,
            "view window {} spans {} cells, above max_range_cells {}",
            self.view,
            self.view.cell_count(),
            self.max_range_cells
        );
        anyhow::ensure!(
            self.graceful_shutdown_timeout_secs >= 1,
            "graceful_shutdown_timeout_secs must be at least 1"
        );
        if let Some(tools) = &self.enabled_tools {
            for tool in tools {
                anyhow::ensure!(
                    ToolName::from_str(tool).is_ok(),
                    "unknown tool in enabled_tools: {tool}"
                );
            }
        }
        Ok(())
    }

    pub fn is_tool_enabled(&self, tool: &str) -> bool {
        match &self.enabled_tools {
            Some(set) => set.contains(&tool.to_ascii_lowercase()),
            None => true,
        }
    }
}

#[derive(Parser, Debug, Default, Clone)]
#[command(
    name = "sheet-chat",
    about = "Chat-driven spreadsheet assistant (MCP + REST)",
    version
)]
pub struct CliArgs {
    #[arg(
        long,
        value_name = "FILE",
        help = "Path to a configuration file (YAML or JSON)",
        global = true
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "SHEET_CHAT_WORKBOOK",
        value_name = "FILE",
        help = "Workbook file; seeded with demo data when missing"
    )]
    pub workbook: Option<PathBuf>,

    #[arg(
        long,
        env = "SHEET_CHAT_DATABASE",
        value_name = "FILE",
        help = "SQLite file holding chat threads and messages"
    )]
    pub database: Option<PathBuf>,

    #[arg(
        long,
        env = "SHEET_CHAT_VIEW_SHEET",
        value_name = "SHEET",
        help = "Sheet of the window re-read after each update"
    )]
    pub view_sheet: Option<String>,

    #[arg(
        long,
        env = "SHEET_CHAT_VIEW_FROM",
        value_name = "CELL",
        help = "Top-left cell of the view window"
    )]
    pub view_from: Option<String>,

    #[arg(
        long,
        env = "SHEET_CHAT_VIEW_TO",
        value_name = "CELL",
        help = "Bottom-right cell of the view window"
    )]
    pub view_to: Option<String>,

    #[arg(
        long,
        env = "SHEET_CHAT_ENABLED_TOOLS",
        value_name = "TOOL",
        value_delimiter = ',',
        help = "Restrict execution to the provided tool names"
    )]
    pub enabled_tools: Option<Vec<String>>,

    #[arg(
        long,
        env = "SHEET_CHAT_TRANSPORT",
        value_enum,
        value_name = "TRANSPORT",
        help = "Transport to expose (http or stdio)"
    )]
    pub transport: Option<TransportKind>,

    #[arg(
        long,
        env = "SHEET_CHAT_HTTP_BIND",
        value_name = "ADDR",
        help = "HTTP bind address when using http transport"
    )]
    pub http_bind: Option<SocketAddr>,

    #[arg(
        long,
        env = "SHEET_CHAT_MAX_TOOL_STEPS",
        value_name = "N",
        help = "Maximum tool invocations per conversational turn",
        value_parser = clap::value_parser!(usize)
    )]
    pub max_tool_steps: Option<usize>,

    #[arg(
        long,
        env = "SHEET_CHAT_REQUIRE_CONFIRMATION",
        value_name = "BOOL",
        action = clap::ArgAction::Set,
        help = "Reject execute calls that have no matching confirmation"
    )]
    pub require_confirmation: Option<bool>,

    #[arg(
        long,
        env = "SHEET_CHAT_MAX_RANGE_CELLS",
        value_name = "N",
        help = "Maximum cells a single range read or write may span",
        value_parser = clap::value_parser!(usize)
    )]
    pub max_range_cells: Option<usize>,

    #[arg(
        long,
        env = "SHEET_CHAT_SHUTDOWN_TIMEOUT_SECS",
        value_name = "SECS",
        help = "Seconds allowed for graceful shutdown"
    )]
    pub shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialConfig {
    workbook: Option<PathBuf>,
    database: Option<PathBuf>,
    view: Option<PartialView>,
    enabled_tools: Option<Vec<String>>,
    transport: Option<TransportKind>,
    http_bind: Option<SocketAddr>,
    max_tool_steps: Option<usize>,
    require_confirmation: Option<bool>,
    max_range_cells: Option<usize>,
    shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialView {
    sheet: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

fn load_config_file(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        anyhow::bail!("config file {:?} does not exist", path);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parsed = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config {:?}", path))?,
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {:?}", path))?,
        other => anyhow::bail!("unsupported config extension: {other}"),
    };
    Ok(parsed)
}
