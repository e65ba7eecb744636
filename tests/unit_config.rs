mod support;

use clap::Parser;
use serial_test::serial;
use sheet_chat::{CliArgs, ServerConfig, TransportKind};
use std::env;
use std::path::PathBuf;
use support::TestWorkspace;

fn clear_env() {
    for key in [
        "SHEET_CHAT_WORKBOOK",
        "SHEET_CHAT_DATABASE",
        "SHEET_CHAT_VIEW_SHEET",
        "SHEET_CHAT_VIEW_FROM",
        "SHEET_CHAT_VIEW_TO",
        "SHEET_CHAT_ENABLED_TOOLS",
        "SHEET_CHAT_TRANSPORT",
        "SHEET_CHAT_HTTP_BIND",
        "SHEET_CHAT_MAX_TOOL_STEPS",
        "SHEET_CHAT_REQUIRE_CONFIRMATION",
        "SHEET_CHAT_MAX_RANGE_CELLS",
        "SHEET_CHAT_SHUTDOWN_TIMEOUT_SECS",
    ] {
        unsafe { env::remove_var(key) };
    }
}

fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
    let mut argv = vec!["sheet-chat"];
    argv.extend_from_slice(args);
    ServerConfig::from_args(CliArgs::parse_from(argv))
}

#[test]
#[serial]
fn defaults_without_flags() {
    clear_env();
    let config = parse(&[]).expect("defaults");
    assert_eq!(config.workbook_path, PathBuf::from("data/example.xlsx"));
    assert_eq!(config.database_path, PathBuf::from("data/chat.db"));
    assert_eq!(config.view.to_string(), "Sheet1!A1:C3");
    assert_eq!(config.transport, TransportKind::Http);
    assert_eq!(config.http_bind_address.to_string(), "127.0.0.1:8079");
    assert_eq!(config.max_tool_steps, 5);
    assert!(config.require_confirmation);
    assert_eq!(config.max_range_cells, 100_000);
    assert!(config.enabled_tools.is_none());
    assert!(config.is_tool_enabled("execute_cell_update"));
}

#[test]
#[serial]
fn cli_flags_override_the_config_file() {
    clear_env();
    let workspace = TestWorkspace::new();
    let file = workspace.path("sheet-chat.yaml");
    std::fs::write(
        &file,
        r#"
workbook: from-file.xlsx
database: from-file.db
view:
  sheet: Data
  to: E10
transport: stdio
max_tool_steps: 8
max_range_cells: 500
enabled_tools: [get_range, explain_formula]
"#,
    )
    .unwrap();

    let config = parse(&[
        "--config",
        file.to_str().unwrap(),
        "--workbook",
        "cli.xlsx",
        "--max-tool-steps",
        "3",
        "--require-confirmation",
        "false",
    ])
    .expect("merged config");

    assert_eq!(config.workbook_path, PathBuf::from("cli.xlsx"));
    assert_eq!(config.database_path, PathBuf::from("from-file.db"));
    assert_eq!(config.view.to_string(), "Data!A1:E10");
    assert_eq!(config.transport, TransportKind::Stdio);
    assert_eq!(config.max_tool_steps, 3);
    assert_eq!(config.max_range_cells, 500);
    assert!(!config.require_confirmation);
    assert!(config.is_tool_enabled("get_range"));
    assert!(!config.is_tool_enabled("execute_cell_update"));
}

#[test]
#[serial]
fn environment_fills_missing_flags() {
    clear_env();
    unsafe {
        env::set_var("SHEET_CHAT_TRANSPORT", "stdio");
        env::set_var("SHEET_CHAT_ENABLED_TOOLS", "get_range, BEGIN_TURN");
    }
    let config = parse(&[]);
    clear_env();

    let config = config.expect("env config");
    assert_eq!(config.transport, TransportKind::Stdio);
    assert!(config.is_tool_enabled("begin_turn"));
    assert!(config.is_tool_enabled("get_range"));
    assert!(!config.is_tool_enabled("cancel_update"));
}

#[test]
#[serial]
fn unknown_file_keys_are_rejected() {
    clear_env();
    let workspace = TestWorkspace::new();
    let file = workspace.path("bad.yaml");
    std::fs::write(&file, "workbook: a.xlsx\nmax_steps: 3\n").unwrap();

    let error = parse(&["--config", file.to_str().unwrap()]).unwrap_err();
    assert!(format!("{error:#}").contains("max_steps"));

    let toml = workspace.path("config.toml");
    std::fs::write(&toml, "").unwrap();
    assert!(parse(&["--config", toml.to_str().unwrap()]).is_err());
}

#[test]
#[serial]
fn zero_step_budget_and_bad_view_are_rejected() {
    clear_env();
    assert!(parse(&["--max-tool-steps", "0"]).is_err());
    assert!(parse(&["--view-from", "C3", "--view-to", "A1"]).is_err());
    assert!(parse(&["--max-range-cells", "0"]).is_err());
}

#[test]
fn validate_checks_paths_and_tool_names() {
    let workspace = TestWorkspace::new();
    assert!(workspace.config().validate().is_ok());

    let csv = workspace.config_with(|config| config.workbook_path = workspace.path("data.csv"));
    assert!(csv.validate().is_err());

    let unknown_tool = workspace.config_with(|config| {
        config.enabled_tools = Some(["delete_everything".to_string()].into_iter().collect());
    });
    let error = unknown_tool.validate().unwrap_err();
    assert!(error.to_string().contains("delete_everything"));

    let no_steps = workspace.config_with(|config| config.max_tool_steps = 0);
    assert!(no_steps.validate().is_err());

    let view_over_limit = workspace.config_with(|config| config.max_range_cells = 4);
    let error = view_over_limit.validate().unwrap_err();
    assert!(error.to_string().contains("max_range_cells"));

    let dir_db = workspace.config_with(|config| config.database_path = workspace.root().to_path_buf());
    assert!(dir_db.validate().is_err());
}
