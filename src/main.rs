use clap::Parser;
use sheet_chat::{
    CliArgs, LoggingConfig, ServerConfig, TransportKind, init_logging, run_server,
    shutdown_telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();
    let config = ServerConfig::from_args(cli)?;

    let mut logging_config = LoggingConfig::from_env();
    if config.transport == TransportKind::Stdio {
        logging_config = logging_config.for_stdio_transport();
    }
    let _guard = init_logging(logging_config)?;

    // Fail fast before touching the workbook or database
    config.validate()?;

    let result = run_server(config).await;

    shutdown_telemetry();

    result
}
