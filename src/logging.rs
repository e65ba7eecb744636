//! Log setup shared by both transports.
//!
//! Lines go through `tracing-subscriber` as JSON or pretty text on a
//! non-blocking writer. When an OTLP collector is configured, spans are also
//! exported as traces. `RUST_LOG` replaces the default directives entirely.

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry::trace::TraceError;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer};
use std::env;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const SERVICE_NAME: &str = "sheet-chat";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Daily-rolling files under `log_dir`
    File,
}

/// Where and how spans are exported. Absent means tracing stays local.
#[derive(Debug, Clone, PartialEq)]
pub struct OtlpExport {
    pub endpoint: String,
    pub timeout: Duration,
    /// Fraction of root traces kept, 0.0 to 1.0
    pub sampling_rate: f64,
}

impl OtlpExport {
    fn sampler(&self) -> Sampler {
        match self.sampling_rate {
            rate if rate >= 1.0 => Sampler::AlwaysOn,
            rate if rate <= 0.0 => Sampler::AlwaysOff,
            rate => Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(rate))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    pub log_dir: PathBuf,
    pub service_version: String,
    /// Deployment label, e.g. "development" or "production"
    pub environment: String,
    pub otlp: Option<OtlpExport>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let environment = env::var("SHEET_CHAT_ENV")
            .or_else(|_| env::var("ENVIRONMENT"))
            .unwrap_or_else(|_| "development".to_string());
        let format = if is_production(&environment) {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        };
        Self {
            format,
            output: LogOutput::Stderr,
            log_dir: PathBuf::from("logs"),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment,
            otlp: None,
        }
    }
}

fn is_production(environment: &str) -> bool {
    matches!(environment, "production" | "prod")
}

/// Parse an environment variable, ignoring unset or malformed values.
fn env_value<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}

impl LoggingConfig {
    /// Defaults overridden by LOG_FORMAT, LOG_OUTPUT, LOG_DIR and the OTEL_*
    /// variables. Setting either OTEL_EXPORTER_OTLP_ENDPOINT or ENABLE_OTEL
    /// turns export on.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(format) = env_value("LOG_FORMAT") {
            config.format = format;
        }
        if let Some(output) = env_value("LOG_OUTPUT") {
            config.output = output;
        }
        if let Ok(dir) = env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
        if endpoint.is_some() || env::var_os("ENABLE_OTEL").is_some() {
            let default_rate = if is_production(&config.environment) {
                0.1
            } else {
                1.0
            };
            config.otlp = Some(OtlpExport {
                endpoint: endpoint.unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string()),
                timeout: Duration::from_secs(
                    env_value("OTEL_EXPORTER_OTLP_TIMEOUT").unwrap_or(10),
                ),
                sampling_rate: env_value::<f64>("OTEL_SAMPLING_RATE")
                    .map(|rate| rate.clamp(0.0, 1.0))
                    .unwrap_or(default_rate),
            });
        }
        config
    }

    /// The stdio transport owns stdout for protocol frames; logs move to stderr.
    pub fn for_stdio_transport(mut self) -> Self {
        if self.output == LogOutput::Stdout {
            self.output = LogOutput::Stderr;
        }
        self
    }

    fn default_directives(&self) -> String {
        let level = if is_production(&self.environment) {
            "info"
        } else {
            "debug"
        };
        format!("{level},sheet_chat={level},rmcp=info,hyper=info,tower=info,umya_spreadsheet=warn")
    }

    fn writer(&self) -> Result<(NonBlocking, WorkerGuard)> {
        Ok(match self.output {
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::File => {
                std::fs::create_dir_all(&self.log_dir).with_context(|| {
                    format!("failed to create log directory {:?}", self.log_dir)
                })?;
                tracing_appender::non_blocking(tracing_appender::rolling::daily(
                    &self.log_dir,
                    SERVICE_NAME,
                ))
            }
        })
    }
}

/// Install the global subscriber. Hold the returned guard until exit so
/// buffered lines are flushed.
pub fn init_logging(config: LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));
    let (writer, guard) = config.writer()?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_span_list(false)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(config.output != LogOutput::File)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(filter)
            .boxed(),
    };

    // The subscriber is not installed yet, so failures go straight to stderr.
    let otel_layer = config.otlp.as_ref().and_then(|export| {
        match otlp_tracer(&config, export) {
            Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Err(error) => {
                eprintln!("sheet-chat: OTLP export to {} disabled: {error}", export.endpoint);
                None
            }
        }
    });
    let exporting = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::info!(
        version = %config.service_version,
        environment = %config.environment,
        format = %config.format,
        output = %config.output,
        otlp = exporting,
        "logging initialized"
    );
    Ok(Some(guard))
}

/// Batch exporter registered as the global tracer provider.
fn otlp_tracer(config: &LoggingConfig, export: &OtlpExport) -> Result<Tracer, TraceError> {
    let resource = Resource::new([
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            SERVICE_NAME,
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            config.service_version.clone(),
        ),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ]);
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(export.endpoint.clone())
        .with_timeout(export.timeout);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            opentelemetry_sdk::trace::config()
                .with_sampler(export.sampler())
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
}

/// Flush pending spans. A no-op when export was never enabled.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
