//! Prometheus metrics for tool dispatch and the confirm/execute protocol.
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics registry instance
pub static METRICS: Lazy<Arc<MetricsCollector>> = Lazy::new(|| Arc::new(MetricsCollector::new()));

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ToolCallLabels {
    pub tool: String,
    /// "success", "rejected" or "error"
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ToolLabels {
    pub tool: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    /// "cell" or "range"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecutionLabels {
    pub kind: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabels {
    pub tool: String,
    /// Error category, see `ErrorCode::category`
    pub category: String,
    pub code: String,
}

pub struct MetricsCollector {
    registry: RwLock<Registry>,

    pub tool_calls_total: Family<ToolCallLabels, Counter>,
    pub tool_call_duration_seconds: Family<ToolLabels, Histogram>,
    pub tool_calls_active: Family<ToolLabels, Gauge>,

    pub confirmations_issued_total: Family<KindLabels, Counter>,
    pub executions_total: Family<ExecutionLabels, Counter>,
    pub rejections_total: Family<RejectionLabels, Counter>,

    /// Failed attempts to write the workbook file
    pub persist_failures_total: Counter,
    pub workbook_version: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let tool_calls_total = Family::<ToolCallLabels, Counter>::default();
        registry.register(
            "sheet_chat_tool_calls",
            "Tool invocations by tool and status",
            tool_calls_total.clone(),
        );

        let tool_call_duration_seconds =
            Family::<ToolLabels, Histogram>::new_with_constructor(|| {
                // 1ms .. ~16s
                Histogram::new(exponential_buckets(0.001, 2.5, 12))
            });
        registry.register(
            "sheet_chat_tool_call_duration_seconds",
            "Tool invocation latency in seconds",
            tool_call_duration_seconds.clone(),
        );

        let tool_calls_active = Family::<ToolLabels, Gauge>::default();
        registry.register(
            "sheet_chat_tool_calls_active",
            "Tool invocations currently in flight",
            tool_calls_active.clone(),
        );

        let confirmations_issued_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "sheet_chat_confirmations_issued",
            "Update previews handed to the conversation",
            confirmations_issued_total.clone(),
        );

        let executions_total = Family::<ExecutionLabels, Counter>::default();
        registry.register(
            "sheet_chat_executions",
            "Executed updates by kind and outcome",
            executions_total.clone(),
        );

        let rejections_total = Family::<RejectionLabels, Counter>::default();
        registry.register(
            "sheet_chat_rejections",
            "Tool calls rejected by validation or invocation policy",
            rejections_total.clone(),
        );

        let persist_failures_total = Counter::default();
        registry.register(
            "sheet_chat_persist_failures",
            "Workbook writes that failed to reach disk",
            persist_failures_total.clone(),
        );

        let workbook_version = Gauge::default();
        registry.register(
            "sheet_chat_workbook_version",
            "Mutation counter of the in-memory workbook",
            workbook_version.clone(),
        );

        Self {
            registry: RwLock::new(registry),
            tool_calls_total,
            tool_call_duration_seconds,
            tool_calls_active,
            confirmations_issued_total,
            executions_total,
            rejections_total,
            persist_failures_total,
            workbook_version,
        }
    }

    /// Encode metrics in Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let registry = self.registry.read();
        if let Err(error) = encode(&mut buffer, &registry) {
            tracing::warn!(%error, "failed to encode metrics");
        }
        buffer
    }

    fn record_call(&self, tool: &str, status: &str, duration: Duration) {
        self.tool_calls_total
            .get_or_create(&ToolCallLabels {
                tool: tool.to_string(),
                status: status.to_string(),
            })
            .inc();
        self.tool_call_duration_seconds
            .get_or_create(&ToolLabels {
                tool: tool.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    pub fn record_confirmation(&self, kind: &str) {
        self.confirmations_issued_total
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn record_execution(&self, kind: &str, success: bool, version: u64) {
        let outcome = if success { "success" } else { "failure" };
        self.executions_total
            .get_or_create(&ExecutionLabels {
                kind: kind.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.workbook_version.set(version as i64);
    }

    pub fn record_rejection(&self, tool: &str, category: &str, code: &str) {
        self.rejections_total
            .get_or_create(&RejectionLabels {
                tool: tool.to_string(),
                category: category.to_string(),
                code: code.to_string(),
            })
            .inc();
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures_total.inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard timing one tool call. Dropping it unfinished counts as an error.
pub struct ToolCallMetrics {
    tool: String,
    start: Instant,
    completed: bool,
}

impl ToolCallMetrics {
    pub fn new(tool: &str) -> Self {
        METRICS
            .tool_calls_active
            .get_or_create(&ToolLabels {
                tool: tool.to_string(),
            })
            .inc();
        Self {
            tool: tool.to_string(),
            start: Instant::now(),
            completed: false,
        }
    }

    pub fn success(self) {
        self.finish("success");
    }

    pub fn rejected(self) {
        self.finish("rejected");
    }

    pub fn error(self) {
        self.finish("error");
    }

    fn finish(mut self, status: &str) {
        self.complete(status);
    }

    fn complete(&mut self, status: &str) {
        METRICS.record_call(&self.tool, status, self.start.elapsed());
        METRICS
            .tool_calls_active
            .get_or_create(&ToolLabels {
                tool: self.tool.clone(),
            })
            .dec();
        self.completed = true;
    }
}

impl Drop for ToolCallMetrics {
    fn drop(&mut self) {
        if !self.completed {
            self.complete("error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_recorded_tool_calls() {
        let collector = MetricsCollector::new();
        collector.record_call("get_range", "success", Duration::from_millis(3));
        collector.record_rejection("execute_cell_update", "policy", "confirmation_required");
        let text = collector.encode();
        assert!(text.contains("sheet_chat_tool_calls_total"));
        assert!(text.contains("tool=\"get_range\""));
        assert!(text.contains("code=\"confirmation_required\""));
    }

    #[test]
    fn guard_records_on_drop() {
        {
            let _guard = ToolCallMetrics::new("metrics_guard_probe");
        }
        let text = METRICS.encode();
        assert!(text.contains("tool=\"metrics_guard_probe\",status=\"error\""));
    }
}
