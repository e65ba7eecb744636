//! The fixed set of tools a conversational driver may call.
//!
//! Reads run immediately. Writes take two steps: a `confirm_*` call returns a
//! preview that the user must approve, and only then may the matching
//! `execute_*` call apply it. The [`policy::DispatchLedger`] enforces that
//! ordering; the engines themselves know nothing about conversations.

pub mod policy;

use crate::address::{CellAddress, CellRange};
use crate::confirm::{Confirmation, prepare_cell_update, prepare_range_update};
use crate::error::{
    AddressError, ConfirmError, ErrorCode, InvokeError, PolicyViolation, ShapeMismatch, StoreError,
};
use crate::execute::{self, Execution, execute_confirmation};
use crate::metrics::{METRICS, ToolCallMetrics};
use crate::model::{Literal, RangeData};
use crate::state::AppState;
use policy::{DEFAULT_CONVERSATION, ExecuteRequest};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tokio::task;
use tracing::Instrument;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, AsRefStr, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolName {
    GetRange,
    ExplainFormula,
    ConfirmCellUpdate,
    ConfirmRangeUpdate,
    ExecuteCellUpdate,
    ExecuteRangeUpdate,
    CancelUpdate,
    BeginTurn,
}

// =============================================================================
// PARAMETERS
// =============================================================================

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetRangeParams {
    /// Conversation the call belongs to; omitted calls share one default.
    pub thread_id: Option<String>,
    pub sheet: String,
    /// Top-left cell, e.g. "A1"
    pub from: String,
    /// Bottom-right cell, e.g. "C3"
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExplainFormulaParams {
    pub thread_id: Option<String>,
    pub sheet: String,
    pub cell: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ConfirmCellUpdateParams {
    pub thread_id: Option<String>,
    pub sheet: String,
    pub cell: String,
    #[serde(alias = "newValue")]
    pub new_value: Literal,
    /// Why the change is being proposed, shown to the user.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ConfirmRangeUpdateParams {
    pub thread_id: Option<String>,
    pub sheet: String,
    pub from: String,
    pub to: String,
    /// Row-major grid with exactly the range's shape.
    pub values: Vec<Vec<Literal>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteCellUpdateParams {
    pub thread_id: Option<String>,
    pub sheet: String,
    pub cell: String,
    #[serde(alias = "newValue")]
    pub new_value: Literal,
    /// Id returned by confirm_cell_update. Optional when target and value match.
    pub confirmation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteRangeUpdateParams {
    pub thread_id: Option<String>,
    pub sheet: String,
    pub from: String,
    pub to: String,
    pub values: Vec<Vec<Literal>>,
    pub confirmation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CancelUpdateParams {
    pub thread_id: Option<String>,
    pub confirmation_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct BeginTurnParams {
    pub thread_id: Option<String>,
}

fn conversation(thread_id: &Option<String>) -> String {
    thread_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(DEFAULT_CONVERSATION)
        .to_string()
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of any tool call. Every variant carries a human-readable message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolOutcome {
    RangeRead {
        data: RangeData,
        display: String,
        message: String,
    },
    FormulaExplained {
        sheet: String,
        cell: CellAddress,
        formula: String,
        explanation: String,
        message: String,
    },
    Confirmation {
        confirmation: Confirmation,
        message: String,
    },
    Execution {
        execution: Execution,
        message: String,
    },
    Cancelled {
        confirmation_id: String,
        message: String,
    },
    TurnStarted {
        turn: u64,
        step_budget: usize,
        pending_confirmations: Vec<String>,
        message: String,
    },
    Rejected(Rejection),
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub tool: ToolName,
    pub code: ErrorCode,
    pub category: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_sheets: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape_mismatch: Option<ShapeMismatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<PolicyViolation>,
}

impl Rejection {
    fn new(tool: ToolName, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            tool,
            code,
            category: code.category(),
            message: message.into(),
            available_sheets: None,
            shape_mismatch: None,
            violation: None,
        }
    }

    fn policy(tool: ToolName, violation: PolicyViolation) -> Self {
        Self {
            violation: Some(violation.clone()),
            ..Self::new(tool, violation.code(), violation.to_string())
        }
    }

    fn store(tool: ToolName, error: StoreError) -> Self {
        let mut rejection = Self::new(tool, error.code(), error.to_string());
        if let StoreError::SheetNotFound { available, .. } = error {
            rejection.available_sheets = Some(available);
        }
        rejection
    }

    fn address(tool: ToolName, error: AddressError) -> Self {
        Self::new(tool, ErrorCode::InvalidAddress, error.to_string())
    }

    fn confirm(tool: ToolName, error: ConfirmError) -> Self {
        match error {
            ConfirmError::Store(error) => Self::store(tool, error),
            ConfirmError::Shape(mismatch) => Self {
                shape_mismatch: Some(mismatch.clone()),
                ..Self::new(tool, ErrorCode::ShapeMismatch, mismatch.to_string())
            },
        }
    }
}

impl ToolOutcome {
    pub fn message(&self) -> &str {
        match self {
            ToolOutcome::RangeRead { message, .. }
            | ToolOutcome::FormulaExplained { message, .. }
            | ToolOutcome::Confirmation { message, .. }
            | ToolOutcome::Execution { message, .. }
            | ToolOutcome::Cancelled { message, .. }
            | ToolOutcome::TurnStarted { message, .. } => message,
            ToolOutcome::Rejected(rejection) => &rejection.message,
        }
    }

    /// Rejections and failed executions.
    pub fn is_error(&self) -> bool {
        match self {
            ToolOutcome::Rejected(_) => true,
            ToolOutcome::Execution { execution, .. } => !execution.success(),
            _ => false,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ToolOutcome::Rejected(rejection) => Some(rejection.code),
            ToolOutcome::Execution { execution, .. } => execution.error_code(),
            _ => None,
        }
    }

    /// Text handed back to the driving model alongside the structured result.
    pub fn to_text(&self) -> String {
        match self {
            ToolOutcome::RangeRead {
                display, message, ..
            } => format!("{message}\n{display}"),
            _ => self.message().to_string(),
        }
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Common wrapper: tool gating, step budget, metrics, tracing, and moving the
/// synchronous work off the async runtime.
async fn dispatch<F>(
    state: Arc<AppState>,
    tool: ToolName,
    conversation: String,
    work: F,
) -> ToolOutcome
where
    F: FnOnce(&AppState, &str) -> ToolOutcome + Send + 'static,
{
    let metrics = ToolCallMetrics::new(tool.as_ref());
    let span = tracing::info_span!("tool_call", tool = %tool, conversation = %conversation);

    let outcome = async {
        if !state.config().is_tool_enabled(tool.as_ref()) {
            return ToolOutcome::Rejected(Rejection::new(
                tool,
                ErrorCode::ToolDisabled,
                format!("tool {tool} is disabled by server configuration"),
            ));
        }
        if tool != ToolName::BeginTurn
            && let Err(violation) = state.ledger().record_step(&conversation)
        {
            return ToolOutcome::Rejected(Rejection::policy(tool, violation));
        }

        let worker_state = state.clone();
        task::spawn_blocking(move || work(worker_state.as_ref(), &conversation))
            .await
            .unwrap_or_else(|error| {
                tracing::error!(%error, "tool worker failed");
                ToolOutcome::Rejected(Rejection::new(
                    tool,
                    ErrorCode::InternalError,
                    format!("internal error while running {tool}"),
                ))
            })
    }
    .instrument(span.clone())
    .await;

    let _entered = span.enter();
    match &outcome {
        ToolOutcome::Rejected(rejection) => {
            tracing::info!(code = %rejection.code, message = %rejection.message, "tool call rejected");
            METRICS.record_rejection(tool.as_ref(), rejection.category, rejection.code.as_str());
            metrics.rejected();
        }
        outcome if outcome.is_error() => {
            tracing::warn!(message = %outcome.message(), "tool call failed");
            metrics.error();
        }
        _ => {
            tracing::debug!("tool call succeeded");
            metrics.success();
        }
    }
    outcome
}

pub async fn get_range(state: Arc<AppState>, params: GetRangeParams) -> ToolOutcome {
    let conv = conversation(&params.thread_id);
    dispatch(state, ToolName::GetRange, conv, move |state, conv| {
        let tool = ToolName::GetRange;
        let range = match CellRange::from_a1(&params.sheet, &params.from, &params.to) {
            Ok(range) => range,
            Err(error) => return ToolOutcome::Rejected(Rejection::address(tool, error)),
        };
        let data = match state.store().read_range(&range) {
            Ok(data) => data,
            Err(error) => return ToolOutcome::Rejected(Rejection::store(tool, error)),
        };
        if let Err(violation) = state.ledger().record_read(conv, &range) {
            return ToolOutcome::Rejected(Rejection::policy(tool, violation));
        }

        let display = render_grid(&data);
        let message = format!(
            "Read {} ({}x{} cells)",
            range,
            range.rows(),
            range.cols()
        );
        ToolOutcome::RangeRead {
            data,
            display,
            message,
        }
    })
    .await
}

fn render_grid(data: &RangeData) -> String {
    data.data
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| match &cell.formula {
                    Some(formula) => format!("{}: {} (={formula})", cell.cell, cell.value),
                    None => format!("{}: {}", cell.cell, cell.value),
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn explain_formula(state: Arc<AppState>, params: ExplainFormulaParams) -> ToolOutcome {
    let conv = conversation(&params.thread_id);
    dispatch(state, ToolName::ExplainFormula, conv, move |state, _| {
        let tool = ToolName::ExplainFormula;
        let cell = match CellAddress::decode(&params.cell) {
            Ok(cell) => cell,
            Err(error) => return ToolOutcome::Rejected(Rejection::address(tool, error)),
        };
        match state.store().get_formula(&params.sheet, cell) {
            Some(formula) => ToolOutcome::FormulaExplained {
                explanation: format!("Formula in cell {cell}: ={formula}"),
                message: format!("{}!{cell} holds a formula", params.sheet),
                sheet: params.sheet,
                cell,
                formula,
            },
            None => ToolOutcome::Rejected(Rejection::new(
                tool,
                ErrorCode::NoFormula,
                format!("No formula found in cell {cell}"),
            )),
        }
    })
    .await
}

pub async fn confirm_cell_update(
    state: Arc<AppState>,
    params: ConfirmCellUpdateParams,
) -> ToolOutcome {
    let conv = conversation(&params.thread_id);
    dispatch(state, ToolName::ConfirmCellUpdate, conv, move |state, conv| {
        let prepared = prepare_cell_update(
            &state.store(),
            &params.sheet,
            &params.cell,
            params.new_value,
            params.reason,
        );
        match prepared {
            Ok(preview) => issue(state, conv, Confirmation::Cell(preview)),
            Err(error) => {
                ToolOutcome::Rejected(Rejection::address(ToolName::ConfirmCellUpdate, error))
            }
        }
    })
    .await
}

pub async fn confirm_range_update(
    state: Arc<AppState>,
    params: ConfirmRangeUpdateParams,
) -> ToolOutcome {
    let conv = conversation(&params.thread_id);
    dispatch(state, ToolName::ConfirmRangeUpdate, conv, move |state, conv| {
        let prepared = prepare_range_update(
            &state.store(),
            &params.sheet,
            &params.from,
            &params.to,
            params.values,
            params.reason,
        );
        match prepared {
            Ok(preview) => issue(state, conv, Confirmation::Range(preview)),
            Err(error) => {
                ToolOutcome::Rejected(Rejection::confirm(ToolName::ConfirmRangeUpdate, error))
            }
        }
    })
    .await
}

fn issue(state: &AppState, conv: &str, confirmation: Confirmation) -> ToolOutcome {
    METRICS.record_confirmation(confirmation.kind());
    state.ledger().register(conv, confirmation.clone());
    let message = format!(
        "{} Waiting for the user to approve confirmation {}.",
        confirmation.message(),
        confirmation.id()
    );
    ToolOutcome::Confirmation {
        confirmation,
        message,
    }
}

pub async fn execute_cell_update(
    state: Arc<AppState>,
    params: ExecuteCellUpdateParams,
) -> ToolOutcome {
    let conv = conversation(&params.thread_id);
    dispatch(state, ToolName::ExecuteCellUpdate, conv, move |state, conv| {
        let config = state.config();
        let view = &config.view;
        let store = state.store();
        let Ok(cell) = CellAddress::decode(&params.cell) else {
            // Cannot match any preview; the engine reports the bad address.
            let raw = execute::execute_cell_update(
                &store,
                view,
                &params.sheet,
                &params.cell,
                params.new_value,
            );
            return finish(state, conv, Execution::Cell(raw));
        };

        let request = ExecuteRequest {
            kind: "cell",
            target: CellRange::single(params.sheet.clone(), cell),
            proposal: vec![vec![params.new_value.clone()]],
            confirmation_id: params.confirmation_id.as_deref(),
        };
        match state.ledger().claim(conv, &request) {
            Err(violation) => {
                ToolOutcome::Rejected(Rejection::policy(ToolName::ExecuteCellUpdate, violation))
            }
            Ok(Some(confirmation)) => {
                apply_confirmed(state, conv, ToolName::ExecuteCellUpdate, confirmation)
            }
            Ok(None) => {
                let raw = execute::execute_cell_update(
                    &store,
                    view,
                    &params.sheet,
                    &params.cell,
                    params.new_value,
                );
                finish(state, conv, Execution::Cell(raw))
            }
        }
    })
    .await
}

pub async fn execute_range_update(
    state: Arc<AppState>,
    params: ExecuteRangeUpdateParams,
) -> ToolOutcome {
    let conv = conversation(&params.thread_id);
    dispatch(state, ToolName::ExecuteRangeUpdate, conv, move |state, conv| {
        let config = state.config();
        let view = &config.view;
        let store = state.store();
        let Ok(target) = CellRange::from_a1(params.sheet.clone(), &params.from, &params.to) else {
            let raw = execute::execute_range_update(
                &store,
                view,
                &params.sheet,
                &params.from,
                &params.to,
                params.values,
            );
            return finish(state, conv, Execution::Range(raw));
        };

        let request = ExecuteRequest {
            kind: "range",
            target,
            proposal: params.values.clone(),
            confirmation_id: params.confirmation_id.as_deref(),
        };
        match state.ledger().claim(conv, &request) {
            Err(violation) => {
                ToolOutcome::Rejected(Rejection::policy(ToolName::ExecuteRangeUpdate, violation))
            }
            Ok(Some(confirmation)) => {
                apply_confirmed(state, conv, ToolName::ExecuteRangeUpdate, confirmation)
            }
            Ok(None) => {
                let raw = execute::execute_range_update(
                    &store,
                    view,
                    &params.sheet,
                    &params.from,
                    &params.to,
                    params.values,
                );
                finish(state, conv, Execution::Range(raw))
            }
        }
    })
    .await
}

/// Run a claimed confirmation. A stale target discards it; a failure that
/// wrote nothing hands it back so the user's approval is not lost.
fn apply_confirmed(
    state: &AppState,
    conv: &str,
    tool: ToolName,
    confirmation: Confirmation,
) -> ToolOutcome {
    let execution = execute_confirmation(&state.store(), &state.config().view, &confirmation);
    match execution.error_code() {
        Some(ErrorCode::StaleConfirmation) => {
            METRICS.record_execution(confirmation.kind(), false, state.store().version());
            ToolOutcome::Rejected(Rejection::policy(
                tool,
                PolicyViolation::StaleConfirmation {
                    confirmation_id: confirmation.id().to_string(),
                    target: confirmation.target().to_string(),
                },
            ))
        }
        // The write reached memory but not disk; the preview no longer
        // describes the live values.
        Some(ErrorCode::IoError) | None => finish(state, conv, execution),
        Some(_) => {
            state.ledger().restore(conv, confirmation);
            finish(state, conv, execution)
        }
    }
}

fn finish(state: &AppState, conv: &str, execution: Execution) -> ToolOutcome {
    let kind = match &execution {
        Execution::Cell(_) => "cell",
        Execution::Range(_) => "range",
    };
    METRICS.record_execution(kind, execution.success(), state.store().version());
    if execution.error_code() == Some(ErrorCode::IoError) {
        METRICS.record_persist_failure();
    }
    if execution.success() {
        state.ledger().resolve_reads(conv);
    }
    let message = execution.message().to_string();
    ToolOutcome::Execution { execution, message }
}

pub async fn cancel_update(state: Arc<AppState>, params: CancelUpdateParams) -> ToolOutcome {
    let conv = conversation(&params.thread_id);
    dispatch(state, ToolName::CancelUpdate, conv, move |state, conv| {
        match state.ledger().cancel(conv, &params.confirmation_id) {
            Ok(cancelled) => ToolOutcome::Cancelled {
                message: format!(
                    "Cancelled pending update of {}; nothing was written",
                    cancelled.target()
                ),
                confirmation_id: params.confirmation_id,
            },
            Err(violation) => {
                ToolOutcome::Rejected(Rejection::policy(ToolName::CancelUpdate, violation))
            }
        }
    })
    .await
}

pub async fn begin_turn(state: Arc<AppState>, params: BeginTurnParams) -> ToolOutcome {
    let conv = conversation(&params.thread_id);
    dispatch(state, ToolName::BeginTurn, conv, move |state, conv| {
        let ledger = state.ledger();
        let turn = ledger.begin_turn(conv);
        let pending_confirmations: Vec<String> = ledger
            .pending(conv)
            .iter()
            .map(|confirmation| confirmation.id().to_string())
            .collect();
        ToolOutcome::TurnStarted {
            message: format!(
                "Turn {turn} started with a budget of {} tool calls; {} update(s) awaiting approval",
                ledger.max_steps(),
                pending_confirmations.len()
            ),
            turn,
            step_budget: ledger.max_steps(),
            pending_confirmations,
        }
    })
    .await
}

/// Invoke a tool by name with untyped JSON parameters.
pub async fn invoke(
    state: Arc<AppState>,
    tool: &str,
    params: serde_json::Value,
) -> Result<ToolOutcome, InvokeError> {
    let name =
        ToolName::from_str(tool).map_err(|_| InvokeError::UnknownTool(tool.to_string()))?;
    let invalid = |source| InvokeError::InvalidParams {
        tool: tool.to_string(),
        source,
    };
    let outcome = match name {
        ToolName::GetRange => get_range(state, parse(params).map_err(invalid)?).await,
        ToolName::ExplainFormula => explain_formula(state, parse(params).map_err(invalid)?).await,
        ToolName::ConfirmCellUpdate => {
            confirm_cell_update(state, parse(params).map_err(invalid)?).await
        }
        ToolName::ConfirmRangeUpdate => {
            confirm_range_update(state, parse(params).map_err(invalid)?).await
        }
        ToolName::ExecuteCellUpdate => {
            execute_cell_update(state, parse(params).map_err(invalid)?).await
        }
        ToolName::ExecuteRangeUpdate => {
            execute_range_update(state, parse(params).map_err(invalid)?).await
        }
        ToolName::CancelUpdate => cancel_update(state, parse(params).map_err(invalid)?).await,
        ToolName::BeginTurn => begin_turn(state, parse(params).map_err(invalid)?).await,
    };
    Ok(outcome)
}

fn parse<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> serde_json::Result<T> {
    // `null` is accepted for tools whose parameters are all optional
    let params = if params.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params)
}
