//! Error taxonomy for the sheet-chat core.
//!
//! Expected conditions (bad addresses, missing sheets, shape mismatches,
//! persistence failures, protocol violations) are typed values so the tool
//! layer can always turn them into a message for the conversation. `anyhow`
//! is reserved for the application edges: startup, config, transports.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Numeric error codes following JSON-RPC 2.0 plus application codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ErrorCode {
    /// Method (tool) does not exist
    MethodNotFound = -32601,
    /// Invalid method parameter(s)
    InvalidParams = -32602,
    /// Internal error
    InternalError = -32603,

    /// Sheet not found in workbook
    SheetNotFound = -32006,
    /// Cell or range reference is malformed
    InvalidAddress = -32007,
    /// Sheet name rejected for a new sheet
    InvalidSheetName = -32008,
    /// Durable write or read failed
    IoError = -32012,
    /// Tool disabled by configuration
    ToolDisabled = -32014,
    /// Confirmation id not known for this conversation
    ConfirmationNotFound = -32017,
    /// Cell holds no formula
    NoFormula = -32019,
    /// Proposed values disagree with the live range shape
    ShapeMismatch = -32021,
    /// Execute attempted without a matching confirmation
    ConfirmationRequired = -32022,
    /// Target changed since the confirmation was prepared
    StaleConfirmation = -32023,
    /// Same range read twice within one turn
    DuplicateRead = -32024,
    /// Too many tool calls within one turn
    StepBudgetExhausted = -32025,
    /// Thread not found
    ThreadNotFound = -32026,
    /// Range spans more cells than the configured limit
    RangeTooLarge = -32027,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Category label used for metrics and HTTP status mapping.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParams
            | ErrorCode::InvalidAddress
            | ErrorCode::InvalidSheetName
            | ErrorCode::ShapeMismatch
            | ErrorCode::RangeTooLarge => "validation_error",
            ErrorCode::MethodNotFound
            | ErrorCode::SheetNotFound
            | ErrorCode::ConfirmationNotFound
            | ErrorCode::ThreadNotFound
            | ErrorCode::NoFormula => "resource_not_found",
            ErrorCode::ConfirmationRequired
            | ErrorCode::StaleConfirmation
            | ErrorCode::DuplicateRead
            | ErrorCode::StepBudgetExhausted
            | ErrorCode::ToolDisabled => "policy",
            ErrorCode::IoError => "io_error",
            ErrorCode::InternalError => "server_error",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MethodNotFound => "method_not_found",
            ErrorCode::InvalidParams => "invalid_params",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::SheetNotFound => "sheet_not_found",
            ErrorCode::InvalidAddress => "invalid_address",
            ErrorCode::InvalidSheetName => "invalid_sheet_name",
            ErrorCode::IoError => "io_error",
            ErrorCode::ToolDisabled => "tool_disabled",
            ErrorCode::ConfirmationNotFound => "confirmation_not_found",
            ErrorCode::NoFormula => "no_formula",
            ErrorCode::ShapeMismatch => "shape_mismatch",
            ErrorCode::ConfirmationRequired => "confirmation_required",
            ErrorCode::StaleConfirmation => "stale_confirmation",
            ErrorCode::DuplicateRead => "duplicate_read",
            ErrorCode::StepBudgetExhausted => "step_budget_exhausted",
            ErrorCode::ThreadNotFound => "thread_not_found",
            ErrorCode::RangeTooLarge => "range_too_large",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.code())
    }
}

// =============================================================================
// DOMAIN ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid cell reference '{0}': expected column letters followed by a row number, e.g. B2")]
    InvalidFormat(String),
    #[error("range {from}:{to} has its bounds out of order; the first cell must be the top-left corner")]
    InvertedRange { from: String, to: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("sheet \"{sheet}\" not found. Available sheets: {}", .available.join(", "))]
    SheetNotFound {
        sheet: String,
        available: Vec<String>,
    },
    #[error("range {range} spans {cells} cells; at most {limit} may be read or written at once")]
    RangeTooLarge {
        range: String,
        cells: usize,
        limit: usize,
    },
    #[error("invalid sheet name \"{name}\": {reason}")]
    InvalidSheetName { name: String, reason: &'static str },
    #[error("{address} on sheet \"{sheet}\" changed since it was previewed")]
    Conflict { sheet: String, address: String },
    #[error("failed to persist workbook to {}: {reason}", .path.display())]
    Persistence { path: PathBuf, reason: String },
    #[error("failed to load workbook {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::Address(_) => ErrorCode::InvalidAddress,
            StoreError::SheetNotFound { .. } => ErrorCode::SheetNotFound,
            StoreError::RangeTooLarge { .. } => ErrorCode::RangeTooLarge,
            StoreError::InvalidSheetName { .. } => ErrorCode::InvalidSheetName,
            StoreError::Conflict { .. } => ErrorCode::StaleConfirmation,
            StoreError::Persistence { .. } | StoreError::Load { .. } => ErrorCode::IoError,
        }
    }
}

/// Proposed range values whose shape disagrees with the live range.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeMismatch {
    #[error("row count mismatch: expected {expected_rows}, got {got_rows}")]
    Rows { expected_rows: usize, got_rows: usize },
    #[error("column count mismatch in row {row_index}: expected {expected_cols}, got {got_cols}")]
    Columns {
        expected_cols: usize,
        got_cols: usize,
        row_index: usize,
    },
}

#[derive(Debug, Error)]
pub enum ConfirmError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Shape(#[from] ShapeMismatch),
}

impl From<AddressError> for ConfirmError {
    fn from(error: AddressError) -> Self {
        ConfirmError::Store(StoreError::Address(error))
    }
}

impl ConfirmError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConfirmError::Store(error) => error.code(),
            ConfirmError::Shape(_) => ErrorCode::ShapeMismatch,
        }
    }
}

/// Invocation-policy violations detected by the dispatch ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum PolicyViolation {
    #[error("no confirmation is pending for {target}; call the matching confirm tool and wait for the user to approve it")]
    UnconfirmedExecute { target: String },
    #[error("confirmation {confirmation_id} is unknown, already executed, or cancelled")]
    UnknownConfirmation { confirmation_id: String },
    #[error("confirmation {confirmation_id} was prepared for different values or a different target than this execute")]
    ConfirmationMismatch { confirmation_id: String },
    #[error("{target} changed after confirmation {confirmation_id} was prepared; prepare a new preview")]
    StaleConfirmation {
        confirmation_id: String,
        target: String,
    },
    #[error("{target} was already read in this turn; reuse the earlier result")]
    DuplicateRead { target: String },
    #[error("tool call budget of {limit} exhausted for this turn; answer the user in text, or call begin_turn to start a new turn")]
    StepBudgetExhausted { limit: usize },
}

impl PolicyViolation {
    pub fn code(&self) -> ErrorCode {
        match self {
            PolicyViolation::UnconfirmedExecute { .. }
            | PolicyViolation::ConfirmationMismatch { .. } => ErrorCode::ConfirmationRequired,
            PolicyViolation::UnknownConfirmation { .. } => ErrorCode::ConfirmationNotFound,
            PolicyViolation::StaleConfirmation { .. } => ErrorCode::StaleConfirmation,
            PolicyViolation::DuplicateRead { .. } => ErrorCode::DuplicateRead,
            PolicyViolation::StepBudgetExhausted { .. } => ErrorCode::StepBudgetExhausted,
        }
    }
}

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("thread {0} not found")]
    NotFound(String),
    #[error("thread title must not be empty")]
    InvalidTitle,
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("thread storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("thread storage unavailable at {}: {reason}", .path.display())]
    Open { path: PathBuf, reason: String },
}

impl ThreadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ThreadError::NotFound(_) => ErrorCode::ThreadNotFound,
            ThreadError::InvalidTitle | ThreadError::EmptyMessage => ErrorCode::InvalidParams,
            ThreadError::Storage(_) | ThreadError::Open { .. } => ErrorCode::IoError,
        }
    }
}

/// Failure to even start a tool call from untyped input (REST route).
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid parameters for {tool}: {source}")]
    InvalidParams {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
}

impl InvokeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InvokeError::UnknownTool(_) => ErrorCode::MethodNotFound,
            InvokeError::InvalidParams { .. } => ErrorCode::InvalidParams,
        }
    }
}
