use crate::error::ErrorCode;
use crate::state::AppState;
use crate::tools::{self, ToolOutcome};
use anyhow::Result;
use rmcp::{
    ErrorData as McpError, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use std::sync::Arc;

const BASE_INSTRUCTIONS: &str = "\
Spreadsheet assistant: read and edit one workbook on behalf of the user.

READ TOOLS (run immediately, no confirmation):
- get_range: read cells from a range, e.g. {sheet, from: \"A1\", to: \"C3\"}.
  Explain the values you found in your reply.
- explain_formula: the formula stored in one cell. Describe what it computes.

UPDATE TOOLS (always two steps):
1) confirm_cell_update / confirm_range_update: prepare a preview. Nothing is written.
   Tell the user what will change and WAIT for them to approve it.
2) execute_cell_update / execute_range_update: apply the update, ONLY after the user
   approved the preview. Pass the same target and values, ideally with the
   confirmation_id the preview returned.
- confirm_range_update values must match the range shape exactly (rows x columns).
- If the user declines, call cancel_update with the confirmation_id.
- After an execute, the result carries full_table_context: render it as a
  Markdown table so the user sees the updated state.

RULES:
- Never execute without a preview the user approved in this conversation.
- Do not read the same range twice in one turn; reuse the earlier result.
- Every tool result has a message. Always answer the user in text.
- Pass thread_id on every call so previews stay bound to their conversation.

ADDRESSES: A1 notation, uppercase column letters, rows from 1 (e.g. B2, AA10).";

fn build_instructions(require_confirmation: bool, max_steps: usize) -> String {
    let mut instructions = BASE_INSTRUCTIONS.to_string();
    instructions.push_str(&format!(
        "\n\nAt most {max_steps} tool calls per turn; call begin_turn when a new user message arrives."
    ));
    if !require_confirmation {
        instructions.push_str(
            "\nConfirmation is not enforced by this server; still preview every update.",
        );
    }
    instructions
}

#[derive(Clone)]
pub struct SheetChatServer {
    state: Arc<AppState>,
    tool_router: ToolRouter<SheetChatServer>,
}

impl SheetChatServer {
    pub fn from_state(state: Arc<AppState>) -> Self {
        Self {
            state,
            tool_router: Self::tool_router(),
        }
    }

    pub async fn run_stdio(self) -> Result<()> {
        let service = self
            .serve(stdio())
            .await
            .inspect_err(|error| tracing::error!("serving error: {:?}", error))?;
        service.waiting().await?;
        Ok(())
    }
}

#[tool_router]
impl SheetChatServer {
    #[tool(
        name = "get_range",
        description = "Read a range of cells (values and formulas) from a sheet"
    )]
    pub async fn get_range(
        &self,
        Parameters(params): Parameters<tools::GetRangeParams>,
    ) -> Result<CallToolResult, McpError> {
        into_call_result(tools::get_range(self.state.clone(), params).await)
    }

    #[tool(
        name = "explain_formula",
        description = "Return the formula stored in one cell"
    )]
    pub async fn explain_formula(
        &self,
        Parameters(params): Parameters<tools::ExplainFormulaParams>,
    ) -> Result<CallToolResult, McpError> {
        into_call_result(tools::explain_formula(self.state.clone(), params).await)
    }

    #[tool(
        name = "confirm_cell_update",
        description = "Preview a single-cell update for the user to approve. Does NOT modify the workbook."
    )]
    pub async fn confirm_cell_update(
        &self,
        Parameters(params): Parameters<tools::ConfirmCellUpdateParams>,
    ) -> Result<CallToolResult, McpError> {
        into_call_result(tools::confirm_cell_update(self.state.clone(), params).await)
    }

    #[tool(
        name = "confirm_range_update",
        description = "Preview a range update for the user to approve. Values must match the range shape. Does NOT modify the workbook."
    )]
    pub async fn confirm_range_update(
        &self,
        Parameters(params): Parameters<tools::ConfirmRangeUpdateParams>,
    ) -> Result<CallToolResult, McpError> {
        into_call_result(tools::confirm_range_update(self.state.clone(), params).await)
    }

    #[tool(
        name = "execute_cell_update",
        description = "Apply a cell update the user approved via confirm_cell_update. Modifies the workbook."
    )]
    pub async fn execute_cell_update(
        &self,
        Parameters(params): Parameters<tools::ExecuteCellUpdateParams>,
    ) -> Result<CallToolResult, McpError> {
        into_call_result(tools::execute_cell_update(self.state.clone(), params).await)
    }

    #[tool(
        name = "execute_range_update",
        description = "Apply a range update the user approved via confirm_range_update. Modifies the workbook."
    )]
    pub async fn execute_range_update(
        &self,
        Parameters(params): Parameters<tools::ExecuteRangeUpdateParams>,
    ) -> Result<CallToolResult, McpError> {
        into_call_result(tools::execute_range_update(self.state.clone(), params).await)
    }

    #[tool(
        name = "cancel_update",
        description = "Discard a pending preview the user declined"
    )]
    pub async fn cancel_update(
        &self,
        Parameters(params): Parameters<tools::CancelUpdateParams>,
    ) -> Result<CallToolResult, McpError> {
        into_call_result(tools::cancel_update(self.state.clone(), params).await)
    }

    #[tool(
        name = "begin_turn",
        description = "Start a new conversational turn: resets the per-turn tool budget and read history"
    )]
    pub async fn begin_turn(
        &self,
        Parameters(params): Parameters<tools::BeginTurnParams>,
    ) -> Result<CallToolResult, McpError> {
        into_call_result(tools::begin_turn(self.state.clone(), params).await)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for SheetChatServer {
    fn get_info(&self) -> ServerInfo {
        let config = self.state.config();
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(build_instructions(
                config.require_confirmation,
                config.max_tool_steps,
            )),
            ..ServerInfo::default()
        }
    }
}

/// Rejections stay in-band (`is_error`) so the model can read the message;
/// only a disabled tool is a protocol-level error.
fn into_call_result(outcome: ToolOutcome) -> Result<CallToolResult, McpError> {
    if let ToolOutcome::Rejected(rejection) = &outcome
        && rejection.code == ErrorCode::ToolDisabled
    {
        return Err(to_mcp_error(rejection.code, &rejection.message));
    }
    let structured_content = serde_json::to_value(&outcome).map_err(|e| {
        to_mcp_error(
            ErrorCode::InternalError,
            &format!("failed to serialize response: {e}"),
        )
    })?;
    Ok(CallToolResult {
        content: vec![Content::text(outcome.to_text())],
        structured_content: Some(structured_content),
        is_error: Some(outcome.is_error()),
        meta: None,
    })
}

pub fn to_mcp_error(code: ErrorCode, message: &str) -> McpError {
    let data = Some(serde_json::json!({ "code": code.as_str(), "category": code.category() }));
    match code {
        ErrorCode::ToolDisabled | ErrorCode::MethodNotFound => {
            McpError::invalid_request(message.to_string(), data)
        }
        ErrorCode::InvalidParams
        | ErrorCode::InvalidAddress
        | ErrorCode::ShapeMismatch
        | ErrorCode::RangeTooLarge => {
            McpError::invalid_params(message.to_string(), data)
        }
        _ => McpError::internal_error(message.to_string(), data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_mention_budget_and_enforcement() {
        let strict = build_instructions(true, 5);
        assert!(strict.contains("At most 5 tool calls"));
        assert!(!strict.contains("not enforced"));
        assert!(build_instructions(false, 3).contains("not enforced"));
    }
}
