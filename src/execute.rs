//! Applies writes to the store and reports old versus new state.
//!
//! Nothing here returns an error: every failure becomes `success: false`
//! with a message, so a result can always be shown in the conversation.

use crate::address::{CellAddress, CellRange};
use crate::confirm::Confirmation;
use crate::error::{ErrorCode, StoreError};
use crate::model::{CellValue, Literal, RangeData};
use crate::workbook::WorkbookStore;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Execution {
    Cell(CellExecution),
    Range(RangeExecution),
}

impl Execution {
    pub fn success(&self) -> bool {
        match self {
            Execution::Cell(c) => c.success,
            Execution::Range(r) => r.success,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Execution::Cell(c) => c.error_code,
            Execution::Range(r) => r.error_code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Execution::Cell(c) => &c.message,
            Execution::Range(r) => &r.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellExecution {
    pub success: bool,
    pub sheet: String,
    pub cell: String,
    pub old_value: Option<CellValue>,
    pub new_value: Literal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_table_context: Option<RangeData>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeExecution {
    pub success: bool,
    pub sheet: String,
    pub from: String,
    pub to: String,
    pub old_values: Option<Vec<Vec<CellValue>>>,
    pub new_values: Vec<Vec<Literal>>,
    /// rows(values) x cols(values[0]), as proposed.
    pub cells_updated: Option<usize>,
    /// Cells actually written after clipping to the range.
    pub cells_written: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_table_context: Option<RangeData>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

/// Write one cell unconditionally.
pub fn execute_cell_update(
    store: &WorkbookStore,
    view: &CellRange,
    sheet: &str,
    cell: &str,
    value: Literal,
) -> CellExecution {
    apply_cell(store, view, sheet, cell, value, None)
}

/// Write a range unconditionally. The proposal shape is not re-validated;
/// values outside the range are skipped by the store.
pub fn execute_range_update(
    store: &WorkbookStore,
    view: &CellRange,
    sheet: &str,
    from: &str,
    to: &str,
    values: Vec<Vec<Literal>>,
) -> RangeExecution {
    apply_range(store, view, sheet, from, to, values, None)
}

/// Apply a previously prepared artifact, but only if its target still holds
/// the snapshot it was prepared against. A changed target fails with
/// [`ErrorCode::StaleConfirmation`] and writes nothing.
pub fn execute_confirmation(
    store: &WorkbookStore,
    view: &CellRange,
    confirmation: &Confirmation,
) -> Execution {
    match confirmation {
        Confirmation::Cell(c) => Execution::Cell(apply_cell(
            store,
            view,
            &c.sheet,
            &c.cell.encode(),
            c.proposed_value.clone(),
            Some(&c.current_value),
        )),
        Confirmation::Range(r) => Execution::Range(apply_range(
            store,
            view,
            &r.sheet,
            &r.from.encode(),
            &r.to.encode(),
            r.proposed_values.clone(),
            Some(r.current_data.as_slice()),
        )),
    }
}

fn apply_cell(
    store: &WorkbookStore,
    view: &CellRange,
    sheet: &str,
    cell: &str,
    value: Literal,
    expected: Option<&CellValue>,
) -> CellExecution {
    let written = CellAddress::decode(cell)
        .map_err(StoreError::from)
        .and_then(|address| match expected {
            Some(expected) => store.write_cell_if(sheet, address, &value, expected),
            None => store.write_cell(sheet, address, &value),
        });

    match written {
        Ok(write) => {
            let mut warnings = Vec::new();
            let full_table_context = reread_view(store, view, &mut warnings);
            tracing::info!(sheet, cell, version = write.version, "cell update executed");
            CellExecution {
                success: true,
                sheet: sheet.to_string(),
                cell: cell.to_string(),
                message: format!(
                    "Cell {cell} successfully updated from \"{}\" to \"{value}\"",
                    write.previous
                ),
                old_value: Some(write.previous),
                new_value: value,
                full_table_context,
                warnings,
                error_code: None,
            }
        }
        Err(error) => {
            tracing::warn!(sheet, cell, %error, "cell update failed");
            CellExecution {
                success: false,
                sheet: sheet.to_string(),
                cell: cell.to_string(),
                old_value: None,
                new_value: value,
                full_table_context: None,
                message: format!("Failed to update cell: {error}"),
                warnings: Vec::new(),
                error_code: Some(error.code()),
            }
        }
    }
}

fn apply_range(
    store: &WorkbookStore,
    view: &CellRange,
    sheet: &str,
    from: &str,
    to: &str,
    values: Vec<Vec<Literal>>,
    expected: Option<&[Vec<CellValue>]>,
) -> RangeExecution {
    let cells_updated = values.len() * values.first().map_or(0, Vec::len);
    let written = CellRange::from_a1(sheet, from, to)
        .map_err(StoreError::from)
        .and_then(|range| {
            let write = match expected {
                Some(expected) => store.write_range_if(&range, &values, expected),
                None => store.write_range(&range, &values),
            }?;
            Ok((range, write))
        });

    match written {
        Ok((range, write)) => {
            let mut warnings = Vec::new();
            if write.cells_written != cells_updated {
                warnings.push(format!(
                    "{} of {} proposed values fell inside {}; the rest were skipped",
                    write.cells_written,
                    cells_updated,
                    range.a1()
                ));
            }
            let full_table_context = reread_view(store, view, &mut warnings);
            tracing::info!(
                sheet,
                range = %range.a1(),
                cells_updated,
                cells_written = write.cells_written,
                version = write.version,
                "range update executed"
            );
            RangeExecution {
                success: true,
                sheet: sheet.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                old_values: Some(write.previous),
                new_values: values,
                cells_updated: Some(cells_updated),
                cells_written: Some(write.cells_written),
                full_table_context,
                message: format!("Range {from}:{to} successfully updated ({cells_updated} cells)"),
                warnings,
                error_code: None,
            }
        }
        Err(error) => {
            tracing::warn!(sheet, from, to, %error, "range update failed");
            RangeExecution {
                success: false,
                sheet: sheet.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                old_values: None,
                new_values: values,
                cells_updated: None,
                cells_written: None,
                full_table_context: None,
                message: format!("Failed to update range: {error}"),
                warnings: Vec::new(),
                error_code: Some(error.code()),
            }
        }
    }
}

/// The write already happened; a failed re-read only costs the context.
fn reread_view(
    store: &WorkbookStore,
    view: &CellRange,
    warnings: &mut Vec<String>,
) -> Option<RangeData> {
    match store.read_range(view) {
        Ok(data) => Some(data),
        Err(error) => {
            tracing::warn!(view = %view, %error, "view window re-read failed after write");
            warnings.push(format!("could not re-read {view} after the update: {error}"));
            None
        }
    }
}
