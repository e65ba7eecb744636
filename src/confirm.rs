//! Confirmation artifacts: read-only previews of a proposed write.
//!
//! An artifact is a pure function of the store state and the proposal. It
//! captures the values currently at the target so the user can compare them
//! with what will be written, and it carries a deterministic id the execute
//! step can name.

use crate::address::{CellAddress, CellRange};
use crate::error::{AddressError, ConfirmError, ShapeMismatch};
use crate::model::{CellValue, Literal};
use crate::utils::short_digest_id;
use crate::workbook::WorkbookStore;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Confirmation {
    Cell(CellConfirmation),
    Range(RangeConfirmation),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellConfirmation {
    pub confirmation_id: String,
    pub sheet: String,
    pub cell: CellAddress,
    pub current_value: CellValue,
    pub proposed_value: Literal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeConfirmation {
    pub confirmation_id: String,
    pub sheet: String,
    pub from: CellAddress,
    pub to: CellAddress,
    pub current_data: Vec<Vec<CellValue>>,
    pub proposed_values: Vec<Vec<Literal>>,
    pub cell_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
}

impl Confirmation {
    pub fn id(&self) -> &str {
        match self {
            Confirmation::Cell(c) => &c.confirmation_id,
            Confirmation::Range(r) => &r.confirmation_id,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Confirmation::Cell(c) => &c.message,
            Confirmation::Range(r) => &r.message,
        }
    }

    pub fn target(&self) -> CellRange {
        match self {
            Confirmation::Cell(c) => CellRange::single(c.sheet.clone(), c.cell),
            Confirmation::Range(r) => CellRange {
                sheet: r.sheet.clone(),
                from: r.from,
                to: r.to,
            },
        }
    }

    /// Proposed values as a grid; a cell proposal is 1x1.
    pub fn proposal(&self) -> Vec<Vec<Literal>> {
        match self {
            Confirmation::Cell(c) => vec![vec![c.proposed_value.clone()]],
            Confirmation::Range(r) => r.proposed_values.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Confirmation::Cell(_) => "cell",
            Confirmation::Range(_) => "range",
        }
    }
}

/// Preview a single-cell write. Only a malformed address can fail.
pub fn prepare_cell_update(
    store: &WorkbookStore,
    sheet: &str,
    cell: &str,
    proposed: Literal,
    reason: Option<String>,
) -> Result<CellConfirmation, AddressError> {
    let address = CellAddress::decode(cell)?;
    let current_value = store.read_cell(sheet, address);
    let confirmation_id = confirmation_id(
        "cell",
        &CellRange::single(sheet, address),
        &[vec![current_value.clone()]],
        &[vec![proposed.clone()]],
    );
    let message = format!("Update {sheet}!{address} from {current_value} to {proposed}?");

    tracing::debug!(%confirmation_id, sheet, cell = %address, "cell update previewed");
    Ok(CellConfirmation {
        confirmation_id,
        sheet: sheet.to_string(),
        cell: address,
        current_value,
        proposed_value: proposed,
        reason,
        message,
    })
}

/// Preview a range write. The proposal must match the range shape exactly.
pub fn prepare_range_update(
    store: &WorkbookStore,
    sheet: &str,
    from: &str,
    to: &str,
    proposed: Vec<Vec<Literal>>,
    reason: Option<String>,
) -> Result<RangeConfirmation, ConfirmError> {
    let range = CellRange::from_a1(sheet, from, to)?;
    let current = store.read_range(&range)?;
    check_shape(current.data.len(), range.cols(), &proposed)?;

    let current_data = current.values();
    let rows = range.rows();
    let cols = range.cols();
    let cell_count = rows * cols;
    let confirmation_id = confirmation_id("range", &range, &current_data, &proposed);
    let message = format!(
        "Update range {}:{} ({rows}x{cols} = {cell_count} cells)?",
        range.from, range.to
    );

    tracing::debug!(%confirmation_id, sheet, range = %range.a1(), cell_count, "range update previewed");
    Ok(RangeConfirmation {
        confirmation_id,
        sheet: sheet.to_string(),
        from: range.from,
        to: range.to,
        current_data,
        proposed_values: proposed,
        cell_count,
        reason,
        message,
    })
}

/// First row-count, then per-row column-count comparison.
pub fn check_shape(
    expected_rows: usize,
    expected_cols: usize,
    proposed: &[Vec<Literal>],
) -> Result<(), ShapeMismatch> {
    if proposed.len() != expected_rows {
        return Err(ShapeMismatch::Rows {
            expected_rows,
            got_rows: proposed.len(),
        });
    }
    if let Some((row_index, row)) = proposed
        .iter()
        .enumerate()
        .find(|(_, row)| row.len() != expected_cols)
    {
        return Err(ShapeMismatch::Columns {
            expected_cols,
            got_cols: row.len(),
            row_index,
        });
    }
    Ok(())
}

fn confirmation_id(
    kind: &str,
    target: &CellRange,
    snapshot: &[Vec<CellValue>],
    proposal: &[Vec<Literal>],
) -> String {
    let target = target.to_string();
    let snapshot = serde_json::to_vec(snapshot).unwrap_or_default();
    let proposal = serde_json::to_vec(proposal).unwrap_or_default();
    short_digest_id(
        "cf",
        &[kind.as_bytes(), target.as_bytes(), &snapshot, &proposal],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[f64]) -> Vec<Literal> {
        values.iter().copied().map(Literal::Number).collect()
    }

    #[test]
    fn shape_check_reports_rows_before_columns() {
        let proposal = vec![row(&[1.0, 2.0])];
        assert_eq!(
            check_shape(3, 3, &proposal),
            Err(ShapeMismatch::Rows {
                expected_rows: 3,
                got_rows: 1
            })
        );
    }

    #[test]
    fn shape_check_names_first_offending_row() {
        let proposal = vec![row(&[1.0, 2.0]), row(&[1.0]), row(&[])];
        assert_eq!(
            check_shape(3, 2, &proposal),
            Err(ShapeMismatch::Columns {
                expected_cols: 2,
                got_cols: 1,
                row_index: 1
            })
        );
        assert!(check_shape(2, 2, &[row(&[1.0, 2.0]), row(&[3.0, 4.0])]).is_ok());
    }
}
