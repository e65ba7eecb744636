mod support;

use assert_matches::assert_matches;
use sheet_chat::address::{CellAddress, CellRange};
use sheet_chat::confirm::{Confirmation, prepare_cell_update, prepare_range_update};
use sheet_chat::error::{ConfirmError, ErrorCode, ShapeMismatch, StoreError};
use sheet_chat::execute::{Execution, execute_cell_update, execute_confirmation, execute_range_update};
use sheet_chat::model::{CellValue, Literal};
use support::TestWorkspace;

fn view() -> CellRange {
    CellRange::from_a1("Sheet1", "A1", "C3").unwrap()
}

fn b2() -> CellAddress {
    CellAddress::decode("B2").unwrap()
}

fn row(values: &[&str]) -> Vec<Literal> {
    values.iter().map(|v| Literal::from(*v)).collect()
}

#[test]
fn two_row_proposal_for_three_row_range_is_a_shape_mismatch() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();

    let error = prepare_range_update(
        &store,
        "Sheet1",
        "A1",
        "C3",
        vec![row(&["a", "b", "c"]), row(&["d", "e", "f"])],
        None,
    )
    .unwrap_err();
    assert_matches!(
        error,
        ConfirmError::Shape(ShapeMismatch::Rows {
            expected_rows: 3,
            got_rows: 2
        })
    );
    assert_eq!(store.version(), 0);
}

#[test]
fn short_row_names_the_offending_row() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();

    let error = prepare_range_update(
        &store,
        "Sheet1",
        "A1",
        "C2",
        vec![row(&["a", "b", "c"]), row(&["d", "e"])],
        None,
    )
    .unwrap_err();
    assert_matches!(
        error,
        ConfirmError::Shape(ShapeMismatch::Columns {
            expected_cols: 3,
            got_cols: 2,
            row_index: 1
        })
    );
}

#[test]
fn range_preview_counts_cells_and_captures_current_data() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();

    let preview = prepare_range_update(
        &store,
        "Sheet1",
        "A1",
        "C3",
        vec![row(&["a", "b", "c"]); 3],
        Some("normalize".into()),
    )
    .expect("preview");
    assert_eq!(preview.cell_count, 9);
    assert_eq!(preview.message, "Update range A1:C3 (3x3 = 9 cells)?");
    assert_eq!(preview.current_data[1][1], CellValue::Number(100.0));
    assert_eq!(preview.reason.as_deref(), Some("normalize"));
    // preview only
    assert_eq!(store.version(), 0);
    assert_eq!(store.read_cell("Sheet1", b2()), CellValue::Number(100.0));
}

#[test]
fn range_preview_on_missing_sheet_lists_available_sheets() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();

    let error = prepare_range_update(&store, "Ghost", "A1", "A1", vec![row(&["x"])], None)
        .unwrap_err();
    assert_matches!(
        error,
        ConfirmError::Store(StoreError::SheetNotFound { ref available, .. })
            if available == &vec!["Sheet1".to_string()]
    );
    assert_eq!(error.code(), ErrorCode::SheetNotFound);
}

#[test]
fn confirm_then_execute_single_cell() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();

    let preview = prepare_cell_update(&store, "Sheet1", "B2", Literal::Number(999.0), None)
        .expect("preview");
    assert_eq!(preview.current_value, CellValue::Number(100.0));
    assert_eq!(preview.message, "Update Sheet1!B2 from 100 to 999?");
    assert_eq!(store.read_cell("Sheet1", b2()), CellValue::Number(100.0));

    let confirmation = Confirmation::Cell(preview);
    let execution = execute_confirmation(&store, &view(), &confirmation);
    let Execution::Cell(cell) = execution else {
        panic!("expected a cell execution");
    };
    assert!(cell.success);
    assert_eq!(cell.old_value, Some(CellValue::Number(100.0)));
    assert_eq!(cell.message, "Cell B2 successfully updated from \"100\" to \"999\"");
    let context = cell.full_table_context.expect("view re-read");
    assert_eq!(context.data[1][1].value, CellValue::Number(999.0));
    assert_eq!(store.read_cell("Sheet1", b2()), CellValue::Number(999.0));
}

#[test]
fn second_execute_of_same_value_is_idempotent() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();

    let first = execute_cell_update(&store, &view(), "Sheet1", "B2", Literal::Number(999.0));
    let second = execute_cell_update(&store, &view(), "Sheet1", "B2", Literal::Number(999.0));
    assert!(first.success && second.success);
    assert_eq!(second.old_value, Some(CellValue::Number(999.0)));
    assert_eq!(store.read_cell("Sheet1", b2()), CellValue::Number(999.0));
}

#[test]
fn preview_against_changed_cell_is_stale() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();

    let preview = prepare_cell_update(&store, "Sheet1", "B2", Literal::Number(999.0), None)
        .expect("preview");
    execute_cell_update(&store, &view(), "Sheet1", "B2", Literal::Number(5.0));

    let execution = execute_confirmation(&store, &view(), &Confirmation::Cell(preview));
    assert!(!execution.success());
    assert_eq!(execution.error_code(), Some(ErrorCode::StaleConfirmation));
    assert_eq!(store.read_cell("Sheet1", b2()), CellValue::Number(5.0));
}

#[test]
fn malformed_cell_fails_without_writing() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();

    assert!(prepare_cell_update(&store, "Sheet1", "b2", Literal::Number(1.0), None).is_err());

    let execution = execute_cell_update(&store, &view(), "Sheet1", "2B", Literal::Number(1.0));
    assert!(!execution.success);
    assert_eq!(execution.error_code, Some(ErrorCode::InvalidAddress));
    assert!(execution.message.starts_with("Failed to update cell:"));
    assert_eq!(store.version(), 0);
}

#[test]
fn raw_range_execute_reports_clipping() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();

    let execution = execute_range_update(
        &store,
        &view(),
        "Sheet1",
        "A2",
        "B2",
        vec![row(&["x", "y", "z"])],
    );
    assert!(execution.success);
    assert_eq!(execution.cells_updated, Some(3));
    assert_eq!(execution.cells_written, Some(2));
    assert_eq!(execution.warnings.len(), 1);
    assert_eq!(execution.message, "Range A2:B2 successfully updated (3 cells)");
}

#[test]
fn execution_outside_missing_view_sheet_warns_but_succeeds() {
    let workspace = TestWorkspace::new();
    let store = workspace.store();
    let missing_view = CellRange::from_a1("Dashboard", "A1", "B2").unwrap();

    let execution = execute_cell_update(&store, &missing_view, "Sheet1", "A1", Literal::from("Id"));
    assert!(execution.success);
    assert!(execution.full_table_context.is_none());
    assert_eq!(execution.warnings.len(), 1);
}
