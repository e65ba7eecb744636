use crate::address::{CellAddress, CellRange};
use crate::error::StoreError;
use crate::model::{CellData, CellValue, Literal, RangeData};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use umya_spreadsheet::reader::xlsx;
use umya_spreadsheet::{Cell, Spreadsheet, Worksheet};

const SEED_SHEET: &str = "Sheet1";
const SEED_HEADERS: [&str; 3] = ["Email", "Amount", "Status"];
const SEED_ROWS: &[(&str, f64, &str)] = &[
    ("user1@example.com", 100.0, "Active"),
    ("user2@example.com", 200.0, "Active"),
    ("user3@example.com", 150.0, "Inactive"),
];

/// Largest range a single read or write may span unless configured otherwise.
pub const DEFAULT_MAX_RANGE_CELLS: usize = 100_000;

/// The workbook backing the assistant: one xlsx file held in memory.
///
/// Every mutation runs {read previous, mutate, persist} under a single lock,
/// so concurrent writers cannot lose each other's updates and the previous
/// values a caller sees are exactly the ones it overwrote.
pub struct WorkbookStore {
    path: PathBuf,
    max_range_cells: usize,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    book: Spreadsheet,
    version: u64,
    dirty: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellWrite {
    pub previous: CellValue,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeWrite {
    /// Values the write replaced: the whole range for a guarded write, the
    /// written footprint otherwise.
    pub previous: Vec<Vec<CellValue>>,
    pub cells_written: usize,
    pub version: u64,
}

impl WorkbookStore {
    /// Load `path`, seeding a demo workbook when the file does not exist yet.
    ///
    /// A file that exists but cannot be parsed is an error and is left alone.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if path.exists() {
            let started = Instant::now();
            let book = xlsx::read(&path).map_err(|e| StoreError::Load {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            tracing::info!(
                path = %path.display(),
                sheets = book.get_sheet_collection().len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "workbook loaded"
            );
            return Ok(Self::from_spreadsheet(path, book));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::Persistence {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }
        let book = seed_workbook();
        write_atomically(&path, &book)?;
        tracing::info!(path = %path.display(), "seeded new workbook");
        Ok(Self::from_spreadsheet(path, book))
    }

    pub fn from_spreadsheet(path: impl Into<PathBuf>, book: Spreadsheet) -> Self {
        Self {
            path: path.into(),
            max_range_cells: DEFAULT_MAX_RANGE_CELLS,
            inner: Mutex::new(StoreInner {
                book,
                version: 0,
                dirty: false,
            }),
        }
    }

    pub fn with_max_range_cells(mut self, limit: usize) -> Self {
        self.max_range_cells = limit.max(1);
        self
    }

    pub fn max_range_cells(&self) -> usize {
        self.max_range_cells
    }

    /// Reject ranges over the cell limit before anything is allocated for them.
    pub fn check_range_size(&self, range: &CellRange) -> Result<(), StoreError> {
        let cells = range.cell_count();
        if cells > self.max_range_cells {
            return Err(StoreError::RangeTooLarge {
                range: range.to_string(),
                cells,
                limit: self.max_range_cells,
            });
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Monotonic counter bumped by every mutation.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// True when memory holds changes the file does not.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    pub fn sheet_names(&self) -> Vec<String> {
        sheet_names(&self.inner.lock().book)
    }

    /// Point read. Missing sheets and missing cells both read as empty.
    pub fn read_cell(&self, sheet: &str, cell: CellAddress) -> CellValue {
        let inner = self.inner.lock();
        inner
            .book
            .get_sheet_by_name(sheet)
            .map(|ws| value_at(ws, cell))
            .unwrap_or_default()
    }

    pub fn read_range(&self, range: &CellRange) -> Result<RangeData, StoreError> {
        self.check_range_size(range)?;
        let inner = self.inner.lock();
        read_range_locked(&inner.book, range)
    }

    /// Formula text without the leading `=`, if the cell holds one.
    pub fn get_formula(&self, sheet: &str, cell: CellAddress) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .book
            .get_sheet_by_name(sheet)
            .and_then(|ws| formula_at(ws, cell))
    }

    /// Write a literal, clearing any formula, and persist.
    pub fn write_cell(
        &self,
        sheet: &str,
        cell: CellAddress,
        value: &Literal,
    ) -> Result<CellWrite, StoreError> {
        self.write_cell_inner(sheet, cell, value, None)
    }

    /// Like [`write_cell`](Self::write_cell), but only if the cell still holds
    /// `expected`; otherwise nothing is written and `Conflict` is returned.
    pub fn write_cell_if(
        &self,
        sheet: &str,
        cell: CellAddress,
        value: &Literal,
        expected: &CellValue,
    ) -> Result<CellWrite, StoreError> {
        self.write_cell_inner(sheet, cell, value, Some(expected))
    }

    fn write_cell_inner(
        &self,
        sheet: &str,
        cell: CellAddress,
        value: &Literal,
        expected: Option<&CellValue>,
    ) -> Result<CellWrite, StoreError> {
        let mut inner = self.inner.lock();
        let previous = inner
            .book
            .get_sheet_by_name(sheet)
            .map(|ws| value_at(ws, cell))
            .unwrap_or_default();
        if let Some(expected) = expected
            && *expected != previous
        {
            return Err(StoreError::Conflict {
                sheet: sheet.to_string(),
                address: cell.encode(),
            });
        }

        let worksheet = sheet_for_write(&mut inner.book, sheet)?;
        set_literal(worksheet, cell, value);
        inner.version += 1;
        inner.dirty = true;
        let version = inner.version;
        self.persist_locked(&mut inner)?;

        tracing::debug!(sheet, cell = %cell, version, "cell written");
        Ok(CellWrite { previous, version })
    }

    /// Write `values` row-major from `range.from`. Values beyond `range.to`
    /// are skipped; the footprint is the overlap of both shapes.
    pub fn write_range(
        &self,
        range: &CellRange,
        values: &[Vec<Literal>],
    ) -> Result<RangeWrite, StoreError> {
        self.write_range_inner(range, values, None)
    }

    /// Like [`write_range`](Self::write_range), but only if the range still
    /// holds `expected` (same shape as the range).
    pub fn write_range_if(
        &self,
        range: &CellRange,
        values: &[Vec<Literal>],
        expected: &[Vec<CellValue>],
    ) -> Result<RangeWrite, StoreError> {
        self.write_range_inner(range, values, Some(expected))
    }

    fn write_range_inner(
        &self,
        range: &CellRange,
        values: &[Vec<Literal>],
        expected: Option<&[Vec<CellValue>]>,
    ) -> Result<RangeWrite, StoreError> {
        self.check_range_size(range)?;
        let mut inner = self.inner.lock();
        let previous = match expected {
            Some(expected) => {
                let previous = snapshot_locked(&inner.book, range);
                if let Some(changed) = first_difference(range, &previous, expected) {
                    return Err(StoreError::Conflict {
                        sheet: range.sheet.clone(),
                        address: changed.encode(),
                    });
                }
                previous
            }
            None => match footprint(range, values) {
                Some(written) => snapshot_locked(&inner.book, &written),
                None => Vec::new(),
            },
        };

        let worksheet = sheet_for_write(&mut inner.book, &range.sheet)?;
        let mut cells_written = 0;
        for (r, row) in values.iter().take(range.rows()).enumerate() {
            for (c, value) in row.iter().take(range.cols()).enumerate() {
                set_literal(worksheet, range.from.offset(r as u32, c as u32), value);
                cells_written += 1;
            }
        }
        inner.version += 1;
        inner.dirty = true;
        let version = inner.version;
        self.persist_locked(&mut inner)?;

        tracing::debug!(
            sheet = %range.sheet,
            range = %range.a1(),
            cells_written,
            version,
            "range written"
        );
        Ok(RangeWrite {
            previous,
            cells_written,
            version,
        })
    }

    /// Rewrite the file from memory. Clears the dirty flag on success.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        self.persist_locked(&mut inner)
    }

    fn persist_locked(&self, inner: &mut StoreInner) -> Result<(), StoreError> {
        match write_atomically(&self.path, &inner.book) {
            Ok(()) => {
                inner.dirty = false;
                Ok(())
            }
            Err(error) => {
                tracing::error!(
                    path = %self.path.display(),
                    %error,
                    "workbook persist failed; memory and disk now disagree"
                );
                Err(error)
            }
        }
    }
}

fn seed_workbook() -> Spreadsheet {
    let mut book = umya_spreadsheet::new_file();
    if let Some(sheet) = book.get_sheet_by_name_mut(SEED_SHEET) {
        for (col, header) in SEED_HEADERS.iter().enumerate() {
            sheet
                .get_cell_mut((col as u32 + 1, 1))
                .set_value_string(*header);
        }
        for (row, &(email, amount, status)) in SEED_ROWS.iter().enumerate() {
            let row = row as u32 + 2;
            sheet.get_cell_mut((1, row)).set_value_string(email);
            sheet.get_cell_mut((2, row)).set_value_number(amount);
            sheet.get_cell_mut((3, row)).set_value_string(status);
        }
    }
    book
}

fn write_atomically(path: &Path, book: &Spreadsheet) -> Result<(), StoreError> {
    let persistence = |reason: String| StoreError::Persistence {
        path: path.to_path_buf(),
        reason,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".sheet-chat-")
        .suffix(".xlsx")
        .tempfile_in(dir)
        .map_err(|e| persistence(e.to_string()))?;
    umya_spreadsheet::writer::xlsx::write(book, tmp.path())
        .map_err(|e| persistence(e.to_string()))?;
    tmp.persist(path).map_err(|e| persistence(e.error.to_string()))?;
    Ok(())
}

fn sheet_names(book: &Spreadsheet) -> Vec<String> {
    book.get_sheet_collection()
        .iter()
        .map(|sheet| sheet.get_name().to_string())
        .collect()
}

fn sheet_for_write<'a>(
    book: &'a mut Spreadsheet,
    name: &str,
) -> Result<&'a mut Worksheet, StoreError> {
    if book.get_sheet_by_name(name).is_none() {
        validate_sheet_name(name)?;
        book.new_sheet(name)
            .map_err(|reason| StoreError::InvalidSheetName {
                name: name.to_string(),
                reason,
            })?;
        tracing::info!(sheet = name, "created sheet on first write");
    }
    book.get_sheet_by_name_mut(name)
        .ok_or_else(|| StoreError::SheetNotFound {
            sheet: name.to_string(),
            available: Vec::new(),
        })
}

/// xlsx sheet naming rules: 1 to 31 characters, none of `[]:*?/\`.
pub fn validate_sheet_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidSheetName {
        name: name.to_string(),
        reason,
    };
    let length = name.chars().count();
    if length == 0 {
        return Err(invalid("sheet name must not be empty"));
    }
    if length > 31 {
        return Err(invalid("sheet name must be at most 31 characters"));
    }
    if name.chars().any(|c| "[]:*?/\\".contains(c)) {
        return Err(invalid("sheet name must not contain any of []:*?/\\"));
    }
    if name.starts_with('\'') || name.ends_with('\'') {
        return Err(invalid("sheet name must not start or end with an apostrophe"));
    }
    Ok(())
}

fn read_range_locked(book: &Spreadsheet, range: &CellRange) -> Result<RangeData, StoreError> {
    let worksheet =
        book.get_sheet_by_name(&range.sheet)
            .ok_or_else(|| StoreError::SheetNotFound {
                sheet: range.sheet.clone(),
                available: sheet_names(book),
            })?;

    let mut data = Vec::with_capacity(range.rows());
    let mut row = Vec::with_capacity(range.cols());
    for cell in range.iter() {
        row.push(CellData {
            cell,
            value: value_at(worksheet, cell),
            formula: formula_at(worksheet, cell),
        });
        if row.len() == range.cols() {
            data.push(std::mem::replace(&mut row, Vec::with_capacity(range.cols())));
        }
    }

    Ok(RangeData {
        range: range.clone(),
        data,
    })
}

/// The part of `range` that `values` actually covers, or `None` when nothing
/// is written.
fn footprint(range: &CellRange, values: &[Vec<Literal>]) -> Option<CellRange> {
    let rows = values.len().min(range.rows());
    let cols = values
        .iter()
        .take(rows)
        .map(Vec::len)
        .max()
        .unwrap_or(0)
        .min(range.cols());
    if rows == 0 || cols == 0 {
        return None;
    }
    Some(CellRange {
        sheet: range.sheet.clone(),
        from: range.from,
        to: range.from.offset(rows as u32 - 1, cols as u32 - 1),
    })
}

/// Values of the whole range; a missing sheet reads as all empty.
fn snapshot_locked(book: &Spreadsheet, range: &CellRange) -> Vec<Vec<CellValue>> {
    let worksheet = book.get_sheet_by_name(&range.sheet);
    (0..range.rows() as u32)
        .map(|r| {
            (0..range.cols() as u32)
                .map(|c| {
                    worksheet
                        .map(|ws| value_at(ws, range.from.offset(r, c)))
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect()
}

fn first_difference(
    range: &CellRange,
    current: &[Vec<CellValue>],
    expected: &[Vec<CellValue>],
) -> Option<CellAddress> {
    if current.len() != expected.len() {
        return Some(range.from);
    }
    for (r, (now, then)) in current.iter().zip(expected).enumerate() {
        if now.len() != then.len() {
            return Some(range.from.offset(r as u32, 0));
        }
        if let Some(c) = now.iter().zip(then).position(|(a, b)| a != b) {
            return Some(range.from.offset(r as u32, c as u32));
        }
    }
    None
}

fn cell_at(worksheet: &Worksheet, cell: CellAddress) -> Option<&Cell> {
    worksheet.get_cell((cell.col + 1, cell.row + 1))
}

fn value_at(worksheet: &Worksheet, cell: CellAddress) -> CellValue {
    cell_at(worksheet, cell).map(cell_value).unwrap_or_default()
}

fn formula_at(worksheet: &Worksheet, cell: CellAddress) -> Option<String> {
    let cell = cell_at(worksheet, cell)?;
    if !cell.is_formula() {
        return None;
    }
    let formula = cell.get_formula();
    let formula = formula.strip_prefix('=').unwrap_or(formula);
    (!formula.is_empty()).then(|| formula.to_string())
}

pub fn cell_value(cell: &Cell) -> CellValue {
    let raw = cell.get_value();
    if raw.is_empty() {
        return CellValue::Empty;
    }
    if cell.get_data_type() == "n"
        && let Ok(number) = raw.parse::<f64>()
    {
        return CellValue::Number(number);
    }
    CellValue::Text(raw.into_owned())
}

fn set_literal(worksheet: &mut Worksheet, cell: CellAddress, value: &Literal) {
    let target = worksheet.get_cell_mut((cell.col + 1, cell.row + 1));
    target.get_cell_value_mut().remove_formula();
    match value {
        Literal::Number(n) => {
            target.set_value_number(*n);
        }
        Literal::Text(s) => {
            target.set_value_string(s.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_names_follow_xlsx_rules() {
        assert!(validate_sheet_name("Q3 Budget").is_ok());
        assert!(validate_sheet_name("").is_err());
        assert!(validate_sheet_name("a/b").is_err());
        assert!(validate_sheet_name(&"x".repeat(32)).is_err());
        assert!(validate_sheet_name(&"x".repeat(31)).is_ok());
    }

    #[test]
    fn first_difference_reports_changed_cell() {
        let range = CellRange::parse("Sheet1", "B2:C3").unwrap();
        let before = vec![
            vec![CellValue::Number(1.0), CellValue::Number(2.0)],
            vec![CellValue::Number(3.0), CellValue::Empty],
        ];
        let mut after = before.clone();
        assert_eq!(first_difference(&range, &before, &after), None);
        after[1][1] = CellValue::Text("x".into());
        assert_eq!(
            first_difference(&range, &after, &before).map(|c| c.encode()),
            Some("C3".to_string())
        );
    }
}
