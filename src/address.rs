//! A1-style cell addressing.
//!
//! Addresses are 0-based internally and render as `<ColumnLetters><Row>` with a
//! 1-based row and bijective base-26 column letters (`A` = 0, `Z` = 25,
//! `AA` = 26). Parsing is strict: uppercase letters only, no `$` markers, no
//! leading zeros, and both axes within the xlsx grid.

use crate::error::AddressError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::FusedIterator;
use std::str::FromStr;

/// Last addressable row (1-based) in an xlsx worksheet.
pub const MAX_ROWS: u32 = 1_048_576;
/// Number of addressable columns (`A` through `XFD`).
pub const MAX_COLS: u32 = 16_384;

/// A single cell position. Ordering is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CellAddress {
    pub row: u32,
    pub col: u32,
}

impl CellAddress {
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Parse canonical A1 text.
    pub fn decode(text: &str) -> Result<Self, AddressError> {
        let invalid = || AddressError::InvalidFormat(text.to_string());
        let bytes = text.as_bytes();

        let letters = bytes.iter().take_while(|b| b.is_ascii_uppercase()).count();
        // XFD is the widest column; anything longer overflows the grid
        if letters == 0 || letters > 3 {
            return Err(invalid());
        }
        let digits = &bytes[letters..];
        if digits.is_empty() || digits.len() > 7 || digits[0] == b'0' {
            return Err(invalid());
        }
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(invalid());
        }

        let col = column_index(&text[..letters]).ok_or_else(invalid)?;
        let row: u32 = text[letters..].parse().map_err(|_| invalid())?;
        if row > MAX_ROWS {
            return Err(invalid());
        }

        Ok(Self { row: row - 1, col })
    }

    /// Render as canonical A1 text. Always succeeds.
    pub fn encode(&self) -> String {
        format!("{}{}", column_name(self.col), self.row + 1)
    }

    pub fn offset(&self, rows: u32, cols: u32) -> Self {
        Self {
            row: self.row + rows,
            col: self.col + cols,
        }
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_name(self.col), self.row + 1)
    }
}

impl FromStr for CellAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl From<CellAddress> for String {
    fn from(address: CellAddress) -> Self {
        address.encode()
    }
}

impl TryFrom<String> for CellAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

/// Column letters for a 0-based column index.
pub fn column_name(col: u32) -> String {
    let mut remaining = col + 1;
    let mut name = Vec::with_capacity(3);
    while remaining > 0 {
        let rem = ((remaining - 1) % 26) as u8;
        name.push(b'A' + rem);
        remaining = (remaining - 1) / 26;
    }
    name.reverse();
    String::from_utf8(name).unwrap_or_default()
}

/// 0-based column index for uppercase letters, `None` outside `A..=XFD`.
pub fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() || !letters.bytes().all(|b| b.is_ascii_uppercase()) {
        return None;
    }
    let mut value: u32 = 0;
    for b in letters.bytes() {
        value = value.checked_mul(26)?.checked_add(u32::from(b - b'A') + 1)?;
    }
    if value > MAX_COLS {
        return None;
    }
    Some(value - 1)
}

/// Row-major iteration over the rectangle `from..=to`.
///
/// Fails with [`AddressError::InvertedRange`] when `from` is below or to the
/// right of `to`.
pub fn range(from: CellAddress, to: CellAddress) -> Result<RangeIter, AddressError> {
    check_bounds(from, to)?;
    Ok(RangeIter::new(from, to))
}

fn check_bounds(from: CellAddress, to: CellAddress) -> Result<(), AddressError> {
    if from.row > to.row || from.col > to.col {
        return Err(AddressError::InvertedRange {
            from: from.encode(),
            to: to.encode(),
        });
    }
    Ok(())
}

/// Lazy, restartable walk over a rectangle. Does not touch cell values.
#[derive(Debug, Clone)]
pub struct RangeIter {
    origin: CellAddress,
    width: u64,
    next: u64,
    len: u64,
}

impl RangeIter {
    fn new(from: CellAddress, to: CellAddress) -> Self {
        let width = u64::from(to.col - from.col) + 1;
        let height = u64::from(to.row - from.row) + 1;
        Self {
            origin: from,
            width,
            next: 0,
            len: width * height,
        }
    }
}

impl Iterator for RangeIter {
    type Item = CellAddress;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.len {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.origin.offset(
            (index / self.width) as u32,
            (index % self.width) as u32,
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.len - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RangeIter {}
impl FusedIterator for RangeIter {}

/// A rectangle on a named sheet. Bounds are always ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CellRange {
    pub sheet: String,
    pub from: CellAddress,
    pub to: CellAddress,
}

impl CellRange {
    pub fn new(
        sheet: impl Into<String>,
        from: CellAddress,
        to: CellAddress,
    ) -> Result<Self, AddressError> {
        check_bounds(from, to)?;
        Ok(Self {
            sheet: sheet.into(),
            from,
            to,
        })
    }

    pub fn single(sheet: impl Into<String>, cell: CellAddress) -> Self {
        Self {
            sheet: sheet.into(),
            from: cell,
            to: cell,
        }
    }

    /// Decode a pair of A1 strings.
    pub fn from_a1(sheet: impl Into<String>, from: &str, to: &str) -> Result<Self, AddressError> {
        Self::new(sheet, CellAddress::decode(from)?, CellAddress::decode(to)?)
    }

    /// Parse `"A1:C3"` or a single `"B2"`.
    pub fn parse(sheet: impl Into<String>, text: &str) -> Result<Self, AddressError> {
        match text.split_once(':') {
            Some((from, to)) => Self::from_a1(sheet, from, to),
            None => Ok(Self::single(sheet, CellAddress::decode(text)?)),
        }
    }

    pub fn rows(&self) -> usize {
        (self.to.row - self.from.row) as usize + 1
    }

    pub fn cols(&self) -> usize {
        (self.to.col - self.from.col) as usize + 1
    }

    pub fn cell_count(&self) -> usize {
        self.rows() * self.cols()
    }

    pub fn is_single_cell(&self) -> bool {
        self.from == self.to
    }

    pub fn contains(&self, cell: CellAddress) -> bool {
        (self.from.row..=self.to.row).contains(&cell.row)
            && (self.from.col..=self.to.col).contains(&cell.col)
    }

    pub fn iter(&self) -> RangeIter {
        RangeIter::new(self.from, self.to)
    }

    /// `A1:C3`, or just `B2` for a single cell.
    pub fn a1(&self) -> String {
        if self.is_single_cell() {
            self.from.encode()
        } else {
            format!("{}:{}", self.from, self.to)
        }
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.sheet, self.a1())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_column_letters() {
        assert_eq!(CellAddress::decode("A1").unwrap(), CellAddress::new(0, 0));
        assert_eq!(CellAddress::decode("Z1").unwrap(), CellAddress::new(0, 25));
        assert_eq!(CellAddress::decode("AA1").unwrap(), CellAddress::new(0, 26));
        assert_eq!(CellAddress::decode("B2").unwrap(), CellAddress::new(1, 1));
        assert_eq!(
            CellAddress::decode("XFD1048576").unwrap(),
            CellAddress::new(MAX_ROWS - 1, MAX_COLS - 1)
        );
    }

    #[test]
    fn rejects_malformed_text() {
        for text in [
            "", "1A", "A", "a1", "A0", "A01", "$A$1", "A1:B2", "XFE1", "A1048577", "AAAA1", "B 2",
        ] {
            assert!(
                matches!(CellAddress::decode(text), Err(AddressError::InvalidFormat(_))),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn single_cell_range_yields_one_address() {
        let a1 = CellAddress::new(0, 0);
        let cells: Vec<_> = range(a1, a1).unwrap().collect();
        assert_eq!(cells, vec![a1]);
    }

    #[test]
    fn range_iterates_row_major_and_restarts() {
        let iter = range(
            CellAddress::decode("B2").unwrap(),
            CellAddress::decode("C3").unwrap(),
        )
        .unwrap();
        assert_eq!(iter.len(), 4);
        let first: Vec<String> = iter.clone().map(|c| c.encode()).collect();
        assert_eq!(first, ["B2", "C2", "B3", "C3"]);
        let second: Vec<String> = iter.map(|c| c.encode()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let err = CellRange::from_a1("Sheet1", "C3", "A1").unwrap_err();
        assert_eq!(
            err,
            AddressError::InvertedRange {
                from: "C3".to_string(),
                to: "A1".to_string()
            }
        );
        assert!(range(CellAddress::new(0, 2), CellAddress::new(2, 0)).is_err());
    }

    #[test]
    fn parses_range_text() {
        let range = CellRange::parse("Sheet1", "A1:C3").unwrap();
        assert_eq!((range.rows(), range.cols(), range.cell_count()), (3, 3, 9));
        assert!(range.contains(CellAddress::new(2, 2)));
        assert!(!range.contains(CellAddress::new(3, 0)));
        assert_eq!(range.to_string(), "Sheet1!A1:C3");

        let single = CellRange::parse("Sheet1", "B2").unwrap();
        assert!(single.is_single_cell());
        assert_eq!(single.a1(), "B2");
    }

    #[test]
    fn serializes_as_a1_text() {
        let json = serde_json::to_value(CellAddress::new(1, 27)).unwrap();
        assert_eq!(json, serde_json::json!("AB2"));
        let back: CellAddress = serde_json::from_value(json).unwrap();
        assert_eq!(back, CellAddress::new(1, 27));
    }
}
