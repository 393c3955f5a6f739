//! Row and column identifiers
//!
//! Rows and column components are opaque byte strings ordered
//! lexicographically. A [`Column`] orders by `(family, qualifier)` and a
//! [`RowColumn`] orders by row first, then column.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Bound;

/// Opaque, lexicographically ordered byte string
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bytes(Vec<u8>);

impl Bytes {
    /// Empty byte string
    pub const EMPTY: Bytes = Bytes(Vec::new());

    /// Wrap an owned buffer
    pub fn new(data: Vec<u8>) -> Self {
        Bytes(data)
    }

    /// Borrow the raw bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the byte string has no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume into the underlying buffer
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Interpret the bytes as UTF-8, if valid
    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// True if `self` begins with `prefix`
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Bytes(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(v: &[u8]) -> Self {
        Bytes(v.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Bytes {
    fn from(v: &[u8; N]) -> Self {
        Bytes(v.to_vec())
    }
}

impl From<&str> for Bytes {
    fn from(s: &str) -> Self {
        Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Bytes {
    fn from(s: String) -> Self {
        Bytes(s.into_bytes())
    }
}

impl From<&Bytes> for Bytes {
    fn from(b: &Bytes) -> Self {
        b.clone()
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for Bytes {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq<&str> for Bytes {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

// Printable ASCII is shown as-is; everything else as \xNN.
impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if (0x20..0x7f).contains(&b) && b != b'\\' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

/// A column: `(family, qualifier)`
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Column {
    /// Column family
    pub family: Bytes,
    /// Column qualifier
    pub qualifier: Bytes,
}

impl Column {
    /// Create a column from anything convertible to bytes
    pub fn new(family: impl Into<Bytes>, qualifier: impl Into<Bytes>) -> Self {
        Column {
            family: family.into(),
            qualifier: qualifier.into(),
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.qualifier)
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Column({})", self)
    }
}

/// A `(row, column)` coordinate
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowColumn {
    /// Row key
    pub row: Bytes,
    /// Column within the row
    pub column: Column,
}

impl RowColumn {
    /// Create a coordinate
    pub fn new(row: impl Into<Bytes>, column: Column) -> Self {
        RowColumn {
            row: row.into(),
            column,
        }
    }
}

impl fmt::Display for RowColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.row, self.column)
    }
}

impl fmt::Debug for RowColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowColumn({})", self)
    }
}

/// A range of rows
///
/// `Span::default()` covers every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// Lower bound on the row
    pub start: Bound<Bytes>,
    /// Upper bound on the row
    pub end: Bound<Bytes>,
}

impl Default for Span {
    fn default() -> Self {
        Span::all()
    }
}

impl Span {
    /// Every row
    pub fn all() -> Self {
        Span {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Exactly one row
    pub fn exact(row: impl Into<Bytes>) -> Self {
        let row = row.into();
        Span {
            start: Bound::Included(row.clone()),
            end: Bound::Included(row),
        }
    }

    /// All rows starting with `prefix`
    pub fn prefix(prefix: impl Into<Bytes>) -> Self {
        let prefix = prefix.into();
        let end = match prefix_successor(prefix.as_slice()) {
            Some(next) => Bound::Excluded(Bytes::new(next)),
            None => Bound::Unbounded,
        };
        Span {
            start: Bound::Included(prefix),
            end,
        }
    }

    /// Rows in `[start, end)`
    pub fn range(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Span {
            start: Bound::Included(start.into()),
            end: Bound::Excluded(end.into()),
        }
    }

    /// True if `row` falls inside this span
    pub fn contains(&self, row: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => row >= s.as_slice(),
            Bound::Excluded(s) => row > s.as_slice(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => row <= e.as_slice(),
            Bound::Excluded(e) => row < e.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    /// True if no row beyond `row` can be inside this span
    pub fn is_past_end(&self, row: &[u8]) -> bool {
        match &self.end {
            Bound::Included(e) => row > e.as_slice(),
            Bound::Excluded(e) => row >= e.as_slice(),
            Bound::Unbounded => false,
        }
    }
}

/// Smallest byte string greater than every string starting with `prefix`
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < 0xff {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}
