use std::collections::BTreeMap;

use crate::error::DbError;
use crate::types::{FromValue, Value};

/// Name and declared type of a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: Option<String>,
}

/// An owned copy of one column of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub decl_type: Option<String>,
    pub value: Value,
}

/// Addresses a column by position or by name.
pub trait RowIndex {
    /// Resolve to a zero based position in `columns`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ExtractionError` when no such column exists.
    fn index(&self, columns: &[ColumnInfo]) -> Result<usize, DbError>;
}

impl RowIndex for usize {
    fn index(&self, columns: &[ColumnInfo]) -> Result<usize, DbError> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(DbError::extraction(format!(
                "column index {self} out of range for {} column(s)",
                columns.len()
            )))
        }
    }
}

impl RowIndex for &str {
    fn index(&self, columns: &[ColumnInfo]) -> Result<usize, DbError> {
        columns
            .iter()
            .position(|c| c.name == *self)
            .or_else(|| {
                columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(self))
            })
            .ok_or_else(|| DbError::extraction(format!("no column named '{self}'")))
    }
}

/// A view of the row the statement cursor currently points at.
///
/// A `Row` borrows the cursor, so it cannot outlive the step that produced it; copy values
/// out with [`Row::value`], [`Row::values`] or [`Row::to_map`] to keep them.
pub struct Row<'a> {
    row: &'a rusqlite::Row<'a>,
    columns: &'a [ColumnInfo],
}

impl<'a> Row<'a> {
    pub(crate) fn new(row: &'a rusqlite::Row<'a>, columns: &'a [ColumnInfo]) -> Self {
        Self { row, columns }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn column_info(&self) -> &'a [ColumnInfo] {
        self.columns
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&'a str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Position of the column called `name`, if any.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        RowIndex::index(&name, self.columns).ok()
    }

    /// The column's value, JSON-decoded when its declared type names JSON.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ExtractionError` for an unknown column.
    pub fn value(&self, idx: impl RowIndex) -> Result<Value, DbError> {
        let idx = idx.index(self.columns)?;
        let raw = self
            .row
            .get_ref(idx)
            .map_err(|e| DbError::extraction(format!("column {idx}: {e}")))?;
        Value::from_column(raw, self.columns[idx].decl_type.as_deref())
    }

    /// Extract the column as `T`. `Option<T>` turns SQL `NULL` into `None`; any other target
    /// rejects `NULL`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ExtractionError` for an unknown column, `NULL` into a non-optional
    /// target, or a type mismatch.
    pub fn get<T: FromValue>(&self, idx: impl RowIndex) -> Result<T, DbError> {
        let idx = idx.index(self.columns)?;
        T::from_value(self.value(idx)?).map_err(|err| match err {
            DbError::ExtractionError(msg) => {
                DbError::extraction(format!("column '{}': {msg}", self.columns[idx].name))
            }
            other => other,
        })
    }

    /// [`Row::get`] by column name.
    ///
    /// # Errors
    ///
    /// Same as [`Row::get`].
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T, DbError> {
        self.get(name)
    }

    /// Every value in column order.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ExtractionError` if a JSON column holds malformed text.
    pub fn values(&self) -> Result<Vec<Value>, DbError> {
        (0..self.columns.len()).map(|i| self.value(i)).collect()
    }

    /// Owned copies of every column.
    ///
    /// # Errors
    ///
    /// Same as [`Row::values`].
    pub fn columns(&self) -> Result<Vec<Column>, DbError> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, info)| {
                Ok(Column {
                    name: info.name.clone(),
                    decl_type: info.decl_type.clone(),
                    value: self.value(i)?,
                })
            })
            .collect()
    }

    /// Column name to value. Later duplicates of a name win.
    ///
    /// # Errors
    ///
    /// Same as [`Row::values`].
    pub fn to_map(&self) -> Result<BTreeMap<String, Value>, DbError> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, info)| Ok((info.name.clone(), self.value(i)?)))
            .collect()
    }
}

/// Build a value from a whole row.
pub trait FromRow: Sized {
    /// # Errors
    ///
    /// Returns `DbError::ExtractionError` when the row does not have the expected shape.
    fn from_row(row: &Row<'_>) -> Result<Self, DbError>;
}

impl FromRow for Vec<Value> {
    fn from_row(row: &Row<'_>) -> Result<Self, DbError> {
        row.values()
    }
}

impl FromRow for BTreeMap<String, Value> {
    fn from_row(row: &Row<'_>) -> Result<Self, DbError> {
        row.to_map()
    }
}

impl FromRow for Vec<Column> {
    fn from_row(row: &Row<'_>) -> Result<Self, DbError> {
        row.columns()
    }
}

macro_rules! tuple_from_row {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn from_row(row: &Row<'_>) -> Result<Self, DbError> {
                Ok(($(row.get::<$name>($idx)?,)+))
            }
        }
    };
}

tuple_from_row!(A: 0);
tuple_from_row!(A: 0, B: 1);
tuple_from_row!(A: 0, B: 1, C: 2);
tuple_from_row!(A: 0, B: 1, C: 2, D: 3);
tuple_from_row!(A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_from_row!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
