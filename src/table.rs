use std::sync::Arc;

use crate::{Error, Result, codec::Value, columns::Columns, row::Row};

/// A fully materialized result set.
///
/// Row and column counts are fixed at construction and every index is
/// bounds-checked.
#[derive(Debug, Clone)]
pub struct Table {
    columns: Arc<Columns>,
    rows: Vec<Row>,
}

impl Table {
    pub(crate) fn new(columns: Arc<Columns>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_name(&self, col: usize) -> Result<&str> {
        self.columns.name(col)
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns.column_by_name(name)
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn row(&self, row: usize) -> Result<&Row> {
        self.rows.get(row).ok_or(Error::Index {
            index: row,
            len: self.rows.len(),
        })
    }

    pub fn rows(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    /// Raw bytes of one cell, `None` for SQL NULL.
    pub fn cell(&self, row: usize, col: usize) -> Result<Option<&[u8]>> {
        self.row(row)?.cell(col)
    }

    pub fn is_null(&self, row: usize, col: usize) -> Result<bool> {
        self.row(row)?.is_null(col)
    }

    pub fn get_bool(&self, row: usize, col: usize) -> Result<bool> {
        self.row(row)?.get_bool(col)
    }

    pub fn get_int(&self, row: usize, col: usize) -> Result<i64> {
        self.row(row)?.get_int(col)
    }

    pub fn get_float(&self, row: usize, col: usize) -> Result<f64> {
        self.row(row)?.get_float(col)
    }

    pub fn get_str(&self, row: usize, col: usize) -> Result<String> {
        self.row(row)?.get_str(col)
    }

    pub fn value(&self, row: usize, col: usize) -> Result<Value> {
        self.row(row)?.value(col)
    }
}

impl<'a> IntoIterator for &'a Table {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
