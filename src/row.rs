use std::{ops::Range, sync::Arc};

use bytes::Bytes;

use crate::{
    Error, Result,
    codec::{self, Value},
    columns::{ColumnDescriptor, Columns},
    messages::backend,
};

/// One DataRow: the raw cells of a result row plus the column set that
/// describes them.
///
/// Cells are kept as ranges into the message body, so a row costs one
/// allocation regardless of its width.
#[derive(Clone)]
pub struct Row {
    body: Bytes,
    cells: Vec<Option<Range<usize>>>,
    columns: Arc<Columns>,
}

impl Row {
    /// Splits a DataRow body into cells. The cell count must match the
    /// column set.
    pub(crate) fn from_data_row(body: Bytes, columns: Arc<Columns>) -> Result<Self> {
        let cells = split_cells(body.clone())
            .map_err(|e| Error::protocol(format!("malformed DataRow: {e}")))?;
        if cells.len() != columns.len() {
            return Err(Error::protocol(format!(
                "DataRow has {} cells for {} columns",
                cells.len(),
                columns.len()
            )));
        }
        Ok(Row {
            body,
            cells,
            columns,
        })
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.cells.len()
    }

    pub fn column_name(&self, col: usize) -> Result<&str> {
        self.columns.name(col)
    }

    /// Resolves a column name to its ordinal in this row.
    pub fn column_by_name(&self, name: &str) -> Result<usize> {
        self.columns.column_by_name(name)
    }

    /// The raw bytes of a cell, `None` for SQL NULL.
    pub fn cell(&self, col: usize) -> Result<Option<&[u8]>> {
        let range = self.cells.get(col).ok_or(Error::Index {
            index: col,
            len: self.cells.len(),
        })?;
        Ok(range.clone().map(|r| &self.body[r]))
    }

    pub fn is_null(&self, col: usize) -> Result<bool> {
        self.cell(col).map(|c| c.is_none())
    }

    pub fn get_bool(&self, col: usize) -> Result<bool> {
        let (desc, raw) = self.non_null(col)?;
        codec::decode_bool(desc, raw)
    }

    pub fn get_int(&self, col: usize) -> Result<i64> {
        let (desc, raw) = self.non_null(col)?;
        codec::decode_int(desc, raw)
    }

    pub fn get_float(&self, col: usize) -> Result<f64> {
        let (desc, raw) = self.non_null(col)?;
        codec::decode_float(desc, raw)
    }

    pub fn get_str(&self, col: usize) -> Result<String> {
        let (desc, raw) = self.non_null(col)?;
        codec::decode_str(desc, raw)
    }

    /// Decodes a cell into whatever [`Value`] its column type maps to.
    pub fn value(&self, col: usize) -> Result<Value> {
        let raw = self.cell(col)?;
        codec::decode_value(self.columns.get(col)?, raw)
    }

    /// Every cell of the row decoded with [`Row::value`].
    pub fn values(&self) -> Result<Vec<Value>> {
        (0..self.cells.len()).map(|i| self.value(i)).collect()
    }

    fn non_null(&self, col: usize) -> Result<(&ColumnDescriptor, &[u8])> {
        let desc = self.columns.get(col)?;
        match self.cell(col)? {
            Some(raw) => Ok((desc, raw)),
            None => Err(Error::type_error(format!(
                "column {:?} is NULL",
                desc.name
            ))),
        }
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (col, desc) in self.columns.iter().enumerate() {
            match self.value(col) {
                Ok(v) => map.entry(&desc.name, &v),
                Err(_) => map.entry(&desc.name, &self.cell(col).ok().flatten()),
            };
        }
        map.finish()
    }
}

fn split_cells(mut body: Bytes) -> std::io::Result<Vec<Option<Range<usize>>>> {
    let total = body.len();
    let count = backend::read_i16(&mut body)?;
    let count = usize::try_from(count).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("negative cell count {count}"),
        )
    })?;

    let mut cells = Vec::with_capacity(count);
    for _ in 0..count {
        let len = backend::read_i32(&mut body)?;
        if len < 0 {
            cells.push(None);
            continue;
        }
        let len = len as usize;
        if body.len() < len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("cell of {len} bytes overruns the message"),
            ));
        }
        let start = total - body.len();
        cells.push(Some(start..start + len));
        let _ = body.split_to(len);
    }

    Ok(cells)
}
