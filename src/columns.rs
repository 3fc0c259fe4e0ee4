use std::collections::HashMap;

use bytes::Bytes;

use crate::{
    Error, Result,
    messages::{FormatCode, Oid, backend},
};

/// Metadata for one result column, as reported by RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_oid: Oid,
    /// Declared width in bytes; negative for variable-width types.
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
    pub ordinal: usize,
    /// Source table, or zero when the column is computed.
    pub table_oid: u32,
    pub table_attr: i16,
}

/// The immutable column set shared by every row of one result.
///
/// Name lookups resolve to the first column carrying that name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Columns {
    columns: Vec<ColumnDescriptor>,
    by_name: HashMap<String, usize>,
}

impl Columns {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        let mut by_name = HashMap::with_capacity(columns.len());
        for column in &columns {
            by_name.entry(column.name.clone()).or_insert(column.ordinal);
        }
        Self { columns, by_name }
    }

    /// Parses the body of a RowDescription message.
    pub fn from_row_description(body: Bytes) -> Result<Self> {
        parse_row_description(body)
            .map(Self::new)
            .map_err(|e| Error::protocol(format!("malformed RowDescription: {e}")))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&ColumnDescriptor> {
        self.columns.get(index).ok_or(Error::Index {
            index,
            len: self.columns.len(),
        })
    }

    pub fn name(&self, index: usize) -> Result<&str> {
        self.get(index).map(|c| c.name.as_str())
    }

    /// Resolves a column name to its ordinal.
    pub fn column_by_name(&self, name: &str) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ColumnDescriptor> {
        self.columns.iter()
    }
}

fn parse_row_description(mut body: Bytes) -> std::io::Result<Vec<ColumnDescriptor>> {
    let invalid = |msg: String| std::io::Error::new(std::io::ErrorKind::InvalidData, msg);

    let count = backend::read_i16(&mut body)?;
    let count = usize::try_from(count).map_err(|_| invalid(format!("negative column count {count}")))?;

    let mut columns = Vec::with_capacity(count);
    for ordinal in 0..count {
        let name = backend::read_cstring(&mut body)?;
        let table_oid = backend::read_u32(&mut body)?;
        let table_attr = backend::read_i16(&mut body)?;
        let type_oid = Oid::from(backend::read_u32(&mut body)?);
        let type_size = backend::read_i16(&mut body)?;
        let type_modifier = backend::read_i32(&mut body)?;
        let format = backend::read_u16(&mut body)?;
        let format =
            FormatCode::from_u16(format).ok_or_else(|| invalid(format!("unknown format code {format}")))?;

        columns.push(ColumnDescriptor {
            name,
            type_oid,
            type_size,
            type_modifier,
            format,
            ordinal,
            table_oid,
            table_attr,
        });
    }

    Ok(columns)
}

impl<'a> IntoIterator for &'a Columns {
    type Item = &'a ColumnDescriptor;
    type IntoIter = std::slice::Iter<'a, ColumnDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.iter()
    }
}
