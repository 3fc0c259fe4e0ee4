//! Decoding of raw column bytes into logical values.
//!
//! Text-format values are parsed from their literal form. Binary-format
//! values are read per the column's declared type: big-endian two's
//! complement integers of 2, 4 or 8 bytes, IEEE-754 big-endian floats of 4
//! or 8 bytes, a single byte for booleans, and the bytes themselves for
//! textual types. Binary `numeric` is rendered to its text form first, so
//! it decodes exactly like the text-format value.

use std::fmt::Write;

use crate::{
    Error, Result,
    columns::ColumnDescriptor,
    messages::{FormatCode, Oid},
};

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", if *b { "t" } else { "f" }),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{}", render_float(*v)),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

pub(crate) fn decode_bool(col: &ColumnDescriptor, raw: &[u8]) -> Result<bool> {
    match col.format {
        FormatCode::Text => match raw {
            b"t" => Ok(true),
            b"f" => Ok(false),
            _ => Err(mismatch(col, raw, "bool")),
        },
        FormatCode::Binary => match raw {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(mismatch(col, raw, "bool")),
        },
    }
}

pub(crate) fn decode_int(col: &ColumnDescriptor, raw: &[u8]) -> Result<i64> {
    match col.format {
        FormatCode::Text => text(col, raw)?
            .parse::<i64>()
            .map_err(|_| mismatch(col, raw, "integer")),
        FormatCode::Binary if col.type_oid == Oid::NUMERIC => decode_numeric(col, raw)?
            .parse::<i64>()
            .map_err(|_| mismatch(col, raw, "integer")),
        FormatCode::Binary if col.type_oid == Oid::OID => {
            Ok(u32::from_be_bytes(sized::<4>(col, raw, "oid")?) as i64)
        }
        FormatCode::Binary if col.type_oid.is_integer() => match binary_width(col, raw) {
            2 => Ok(i16::from_be_bytes(sized::<2>(col, raw, "int2")?) as i64),
            4 => Ok(i32::from_be_bytes(sized::<4>(col, raw, "int4")?) as i64),
            8 => Ok(i64::from_be_bytes(sized::<8>(col, raw, "int8")?)),
            _ => Err(mismatch(col, raw, "integer")),
        },
        FormatCode::Binary => Err(unsupported(col, "integer")),
    }
}

/// A `float4` is widened from its single-precision value in both formats,
/// so `0.1` sent as text and as binary decodes to the same `f64`.
pub(crate) fn decode_float(col: &ColumnDescriptor, raw: &[u8]) -> Result<f64> {
    match col.format {
        FormatCode::Text if col.type_oid == Oid::FLOAT4 => text(col, raw)?
            .parse::<f32>()
            .map(f64::from)
            .map_err(|_| mismatch(col, raw, "float")),
        FormatCode::Text => text(col, raw)?
            .parse::<f64>()
            .map_err(|_| mismatch(col, raw, "float")),
        FormatCode::Binary if col.type_oid == Oid::NUMERIC => decode_numeric(col, raw)?
            .parse::<f64>()
            .map_err(|_| mismatch(col, raw, "float")),
        FormatCode::Binary if col.type_oid.is_float() => match binary_width(col, raw) {
            4 => Ok(f32::from_be_bytes(sized::<4>(col, raw, "float4")?).into()),
            8 => Ok(f64::from_be_bytes(sized::<8>(col, raw, "float8")?)),
            _ => Err(mismatch(col, raw, "float")),
        },
        FormatCode::Binary if col.type_oid.is_integer() => decode_int(col, raw).map(|v| v as f64),
        FormatCode::Binary => Err(unsupported(col, "float")),
    }
}

/// Text is returned verbatim for text-format columns. Binary numeric and
/// boolean columns are rendered the way the server would render them in
/// text format, never as their raw bytes.
pub(crate) fn decode_str(col: &ColumnDescriptor, raw: &[u8]) -> Result<String> {
    match col.format {
        FormatCode::Text => text(col, raw).map(str::to_string),
        FormatCode::Binary if col.type_oid == Oid::FLOAT4 => {
            let v = f32::from_be_bytes(sized::<4>(col, raw, "float4")?);
            if v.is_finite() {
                Ok(v.to_string())
            } else {
                Ok(render_float(v.into()))
            }
        }
        FormatCode::Binary => match decode_value(col, Some(raw))? {
            Value::Text(s) => Ok(s),
            other => Ok(other.to_string()),
        },
    }
}

/// Decodes a column into the logical value its type maps to.
///
/// Types without a numeric or boolean mapping, `numeric` included, decode
/// to [`Value::Text`] in text format; in binary format only textual types
/// and `numeric` are understood.
pub(crate) fn decode_value(col: &ColumnDescriptor, raw: Option<&[u8]>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };

    let oid = col.type_oid;
    if oid == Oid::BOOL {
        decode_bool(col, raw).map(Value::Bool)
    } else if oid.is_integer() {
        decode_int(col, raw).map(Value::Int64)
    } else if oid.is_float() {
        decode_float(col, raw).map(Value::Float64)
    } else if oid == Oid::NUMERIC && col.format == FormatCode::Binary {
        decode_numeric(col, raw).map(Value::Text)
    } else if col.format == FormatCode::Text || oid.is_textual() {
        text(col, raw).map(|s| Value::Text(s.to_string()))
    } else {
        Err(unsupported(col, "value"))
    }
}

/// Renders a binary `numeric` the way the server prints it in text format.
///
/// The value is a header of four 16-bit words (digit count, weight of the
/// first digit, sign, display scale) followed by base-10000 digits.
fn decode_numeric(col: &ColumnDescriptor, raw: &[u8]) -> Result<String> {
    let word = |i: usize| u16::from_be_bytes([raw[2 * i], raw[2 * i + 1]]);
    if raw.len() < 8 {
        return Err(mismatch(col, raw, "numeric"));
    }
    let ndigits = word(0) as usize;
    let weight = word(1) as i16 as i32;
    let sign = word(2);
    let dscale = word(3) as usize;
    if raw.len() != 8 + 2 * ndigits {
        return Err(mismatch(col, raw, "numeric"));
    }

    let mut out = String::new();
    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        0x4000 => out.push('-'),
        0x0000 => {}
        _ => return Err(mismatch(col, raw, "numeric")),
    }

    let digits: Vec<u16> = (0..ndigits).map(|i| word(4 + i)).collect();
    if digits.iter().any(|d| *d > 9999) {
        return Err(mismatch(col, raw, "numeric"));
    }
    let digit = |i: i32| match usize::try_from(i) {
        Ok(i) => digits.get(i).copied().unwrap_or(0),
        Err(_) => 0,
    };

    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            let _ = if i == 0 {
                write!(out, "{}", digit(i))
            } else {
                write!(out, "{:04}", digit(i))
            };
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit(i));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

fn render_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        let s = if v > 0.0 { "Infinity" } else { "-Infinity" };
        s.to_string()
    } else {
        v.to_string()
    }
}

fn text<'a>(col: &ColumnDescriptor, raw: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(raw)
        .map_err(|e| Error::type_error(format!("column {:?} is not valid UTF-8: {e}", col.name)))
}

/// The width a binary value must have: the declared type size when the
/// server reports a fixed one, otherwise the payload's own length.
fn binary_width(col: &ColumnDescriptor, raw: &[u8]) -> usize {
    match col.type_size {
        2 | 4 | 8 => col.type_size as usize,
        _ => raw.len(),
    }
}

fn sized<const N: usize>(col: &ColumnDescriptor, raw: &[u8], what: &str) -> Result<[u8; N]> {
    raw.try_into().map_err(|_| {
        Error::type_error(format!(
            "column {:?} holds {} bytes, expected {N} for {what}",
            col.name,
            raw.len()
        ))
    })
}

fn mismatch(col: &ColumnDescriptor, raw: &[u8], what: &str) -> Error {
    Error::type_error(format!(
        "column {:?} ({} {}) value {:?} is not a {what}",
        col.name,
        col.format,
        col.type_oid,
        String::from_utf8_lossy(raw)
    ))
}

fn unsupported(col: &ColumnDescriptor, what: &str) -> Error {
    Error::type_error(format!(
        "cannot decode binary {} column {:?} as {what}",
        col.type_oid, col.name
    ))
}
