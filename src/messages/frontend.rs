//! Logic for handling and representing Postgres frontend messages.

use bytes::{BufMut, Bytes, BytesMut};

use crate::messages::{FormatCode, Oid};

pub const SSL_REQUEST: &[u8] = &[
    0x00, 0x00, 0x00, 0x08, // length: 8
    0x04, 0xD2, 0x16, 0x2F, // code: 80877103
];

/// Request code sent in place of a protocol version to cancel a running query.
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Postgres frontend messages are framed by a 1 byte message code,
/// followed by a u32 integer delineating the length of the rest of
/// the message.
///
/// The message code identifies the type of message and format of its
/// payload.
///
/// For more information, see the official Postgres docs:
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const BIND: Self = Self(b'B');
    pub const CLOSE: Self = Self(b'C');
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_FAIL: Self = Self(b'f');
    pub const DESCRIBE: Self = Self(b'D');
    pub const EXECUTE: Self = Self(b'E');
    pub const FLUSH: Self = Self(b'H');
    pub const PARSE: Self = Self(b'P');
    pub const PASSWORD_MESSAGE: Self = Self(b'p');
    pub const QUERY: Self = Self(b'Q');
    pub const SASL_RESPONSE: Self = Self(b'p');
    pub const SYNC: Self = Self(b'S');
    pub const TERMINATE: Self = Self(b'X');

    #[inline]
    pub fn frame(self, buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(self.0);
        frame(buf, payload_fn);
    }
}

impl From<u8> for MessageCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageCode> for u8 {
    fn from(value: MessageCode) -> Self {
        value.0
    }
}

impl PartialEq<u8> for MessageCode {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl PartialEq<MessageCode> for u8 {
    fn eq(&self, other: &MessageCode) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            MessageCode::BIND => "Bind",
            MessageCode::CLOSE => "Close",
            MessageCode::COPY_DATA => "CopyData",
            MessageCode::COPY_DONE => "CopyDone",
            MessageCode::COPY_FAIL => "CopyFail",
            MessageCode::DESCRIBE => "Describe",
            MessageCode::EXECUTE => "Execute",
            MessageCode::FLUSH => "Flush",
            MessageCode::PARSE => "Parse",
            #[allow(unreachable_patterns, reason = "messages all use the same char")]
            MessageCode::PASSWORD_MESSAGE | MessageCode::SASL_RESPONSE => {
                "PasswordMessage|SASLResponse"
            }
            MessageCode::QUERY => "Query",
            MessageCode::SYNC => "Sync",
            MessageCode::TERMINATE => "Terminate",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCode({})", self.0 as char)
    }
}

/// Writes a length-prefixed payload. The length includes itself.
#[inline]
pub fn frame(buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
    let base = buf.len();
    buf.put_u32(0);

    payload_fn(buf);

    let len = (buf.len() - base) as u32;
    buf[base..base + size_of::<u32>()].copy_from_slice(&len.to_be_bytes());
}

#[inline]
pub(crate) fn put_cstring(b: &mut impl BufMut, src: &[u8]) {
    b.put_slice(src);
    b.put_u8(0);
}

fn raw_prefix(buf: &mut impl BufMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

/// The target of a Describe or Close message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Portal(String),
    Statement(String),
}

impl TargetKind {
    pub fn new_portal(name: impl Into<String>) -> Self {
        TargetKind::Portal(name.into())
    }

    pub fn new_stmt(name: impl Into<String>) -> Self {
        TargetKind::Statement(name.into())
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            TargetKind::Portal(_) => b'P',
            TargetKind::Statement(_) => b'S',
        }
    }

    pub(crate) fn name(&self) -> &str {
        match self {
            TargetKind::Portal(name) | TargetKind::Statement(name) => name,
        }
    }
}

/// A positional `$n` parameter value.
///
/// Every variant knows its own type OID, which is declared in the Parse
/// message, and its own wire format, which is declared in the Bind message.
/// Text parameters are sent untyped so the server infers their type from the
/// statement.
#[derive(Debug, Clone, PartialEq)]
pub enum BindParameter {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Bytes),
}

impl BindParameter {
    /// The parameter format code. Each must presently be zero (text) or one (binary).
    pub fn format_code(&self) -> FormatCode {
        match self {
            BindParameter::Null | BindParameter::Text(_) => FormatCode::Text,
            _ => FormatCode::Binary,
        }
    }

    /// The type declared for this parameter in the Parse message.
    pub fn type_oid(&self) -> Oid {
        match self {
            BindParameter::Null | BindParameter::Text(_) => Oid::UNSPECIFIED,
            BindParameter::Bool(_) => Oid::BOOL,
            BindParameter::Int2(_) => Oid::INT2,
            BindParameter::Int4(_) => Oid::INT4,
            BindParameter::Int8(_) => Oid::INT8,
            BindParameter::Float4(_) => Oid::FLOAT4,
            BindParameter::Float8(_) => Oid::FLOAT8,
            BindParameter::Bytea(_) => Oid::BYTEA,
        }
    }

    /// Byte encoding
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            BindParameter::Null => buf.put_i32(-1),
            BindParameter::Bool(b) => raw_prefix(buf, &[*b as u8]),
            BindParameter::Int2(v) => raw_prefix(buf, &v.to_be_bytes()),
            BindParameter::Int4(v) => raw_prefix(buf, &v.to_be_bytes()),
            BindParameter::Int8(v) => raw_prefix(buf, &v.to_be_bytes()),
            BindParameter::Float4(v) => raw_prefix(buf, &v.to_be_bytes()),
            BindParameter::Float8(v) => raw_prefix(buf, &v.to_be_bytes()),
            BindParameter::Bytea(b) => raw_prefix(buf, b),
            BindParameter::Text(s) => raw_prefix(buf, s.as_bytes()),
        }
    }
}

impl From<i16> for BindParameter {
    fn from(v: i16) -> Self {
        BindParameter::Int2(v)
    }
}

impl From<i32> for BindParameter {
    fn from(v: i32) -> Self {
        BindParameter::Int4(v)
    }
}

impl From<i64> for BindParameter {
    fn from(v: i64) -> Self {
        BindParameter::Int8(v)
    }
}

impl From<f32> for BindParameter {
    fn from(v: f32) -> Self {
        BindParameter::Float4(v)
    }
}

impl From<f64> for BindParameter {
    fn from(v: f64) -> Self {
        BindParameter::Float8(v)
    }
}

impl From<bool> for BindParameter {
    fn from(v: bool) -> Self {
        BindParameter::Bool(v)
    }
}

impl From<String> for BindParameter {
    fn from(v: String) -> Self {
        BindParameter::Text(v)
    }
}

impl From<&str> for BindParameter {
    fn from(v: &str) -> Self {
        BindParameter::Text(v.to_string())
    }
}

impl From<&String> for BindParameter {
    fn from(v: &String) -> Self {
        BindParameter::Text(v.clone())
    }
}

impl From<Bytes> for BindParameter {
    fn from(v: Bytes) -> Self {
        BindParameter::Bytea(v)
    }
}

impl From<&[u8]> for BindParameter {
    fn from(v: &[u8]) -> Self {
        BindParameter::Bytea(Bytes::copy_from_slice(v))
    }
}

impl<T: Into<BindParameter>> From<Option<T>> for BindParameter {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => BindParameter::Null,
        }
    }
}

/// Builds a `[BindParameter; N]` from heterogeneous values.
///
/// ```
/// use pg_session::{params, BindParameter};
///
/// let p = params![1, "two", None::<i64>];
/// assert_eq!(p[1], BindParameter::Text("two".into()));
/// ```
#[macro_export]
macro_rules! params {
    () => {{
        let empty: [$crate::BindParameter; 0] = [];
        empty
    }};
    ($($value:expr),+ $(,)?) => {
        [$($crate::BindParameter::from($value)),+]
    };
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;

    #[test]
    fn test_frame_writes_inclusive_length() {
        let mut buf = BytesMut::new();
        MessageCode::SYNC.frame(&mut buf, |_| {});
        assert_eq!(buf.as_ref(), &[b'S', 0, 0, 0, 4]);
    }

    #[test]
    fn test_text_parameter_is_length_prefixed_without_terminator() {
        let mut buf = BytesMut::new();
        BindParameter::from("abc").encode(&mut buf);

        let mut expected = BytesMut::new();
        expected.put_u32(3);
        expected.put_slice(b"abc");
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_null_parameter() {
        let mut buf = BytesMut::new();
        BindParameter::from(None::<i32>).encode(&mut buf);
        assert_eq!(buf.as_ref(), &(-1i32).to_be_bytes());
        assert_eq!(BindParameter::Null.type_oid(), Oid::UNSPECIFIED);
    }

    #[test]
    fn test_parameter_types_follow_rust_types() {
        let p = crate::params![1i16, 2, 3i64, 1.5f32, 2.5, true, "x"];
        let oids: Vec<Oid> = p.iter().map(BindParameter::type_oid).collect();
        assert_eq!(
            oids,
            [
                Oid::INT2,
                Oid::INT4,
                Oid::INT8,
                Oid::FLOAT4,
                Oid::FLOAT8,
                Oid::BOOL,
                Oid::UNSPECIFIED
            ]
        );
        assert_eq!(p[6].format_code(), FormatCode::Text);
        assert_eq!(p[1].format_code(), FormatCode::Binary);
    }

    #[test]
    fn test_empty_params_macro() {
        let p = crate::params![];
        assert!(p.is_empty());
    }
}
