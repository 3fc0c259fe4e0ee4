//! Logic for handling and representing Postgres backend messages.

use std::io::Read;

use bytes::{Buf, Bytes, BytesMut};

// Postgres won't allocate memory greater 1GiB. It probably won't
// write messages anywhere close to this size either, but this
// gives us a nice upper bound to prevent misbehaving servers
// from OOMing the client.
// <https://github.com/postgres/postgres/blob/879c492480d0e9ad8155c4269f95c5e8add41901/src/include/utils/memutils.h#L40>
const MAX_FRAME_SIZE_BYTES: usize = 1 << 30; // 1GiB

/// Postgres backend messages are framed by a 1 byte message code,
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
    pub const AUTHENTICATION: Self = Self(b'R');
    pub const BACKEND_KEY_DATA: Self = Self(b'K');
    pub const BIND_COMPLETE: Self = Self(b'2');
    pub const CLOSE_COMPLETE: Self = Self(b'3');
    pub const COMMAND_COMPLETE: Self = Self(b'C');
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_IN_RESPONSE: Self = Self(b'G');
    pub const COPY_OUT_RESPONSE: Self = Self(b'H');
    pub const COPY_BOTH_RESPONSE: Self = Self(b'W');
    pub const DATA_ROW: Self = Self(b'D');
    pub const EMPTY_QUERY_RESPONSE: Self = Self(b'I');
    pub const ERROR_RESPONSE: Self = Self(b'E');
    pub const NEGOTIATE_PROTOCOL_VERSION: Self = Self(b'v');
    pub const NO_DATA: Self = Self(b'n');
    pub const NOTICE_RESPONSE: Self = Self(b'N');
    pub const NOTIFICATION_RESPONSE: Self = Self(b'A');
    pub const PARAMETER_DESCRIPTION: Self = Self(b't');
    pub const PARAMETER_STATUS: Self = Self(b'S');
    pub const PARSE_COMPLETE: Self = Self(b'1');
    pub const PORTAL_SUSPENDED: Self = Self(b's');
    pub const READY_FOR_QUERY: Self = Self(b'Z');
    pub const ROW_DESCRIPTION: Self = Self(b'T');
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
            MessageCode::AUTHENTICATION => "Authentication",
            MessageCode::BACKEND_KEY_DATA => "BackendKeyData",
            MessageCode::BIND_COMPLETE => "BindComplete",
            MessageCode::CLOSE_COMPLETE => "CloseComplete",
            MessageCode::COMMAND_COMPLETE => "CommandComplete",
            MessageCode::COPY_DATA => "CopyData",
            MessageCode::COPY_DONE => "CopyDone",
            MessageCode::COPY_IN_RESPONSE => "CopyInResponse",
            MessageCode::COPY_OUT_RESPONSE => "CopyOutResponse",
            MessageCode::COPY_BOTH_RESPONSE => "CopyBothResponse",
            MessageCode::DATA_ROW => "DataRow",
            MessageCode::EMPTY_QUERY_RESPONSE => "EmptyQueryResponse",
            MessageCode::ERROR_RESPONSE => "ErrorResponse",
            MessageCode::NEGOTIATE_PROTOCOL_VERSION => "NegotiateProtocolVersion",
            MessageCode::NO_DATA => "NoData",
            MessageCode::NOTICE_RESPONSE => "NoticeResponse",
            MessageCode::NOTIFICATION_RESPONSE => "NotificationResponse",
            MessageCode::PARAMETER_DESCRIPTION => "ParameterDescription",
            MessageCode::PARAMETER_STATUS => "ParameterStatus",
            MessageCode::PARSE_COMPLETE => "ParseComplete",
            MessageCode::PORTAL_SUSPENDED => "PortalSuspended",
            MessageCode::READY_FOR_QUERY => "ReadyForQuery",
            MessageCode::ROW_DESCRIPTION => "RowDescription",
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

#[derive(Debug, Clone)]
pub struct PgFrame {
    pub code: MessageCode,
    pub body: Bytes,
}

impl PgFrame {
    pub fn new(code: impl Into<MessageCode>, body: impl Into<Bytes>) -> Self {
        Self {
            code: code.into(),
            body: body.into(),
        }
    }
}

impl std::fmt::Display for PgFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.code, self.body)
    }
}

pub fn read_frame_blocking(mut stream: impl Read) -> std::io::Result<PgFrame> {
    let mut buf = [0; 1];
    stream.read_exact(&mut buf)?;
    let code: MessageCode = u8::from_be_bytes(buf).into();

    let mut buf = [0; 4];
    stream.read_exact(&mut buf)?;
    let len = (u32::from_be_bytes(buf) as usize)
        .checked_sub(size_of::<u32>())
        .ok_or_else(|| invalid_data(format!("{code} frame length is shorter than its header")))?;

    let mut body = init_body(len)?;
    stream.read_exact(&mut body)?;

    Ok(PgFrame::new(code, body))
}

fn init_body(len: usize) -> std::io::Result<BytesMut> {
    if len > MAX_FRAME_SIZE_BYTES {
        let err_msg = format!("frame size exceeds {MAX_FRAME_SIZE_BYTES}B");
        return Err(std::io::Error::new(
            std::io::ErrorKind::QuotaExceeded,
            err_msg,
        ));
    }
    Ok(BytesMut::zeroed(len))
}

fn invalid_data(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

pub fn read_cstring(bytes: &mut Bytes) -> std::io::Result<String> {
    let Some(end) = bytes.iter().position(|&b| b == 0) else {
        return Err(invalid_data("null terminator missing"));
    };

    let bytes = bytes.split_to(end + 1);
    match String::from_utf8(bytes[..end].to_vec()) {
        Ok(string) => Ok(string),
        Err(err) => Err(std::io::Error::other(err)),
    }
}

macro_rules! checked_get {
    ($name:ident, $ty:ty, $get:ident) => {
        pub fn $name(bytes: &mut Bytes) -> std::io::Result<$ty> {
            if bytes.remaining() < size_of::<$ty>() {
                return Err(invalid_data(concat!(
                    "message body too short for ",
                    stringify!($ty)
                )));
            }
            Ok(bytes.$get())
        }
    };
}

checked_get!(read_u8, u8, get_u8);
checked_get!(read_i16, i16, get_i16);
checked_get!(read_u16, u16, get_u16);
checked_get!(read_i32, i32, get_i32);
checked_get!(read_u32, u32, get_u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_frame_blocking() {
        let stream = vec![b'Z', 0, 0, 0, 5, b'I'];
        let frame = read_frame_blocking(stream.as_slice()).unwrap();

        assert_eq!(frame.code, MessageCode::READY_FOR_QUERY);
        assert_eq!(frame.body.as_ref(), &[b'I']);
    }

    #[test]
    fn test_read_frame_rejects_short_length() {
        let stream = vec![b'Z', 0, 0, 0, 2];
        let err = read_frame_blocking(stream.as_slice()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_read_frame_truncated_body() {
        let stream = vec![b'C', 0, 0, 0, 10, b'S'];
        let err = read_frame_blocking(stream.as_slice()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_read_cstring() {
        let mut body = Bytes::from_static(b"server_version\x0016.2\x00");
        assert_eq!(read_cstring(&mut body).unwrap(), "server_version");
        assert_eq!(read_cstring(&mut body).unwrap(), "16.2");
        assert!(read_cstring(&mut body).is_err());
    }

    #[test]
    fn test_checked_reads() {
        let mut body = Bytes::from_static(&[0, 7, 1]);
        assert_eq!(read_u16(&mut body).unwrap(), 7);
        assert!(read_u16(&mut body).is_err());
        assert_eq!(read_u8(&mut body).unwrap(), 1);
    }
}
