use std::{borrow::Cow, ops::Range};

use bytes::Bytes;

use crate::{
    messages::backend::{self, PgFrame},
    response::ResultStatus,
    session::SessionState,
    startup,
};

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while driving a session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport or authentication failure, including a session that was
    /// closed underneath an outstanding operation.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    /// The server sent something the protocol does not allow at this point.
    /// The session is closed before this error is returned.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server reported an error for the command.
    #[error("server error: {0}")]
    Sql(PgErrorResponse),
    /// The caller broke the one-command-at-a-time discipline or asked for
    /// the wrong command shape.
    #[error("protocol misuse: {0}")]
    Misuse(#[from] Misuse),
    /// A value could not be decoded as the requested type.
    #[error("type error: {0}")]
    Type(String),
    #[error("index {index} is out of range for length {len}")]
    Index { index: usize, len: usize },
    #[error("column {0:?} not found")]
    ColumnNotFound(String),
}

impl Error {
    /// The SQLSTATE code of a server error.
    pub fn sql_state(&self) -> Option<Cow<'_, str>> {
        match self {
            Error::Sql(e) => e.code(),
            _ => None,
        }
    }

    /// Whether the session this error came from can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Protocol(_))
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn type_error(msg: impl Into<String>) -> Self {
        Error::Type(msg.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("encountered I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("startup failed: {0}")]
    Startup(#[from] startup::Error),
    #[error("timed out waiting for the server")]
    TimedOut,
    #[error("session is closed")]
    Closed,
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Connection(value.into())
    }
}

impl From<startup::Error> for Error {
    fn from(value: startup::Error) -> Self {
        Error::Connection(value.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Misuse {
    #[error("session is {0}; finish the outstanding operation first")]
    Busy(SessionState),
    #[error("no statement is outstanding")]
    NothingOutstanding,
    #[error("expected {expected} but the command completed with {actual}")]
    WrongStatus {
        expected: &'static str,
        actual: ResultStatus,
    },
    #[error("no row is loaded; next_row must return true first")]
    NoCurrentRow,
    #[error("{0} parameters given; at most 65535 fit in one statement")]
    TooManyParameters(usize),
}

/// A zero-copy representation of a Postgres ErrorResponse or NoticeResponse
#[derive(Clone)]
pub struct PgErrorResponse {
    body: Bytes,
    local_severity: Option<Range<usize>>,    // S
    severity: Option<Range<usize>>,          // V
    code: Option<Range<usize>>,              // C
    message: Option<Range<usize>>,           // M
    detail: Option<Range<usize>>,            // D
    hint: Option<Range<usize>>,              // H
    position: Option<Range<usize>>,          // P
    internal_position: Option<Range<usize>>, // p
    internal_query: Option<Range<usize>>,    // q
    r#where: Option<Range<usize>>,           // W
    schema: Option<Range<usize>>,            // s
    table: Option<Range<usize>>,             // t
    column: Option<Range<usize>>,            // c
    datatype: Option<Range<usize>>,          // d
    constraint: Option<Range<usize>>,        // n
    file: Option<Range<usize>>,              // F
    line: Option<Range<usize>>,              // L
    routine: Option<Range<usize>>,           // R
}

impl std::fmt::Display for PgErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sev = self.local_severity().unwrap_or("UNKNOWN".into());
        let code = self.code().unwrap_or("?????".into());
        let msg = self.message().unwrap_or("<no message>".into());
        write!(f, "[{sev}] {code}: {msg}")
    }
}

impl std::fmt::Debug for PgErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgErrorResponse")
            .field("local_severity", &self.local_severity())
            .field("severity", &self.severity())
            .field("code", &self.code())
            .field("message", &self.message())
            .field("detail", &self.detail())
            .field("hint", &self.hint())
            .field("position", &self.position())
            .field("where", &self.r#where())
            .field("table", &self.table())
            .field("constraint", &self.constraint())
            .finish_non_exhaustive()
    }
}

impl PgErrorResponse {
    pub(crate) fn new(body: Bytes) -> Self {
        let mut resp = PgErrorResponse {
            body: body.clone(),
            local_severity: None,
            severity: None,
            code: None,
            message: None,
            detail: None,
            hint: None,
            position: None,
            internal_position: None,
            internal_query: None,
            r#where: None,
            schema: None,
            table: None,
            column: None,
            datatype: None,
            constraint: None,
            file: None,
            line: None,
            routine: None,
        };

        let mut offset = 0;
        for field in body.split(|b| *b == 0) {
            if field.is_empty() {
                break;
            }

            // field[0] = tag, field[1..] = value
            let tag = field[0];
            let start = offset + 1;
            let end = start + field.len() - 1; // minus tag

            let range = start..end;
            match tag {
                b'S' => resp.local_severity = Some(range),
                b'V' => resp.severity = Some(range),
                b'C' => resp.code = Some(range),
                b'M' => resp.message = Some(range),
                b'D' => resp.detail = Some(range),
                b'H' => resp.hint = Some(range),
                b'P' => resp.position = Some(range),
                b'p' => resp.internal_position = Some(range),
                b'q' => resp.internal_query = Some(range),
                b'W' => resp.r#where = Some(range),
                b's' => resp.schema = Some(range),
                b't' => resp.table = Some(range),
                b'c' => resp.column = Some(range),
                b'd' => resp.datatype = Some(range),
                b'n' => resp.constraint = Some(range),
                b'F' => resp.file = Some(range),
                b'L' => resp.line = Some(range),
                b'R' => resp.routine = Some(range),
                _ => {}
            }

            offset += field.len() + 1; // +1 for the null terminator
        }

        resp
    }

    fn field(&self, range: &Option<Range<usize>>) -> Option<Cow<'_, str>> {
        range
            .as_ref()
            .map(|r| String::from_utf8_lossy(&self.body[r.start..r.end]))
    }

    pub fn local_severity(&self) -> Option<Cow<'_, str>> {
        self.field(&self.local_severity)
    }

    pub fn severity(&self) -> Option<Cow<'_, str>> {
        self.field(&self.severity)
    }

    /// The SQLSTATE code, e.g. `42P01`.
    pub fn code(&self) -> Option<Cow<'_, str>> {
        self.field(&self.code)
    }

    pub fn message(&self) -> Option<Cow<'_, str>> {
        self.field(&self.message)
    }

    pub fn detail(&self) -> Option<Cow<'_, str>> {
        self.field(&self.detail)
    }

    pub fn hint(&self) -> Option<Cow<'_, str>> {
        self.field(&self.hint)
    }

    pub fn position(&self) -> Option<Cow<'_, str>> {
        self.field(&self.position)
    }

    pub fn internal_position(&self) -> Option<Cow<'_, str>> {
        self.field(&self.internal_position)
    }

    pub fn internal_query(&self) -> Option<Cow<'_, str>> {
        self.field(&self.internal_query)
    }

    pub fn r#where(&self) -> Option<Cow<'_, str>> {
        self.field(&self.r#where)
    }

    pub fn schema(&self) -> Option<Cow<'_, str>> {
        self.field(&self.schema)
    }

    pub fn table(&self) -> Option<Cow<'_, str>> {
        self.field(&self.table)
    }

    pub fn column(&self) -> Option<Cow<'_, str>> {
        self.field(&self.column)
    }

    pub fn datatype(&self) -> Option<Cow<'_, str>> {
        self.field(&self.datatype)
    }

    pub fn constraint(&self) -> Option<Cow<'_, str>> {
        self.field(&self.constraint)
    }

    pub fn file(&self) -> Option<Cow<'_, str>> {
        self.field(&self.file)
    }

    pub fn line(&self) -> Option<Cow<'_, str>> {
        self.field(&self.line)
    }

    pub fn routine(&self) -> Option<Cow<'_, str>> {
        self.field(&self.routine)
    }
}

impl TryFrom<PgFrame> for PgErrorResponse {
    type Error = PgFrame;

    fn try_from(frame: PgFrame) -> std::result::Result<Self, Self::Error> {
        if frame.code == backend::MessageCode::ERROR_RESPONSE
            || frame.code == backend::MessageCode::NOTICE_RESPONSE
        {
            Ok(PgErrorResponse::new(frame.body))
        } else {
            Err(frame)
        }
    }
}
