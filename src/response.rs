//! Demultiplexes backend frames into the events a session reacts to.

use bytes::Bytes;

use crate::{
    Error, Result,
    columns::Columns,
    error::PgErrorResponse,
    messages::backend::{self, MessageCode, PgFrame},
};

/// Terminal status of one command.
///
/// A server-reported error is not a status; it surfaces as
/// [`Error::Sql`](crate::Error::Sql).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// A command that returns no rows completed. The row count is present
    /// for commands whose tag carries one (INSERT, UPDATE, DELETE, ...).
    CommandOk { rows: Option<u64> },
    /// A row-returning command completed.
    TuplesOk { rows: u64 },
    /// The server is ready to receive COPY data.
    CopyInOk,
    /// The query string was empty.
    EmptyQuery,
}

impl ResultStatus {
    /// Rows affected or returned, when known.
    pub fn rows(&self) -> Option<u64> {
        match self {
            ResultStatus::CommandOk { rows } => *rows,
            ResultStatus::TuplesOk { rows } => Some(*rows),
            ResultStatus::CopyInOk | ResultStatus::EmptyQuery => None,
        }
    }

    /// Builds the status for a CommandComplete tag. `described` tells
    /// whether the command announced a row description, `seen` how many
    /// rows actually arrived.
    pub(crate) fn from_tag(tag: &str, described: bool, seen: u64) -> Self {
        let rows = rows_from_tag(tag);
        if described {
            ResultStatus::TuplesOk {
                rows: rows.unwrap_or(seen),
            }
        } else {
            ResultStatus::CommandOk { rows }
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::CommandOk { rows: Some(n) } => write!(f, "CommandOk({n} rows)"),
            ResultStatus::CommandOk { rows: None } => write!(f, "CommandOk"),
            ResultStatus::TuplesOk { rows } => write!(f, "TuplesOk({rows} rows)"),
            ResultStatus::CopyInOk => write!(f, "CopyInOk"),
            ResultStatus::EmptyQuery => write!(f, "EmptyQuery"),
        }
    }
}

/// Extracts the row count from a CommandComplete tag such as `INSERT 0 5`
/// or `UPDATE 3`.
pub(crate) fn rows_from_tag(tag: &str) -> Option<u64> {
    let verb = tag.split(' ').next()?;
    match verb {
        "INSERT" | "UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE" => {
            tag.rsplit(' ').next()?.parse().ok()
        }
        _ => None,
    }
}

/// Backend transaction state reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(other),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Response {
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    ParameterDescription,
    RowDescription(Columns),
    DataRow(Bytes),
    CommandComplete(String),
    EmptyQuery,
    PortalSuspended,
    Error(PgErrorResponse),
    Notice(PgErrorResponse),
    ParameterStatus {
        name: String,
        value: String,
    },
    Notification {
        process_id: u32,
        channel: String,
        payload: String,
    },
    CopyInResponse,
    CopyOutResponse,
    CopyData,
    CopyDone,
    ReadyForQuery(TransactionStatus),
}

impl Response {
    /// Whether the session handles this message on its own, whatever
    /// command is running.
    pub(crate) fn is_async(&self) -> bool {
        matches!(
            self,
            Response::Notice(_) | Response::ParameterStatus { .. } | Response::Notification { .. }
        )
    }
}

impl TryFrom<PgFrame> for Response {
    type Error = Error;

    fn try_from(frame: PgFrame) -> Result<Self> {
        let code = frame.code;
        decode(frame).map_err(|e| Error::protocol(format!("malformed {code}: {e}")))?
    }
}

/// The outer result carries malformed bodies, the inner one message codes
/// that have no business arriving after startup.
fn decode(frame: PgFrame) -> std::io::Result<Result<Response>> {
    let mut body = frame.body;
    let resp = match frame.code {
        MessageCode::PARSE_COMPLETE => Response::ParseComplete,
        MessageCode::BIND_COMPLETE => Response::BindComplete,
        MessageCode::CLOSE_COMPLETE => Response::CloseComplete,
        MessageCode::NO_DATA => Response::NoData,
        MessageCode::PARAMETER_DESCRIPTION => Response::ParameterDescription,
        MessageCode::ROW_DESCRIPTION => match Columns::from_row_description(body) {
            Ok(columns) => Response::RowDescription(columns),
            Err(e) => return Ok(Err(e)),
        },
        MessageCode::DATA_ROW => Response::DataRow(body),
        MessageCode::COMMAND_COMPLETE => Response::CommandComplete(backend::read_cstring(&mut body)?),
        MessageCode::EMPTY_QUERY_RESPONSE => Response::EmptyQuery,
        MessageCode::PORTAL_SUSPENDED => Response::PortalSuspended,
        MessageCode::ERROR_RESPONSE => Response::Error(PgErrorResponse::new(body)),
        MessageCode::NOTICE_RESPONSE => Response::Notice(PgErrorResponse::new(body)),
        MessageCode::PARAMETER_STATUS => Response::ParameterStatus {
            name: backend::read_cstring(&mut body)?,
            value: backend::read_cstring(&mut body)?,
        },
        MessageCode::NOTIFICATION_RESPONSE => Response::Notification {
            process_id: backend::read_u32(&mut body)?,
            channel: backend::read_cstring(&mut body)?,
            payload: backend::read_cstring(&mut body)?,
        },
        MessageCode::COPY_IN_RESPONSE => Response::CopyInResponse,
        MessageCode::COPY_OUT_RESPONSE => Response::CopyOutResponse,
        MessageCode::COPY_DATA => Response::CopyData,
        MessageCode::COPY_DONE => Response::CopyDone,
        MessageCode::READY_FOR_QUERY => {
            let status = backend::read_u8(&mut body)?;
            match TransactionStatus::try_from(status) {
                Ok(status) => Response::ReadyForQuery(status),
                Err(other) => {
                    return Ok(Err(Error::protocol(format!(
                        "unknown transaction status {:?}",
                        other as char
                    ))));
                }
            }
        }
        code => return Ok(Err(Error::protocol(format!("unexpected message {code}")))),
    };
    Ok(Ok(resp))
}

impl Response {
    fn name(&self) -> &'static str {
        match self {
            Response::ParseComplete => "ParseComplete",
            Response::BindComplete => "BindComplete",
            Response::CloseComplete => "CloseComplete",
            Response::NoData => "NoData",
            Response::ParameterDescription => "ParameterDescription",
            Response::RowDescription(_) => "RowDescription",
            Response::DataRow(_) => "DataRow",
            Response::CommandComplete(_) => "CommandComplete",
            Response::EmptyQuery => "EmptyQueryResponse",
            Response::PortalSuspended => "PortalSuspended",
            Response::Error(_) => "ErrorResponse",
            Response::Notice(_) => "NoticeResponse",
            Response::ParameterStatus { .. } => "ParameterStatus",
            Response::Notification { .. } => "NotificationResponse",
            Response::CopyInResponse => "CopyInResponse",
            Response::CopyOutResponse => "CopyOutResponse",
            Response::CopyData => "CopyData",
            Response::CopyDone => "CopyDone",
            Response::ReadyForQuery(_) => "ReadyForQuery",
        }
    }
}

/// Where one command's response stream stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Extended protocol: waiting for ParseComplete.
    Parse,
    /// Extended protocol: waiting for BindComplete.
    Bind,
    /// Extended protocol: waiting for the portal's RowDescription or NoData.
    Describe,
    /// Simple query: between statements.
    Statement,
    /// A statement is producing its result; DataRow only if it was
    /// described with columns.
    Rows { described: bool },
    /// The server entered COPY FROM STDIN.
    CopyIn,
    /// The server is sending COPY TO STDOUT data, until CopyDone.
    CopyOut { done: bool },
    /// Extended protocol: the command completed, ReadyForQuery is next.
    Completed,
    /// An ErrorResponse arrived; everything up to ReadyForQuery was skipped.
    Failed,
    /// ReadyForQuery arrived; nothing more belongs to this command.
    Ready,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Parse => "awaiting ParseComplete",
            Phase::Bind => "awaiting BindComplete",
            Phase::Describe => "awaiting the row description",
            Phase::Statement => "between statements",
            Phase::Rows { .. } => "reading rows",
            Phase::CopyIn => "in COPY FROM STDIN",
            Phase::CopyOut { .. } => "in COPY TO STDOUT",
            Phase::Completed => "after CommandComplete",
            Phase::Failed => "after ErrorResponse",
            Phase::Ready => "after ReadyForQuery",
        };
        write!(f, "{name}")
    }
}

/// Tracks the response stream of one command and rejects any message the
/// protocol does not allow at that point.
///
/// An extended command (Parse, Bind, Describe portal, Execute, Sync) gets
/// `ParseComplete BindComplete (RowDescription DataRow* | NoData)` and one
/// completion. A simple query gets any number of statement results. Both
/// end in ReadyForQuery, and an ErrorResponse skips straight to it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Progress {
    extended: bool,
    phase: Phase,
}

impl Progress {
    pub(crate) fn extended() -> Self {
        Progress {
            extended: true,
            phase: Phase::Parse,
        }
    }

    pub(crate) fn simple() -> Self {
        Progress {
            extended: false,
            phase: Phase::Statement,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Moves past `resp`, or fails with a protocol error if `resp` cannot
    /// arrive now.
    pub(crate) fn advance(&mut self, resp: &Response) -> Result<()> {
        match self.next(resp) {
            Some(next) => {
                self.phase = next;
                Ok(())
            }
            None => Err(Error::protocol(format!(
                "unexpected {} {}",
                resp.name(),
                self.phase
            ))),
        }
    }

    fn next(&self, resp: &Response) -> Option<Phase> {
        use Phase::*;

        let phase = self.phase;
        let completed = if self.extended { Completed } else { Statement };
        let next = match (phase, resp) {
            (Ready, _) => return None,
            (Statement | Completed | Failed, Response::ReadyForQuery(_)) => Ready,
            (Failed, _) => return None,
            (_, Response::Error(_)) => Failed,

            (Parse, Response::ParseComplete) => Bind,
            (Bind, Response::BindComplete) => Describe,
            (Describe, Response::RowDescription(_)) => Rows { described: true },
            (Describe, Response::NoData) => Rows { described: false },

            (Statement, Response::RowDescription(_)) => Rows { described: true },
            (Rows { described: true }, Response::DataRow(_)) => phase,

            (Statement | Rows { .. }, Response::CommandComplete(_)) => completed,
            (CopyOut { done: true }, Response::CommandComplete(_)) => completed,
            (Statement | Rows { described: false }, Response::EmptyQuery) => completed,

            (Statement | Rows { described: false }, Response::CopyInResponse) => CopyIn,
            (Statement | Rows { described: false }, Response::CopyOutResponse) => {
                CopyOut { done: false }
            }
            (CopyOut { done: false }, Response::CopyData) => phase,
            (CopyOut { done: false }, Response::CopyDone) => CopyOut { done: true },

            _ => return None,
        };
        Some(next)
    }
}
