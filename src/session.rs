//! The connection session: owns the transport, runs the request/response
//! cycle and decides which command is outstanding.

use std::{collections::HashMap, net::TcpStream, sync::Arc, time::Duration};

use crate::{
    ConnectionError, Error, Misuse, Result,
    columns::Columns,
    connect::{CancelToken, ConnectOptions, Transport},
    copy::CopyChannel,
    cursor::Cursor,
    error::PgErrorResponse,
    messages::{
        FormatCode,
        frontend::{BindParameter, TargetKind},
    },
    pg_stream::PgStream,
    response::{Phase, Progress, Response, ResultStatus, TransactionStatus},
    row::Row,
    startup::{ConnectionBuilder, StartupResponse},
    table::Table,
};

/// Where a session is in its command cycle.
///
/// `Idle -> Executing -> {Idle, Streaming, Copying} -> Idle`, with `Closed`
/// reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Executing,
    Streaming,
    Copying,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Executing => "executing",
            SessionState::Streaming => "streaming",
            SessionState::Copying => "copying",
            SessionState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// How [`Session::drain`] treats the responses of the running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drain {
    /// One extended-protocol command; rows are kept only when asked.
    Extended { keep_rows: bool },
    /// A simple query, possibly several statements; rows are discarded.
    Simple,
    /// A simple query expected to enter COPY FROM STDIN.
    CopyIn,
}

/// What came back for a command, up to ReadyForQuery.
#[derive(Debug, Default)]
pub(crate) struct Collected {
    pub(crate) columns: Option<Arc<Columns>>,
    pub(crate) rows: Vec<Row>,
    pub(crate) statuses: Vec<ResultStatus>,
    pub(crate) error: Option<PgErrorResponse>,
    /// The command entered COPY FROM STDIN and was refused.
    pub(crate) copy_refused: bool,
    /// The server is waiting for COPY data.
    pub(crate) copy_ready: bool,
}

/// A single logical connection to a Postgres server.
///
/// At most one command is outstanding at any time. A [`Cursor`] or
/// [`CopyChannel`] borrows the session mutably for as long as it lives, and
/// the session state is checked on every entry point as well.
pub struct Session<S: Transport = TcpStream> {
    stream: Option<PgStream<S>>,
    state: SessionState,
    process_id: u32,
    secret_key: u32,
    parameters: HashMap<String, String>,
    transaction: TransactionStatus,
    timeout: Option<Duration>,
    last_error: Option<String>,
    cancel_addr: Option<(String, u16)>,
}

impl Session<TcpStream> {
    /// Opens a TCP session from a connection string. See [`ConnectOptions`]
    /// for the accepted forms.
    pub fn open(conn_str: &str) -> Result<Self> {
        let options: ConnectOptions = conn_str.parse()?;
        tracing::debug!(host = %options.host, port = options.port, "opening session");

        let stream = options.connect_tcp()?;
        // Bound the handshake as well as the TCP connect.
        Transport::set_read_timeout(&stream, options.connect_timeout)?;

        let mut session = Session::connect(stream, &options.builder)?;
        session.apply_timeout()?;
        session.cancel_addr = Some((options.host, options.port));
        Ok(session)
    }
}

impl<S: Transport> Session<S> {
    /// Runs the startup handshake over an already open transport.
    pub fn connect(stream: S, builder: &ConnectionBuilder) -> Result<Self> {
        let (stream, startup) = builder.connect(stream)?;
        Ok(Self::from_parts(stream, startup))
    }

    /// Wraps a stream whose handshake already completed, for instance via
    /// [`ConnectionBuilder::connect_with_tls`].
    pub fn from_parts(stream: PgStream<S>, startup: StartupResponse) -> Self {
        Session {
            stream: Some(stream),
            state: SessionState::Idle,
            process_id: startup.process_id,
            secret_key: startup.secret_key,
            parameters: startup.parameters,
            transaction: TransactionStatus::Idle,
            timeout: None,
            last_error: None,
            cancel_addr: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Transaction state as of the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction
    }

    /// A server parameter such as `server_version` or `client_encoding`,
    /// kept current as the server reports changes.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Rendered text of the most recent failure on this session.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            process_id: self.process_id,
            secret_key: self.secret_key,
            addr: self.cancel_addr.clone(),
        }
    }

    /// Bounds every blocking read. When a read times out the session is
    /// closed, since the protocol has no safe way to abandon a command.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.timeout = timeout;
        self.apply_timeout()
    }

    fn apply_timeout(&mut self) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream.get_ref().set_read_timeout(self.timeout)?;
        }
        Ok(())
    }

    /// Closes the session. An in-progress COPY is failed first. Calling
    /// this on a closed session does nothing.
    pub fn close(&mut self) {
        if self.stream.is_some() {
            tracing::debug!(state = %self.state, "closing session");
        }
        self.teardown();
    }

    /// Runs a row-returning command and buffers the whole result.
    ///
    /// Fails with [`Misuse::WrongStatus`] unless the command completes with
    /// [`ResultStatus::TuplesOk`]. A query matching no rows yields an empty
    /// table.
    pub fn query(&mut self, sql: &str, params: &[BindParameter]) -> Result<Table> {
        self.check_params(params)?;
        self.begin(SessionState::Executing)?;
        self.send_extended(sql, params, FormatCode::Text)?;

        let out = self.drain(Drain::Extended { keep_rows: true })?;
        let mut out = self.check(out, "TuplesOk")?;
        match self.single_status(&mut out)? {
            ResultStatus::TuplesOk { .. } => {
                Ok(Table::new(out.columns.unwrap_or_default(), out.rows))
            }
            actual => Err(self.record(
                Misuse::WrongStatus {
                    expected: "TuplesOk",
                    actual,
                }
                .into(),
            )),
        }
    }

    /// Runs a command that returns no rows.
    ///
    /// A statement that produces rows is an error here, never a silent
    /// discard.
    pub fn execute(&mut self, sql: &str, params: &[BindParameter]) -> Result<ResultStatus> {
        self.check_params(params)?;
        self.begin(SessionState::Executing)?;
        self.send_extended(sql, params, FormatCode::Text)?;
        self.finish_execute()
    }

    /// Sends one or more `;`-separated statements as a simple query.
    ///
    /// Statements run in order and the first failure aborts the rest.
    /// Returns the status of every statement; rows are discarded.
    pub fn execute_script(&mut self, script: &str) -> Result<Vec<ResultStatus>> {
        self.begin(SessionState::Executing)?;
        tracing::debug!(script, "sending script");
        self.stream()?.put_query(script);
        self.send()?;

        let out = self.drain(Drain::Simple)?;
        let out = self.check(out, "CommandOk")?;
        Ok(out.statuses)
    }

    /// Sends a command without waiting for its result. The session stays
    /// in [`SessionState::Executing`] until [`Session::end_execute`].
    pub fn start_execute(&mut self, sql: &str, params: &[BindParameter]) -> Result<()> {
        self.check_params(params)?;
        self.begin(SessionState::Executing)?;
        self.send_extended(sql, params, FormatCode::Text)
    }

    /// Waits for the command sent by [`Session::start_execute`].
    pub fn end_execute(&mut self) -> Result<ResultStatus> {
        match self.state {
            SessionState::Executing => self.finish_execute(),
            SessionState::Idle => Err(self.record(Misuse::NothingOutstanding.into())),
            SessionState::Closed => Err(self.record(ConnectionError::Closed.into())),
            busy => Err(self.record(Misuse::Busy(busy).into())),
        }
    }

    /// Starts a row-by-row query. The returned cursor holds the session
    /// until it is exhausted, closed or dropped.
    pub fn start_query(
        &mut self,
        sql: &str,
        params: &[BindParameter],
        binary_format: bool,
    ) -> Result<Cursor<'_, S>> {
        self.check_params(params)?;
        self.begin(SessionState::Streaming)?;
        let format = if binary_format {
            FormatCode::Binary
        } else {
            FormatCode::Text
        };
        self.send_extended(sql, params, format)?;
        Cursor::open(self)
    }

    /// [`Session::start_query`] with text-format results.
    pub fn query_stream(&mut self, sql: &str, params: &[BindParameter]) -> Result<Cursor<'_, S>> {
        self.start_query(sql, params, false)
    }

    /// Runs a `COPY ... FROM STDIN` statement and returns the channel that
    /// feeds it.
    pub fn start_copy_in(&mut self, sql: &str) -> Result<CopyChannel<'_, S>> {
        self.begin(SessionState::Executing)?;
        tracing::debug!(sql, "starting copy in");
        self.stream()?.put_query(sql);
        self.send()?;

        let out = self.drain(Drain::CopyIn)?;
        if out.copy_ready {
            self.transition(SessionState::Copying);
            return Ok(CopyChannel::new(self));
        }

        let mut out = self.check(out, "CopyInOk")?;
        let actual = self.single_status(&mut out)?;
        Err(self.record(
            Misuse::WrongStatus {
                expected: "CopyInOk",
                actual,
            }
            .into(),
        ))
    }

    fn finish_execute(&mut self) -> Result<ResultStatus> {
        let out = self.drain(Drain::Extended { keep_rows: false })?;
        let mut out = self.check(out, "CommandOk")?;
        self.expect_command_ok(&mut out)
    }

    pub(crate) fn expect_command_ok(&mut self, out: &mut Collected) -> Result<ResultStatus> {
        match self.single_status(out)? {
            status @ ResultStatus::CommandOk { .. } => Ok(status),
            actual => Err(self.record(
                Misuse::WrongStatus {
                    expected: "CommandOk",
                    actual,
                }
                .into(),
            )),
        }
    }

    pub(crate) fn stream(&mut self) -> Result<&mut PgStream<S>> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(ConnectionError::Closed.into()),
        }
    }

    /// Parse and Bind carry the parameter count in 16 bits.
    fn check_params(&mut self, params: &[BindParameter]) -> Result<()> {
        if params.len() > u16::MAX as usize {
            return Err(self.record(Misuse::TooManyParameters(params.len()).into()));
        }
        Ok(())
    }

    /// Moves an idle session into `next`.
    fn begin(&mut self, next: SessionState) -> Result<()> {
        match self.state {
            SessionState::Idle => {
                self.transition(next);
                Ok(())
            }
            SessionState::Closed => Err(self.record(ConnectionError::Closed.into())),
            busy => Err(self.record(Misuse::Busy(busy).into())),
        }
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "session state");
            self.state = next;
        }
    }

    fn send_extended(
        &mut self,
        sql: &str,
        params: &[BindParameter],
        format: FormatCode,
    ) -> Result<()> {
        tracing::debug!(sql, params = params.len(), %format, "sending query");
        let portal = TargetKind::new_portal("");
        self.stream()?
            .put_parse("", sql, params.iter().map(BindParameter::type_oid))
            .put_bind("", "", params, format)
            .put_describe(&portal)
            .put_execute("", None)
            .put_sync();
        self.send()
    }

    /// Flushes buffered frontend messages. A failed write closes the
    /// session.
    pub(crate) fn send(&mut self) -> Result<()> {
        let res = self.stream()?.flush_blocking();
        res.map_err(|e| self.fatal(e.into()))
    }

    /// Reads the next response that belongs to the running command.
    /// Notices, parameter changes and notifications are handled here.
    pub(crate) fn recv(&mut self) -> Result<Response> {
        loop {
            let read = match self.stream.as_mut() {
                Some(stream) => stream.read_frame_blocking(),
                None => return Err(self.record(ConnectionError::Closed.into())),
            };
            let frame = match read {
                Ok(frame) => frame,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(self.fatal(ConnectionError::TimedOut.into()));
                }
                Err(e) => return Err(self.fatal(e.into())),
            };

            let resp = Response::try_from(frame).map_err(|e| self.fatal(e))?;
            if !resp.is_async() {
                return Ok(resp);
            }
            self.absorb(resp);
        }
    }

    fn absorb(&mut self, resp: Response) {
        match resp {
            Response::Notice(notice) => tracing::info!(%notice, "server notice"),
            Response::ParameterStatus { name, value } => {
                tracing::debug!(%name, %value, "server parameter changed");
                self.parameters.insert(name, value);
            }
            Response::Notification {
                process_id,
                channel,
                payload,
            } => {
                tracing::info!(process_id, %channel, %payload, "notification");
            }
            _ => {}
        }
    }

    /// Reads responses up to ReadyForQuery, which returns the session to
    /// idle. In [`Drain::CopyIn`] mode it stops early when the server asks
    /// for COPY data. A message that cannot arrive at its point in the
    /// command closes the session.
    pub(crate) fn drain(&mut self, mode: Drain) -> Result<Collected> {
        let progress = match mode {
            Drain::Extended { .. } => Progress::extended(),
            Drain::Simple | Drain::CopyIn => Progress::simple(),
        };
        self.drain_from(mode, progress)
    }

    /// [`Session::drain`] for a command whose first responses were already
    /// read.
    pub(crate) fn drain_from(&mut self, mode: Drain, mut progress: Progress) -> Result<Collected> {
        let mut out = Collected::default();
        let mut seen = 0;

        loop {
            let resp = self.recv()?;
            let described = progress.phase() == Phase::Rows { described: true };
            progress.advance(&resp).map_err(|e| self.fatal(e))?;

            match resp {
                Response::RowDescription(columns) => {
                    out.columns = Some(Arc::new(columns));
                    seen = 0;
                }
                Response::DataRow(body) => {
                    let Some(columns) = &out.columns else {
                        return Err(self.fatal(Error::protocol("DataRow before RowDescription")));
                    };
                    let row = Row::from_data_row(body, columns.clone())
                        .map_err(|e| self.fatal(e))?;
                    seen += 1;
                    if mode == (Drain::Extended { keep_rows: true }) {
                        out.rows.push(row);
                    }
                }
                Response::CommandComplete(tag) => {
                    out.statuses
                        .push(ResultStatus::from_tag(&tag, described, seen));
                    seen = 0;
                }
                Response::EmptyQuery => out.statuses.push(ResultStatus::EmptyQuery),
                Response::Error(e) => {
                    tracing::debug!(error = %e, "command failed");
                    out.error = Some(e);
                }
                Response::CopyInResponse if mode == Drain::CopyIn => {
                    out.copy_ready = true;
                    return Ok(out);
                }
                Response::CopyInResponse => {
                    self.refuse_copy(matches!(mode, Drain::Extended { .. }))?;
                    out.copy_refused = true;
                }
                Response::ReadyForQuery(status) => {
                    self.ready(status);
                    return Ok(out);
                }
                // Header acknowledgements; COPY TO STDOUT data is discarded.
                _ => {}
            }
        }
    }

    /// ReadyForQuery arrived: the command is over.
    pub(crate) fn ready(&mut self, status: TransactionStatus) {
        self.transaction = status;
        self.transition(SessionState::Idle);
    }

    /// Answers an unexpected CopyInResponse with CopyFail. An extended
    /// command also needs a fresh Sync, since the server ignores the one
    /// that arrived while it was in copy mode.
    pub(crate) fn refuse_copy(&mut self, extended: bool) -> Result<()> {
        tracing::debug!("refusing COPY FROM STDIN");
        let stream = self.stream()?;
        stream.put_copy_fail("COPY FROM STDIN is not supported by this call");
        if extended {
            stream.put_sync();
        }
        self.send()
    }

    /// Turns what the server reported into the caller's error, if any.
    pub(crate) fn check(&mut self, out: Collected, expected: &'static str) -> Result<Collected> {
        if out.copy_refused {
            return Err(self.record(
                Misuse::WrongStatus {
                    expected,
                    actual: ResultStatus::CopyInOk,
                }
                .into(),
            ));
        }
        match out.error {
            Some(e) => Err(self.record(Error::Sql(e))),
            None => Ok(out),
        }
    }

    fn single_status(&mut self, out: &mut Collected) -> Result<ResultStatus> {
        match out.statuses.pop() {
            Some(status) => Ok(status),
            None => Err(self.fatal(Error::protocol("command finished without a completion tag"))),
        }
    }

    pub(crate) fn record(&mut self, err: Error) -> Error {
        self.last_error = Some(err.to_string());
        err
    }

    /// Records `err` and closes the session; the stream can no longer be
    /// trusted.
    pub(crate) fn fatal(&mut self, err: Error) -> Error {
        tracing::warn!(error = %err, state = %self.state, "tearing down session");
        self.teardown();
        self.record(err)
    }

    fn teardown(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            self.state = SessionState::Closed;
            return;
        };

        stream.clear_pending();
        if self.state == SessionState::Copying {
            stream.put_copy_fail("session closed");
        }
        stream.put_terminate();
        if let Err(e) = stream.flush_blocking() {
            tracing::debug!(error = %e, "failed to send Terminate");
        }
        if let Err(e) = stream.get_ref().shutdown() {
            tracing::debug!(error = %e, "failed to shut down transport");
        }
        self.transition(SessionState::Closed);
    }
}

impl<S: Transport> Drop for Session<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: Transport> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("process_id", &self.process_id)
            .field("transaction", &self.transaction)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
