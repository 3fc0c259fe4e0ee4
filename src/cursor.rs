use std::sync::Arc;

use crate::{
    Error, Misuse, Result,
    codec::Value,
    columns::Columns,
    connect::Transport,
    error::PgErrorResponse,
    response::{Progress, Response, ResultStatus},
    row::Row,
    session::{Drain, Session, SessionState},
};

/// A forward-only view over a query result, one row at a time.
///
/// Rows are read off the socket as [`Cursor::next_row`] asks for them and
/// only the current one is held. The cursor keeps the session until the
/// server reports completion; dropping it early reads and discards the
/// remaining rows.
pub struct Cursor<'a, S: Transport> {
    session: &'a mut Session<S>,
    columns: Option<Arc<Columns>>,
    progress: Progress,
    current: Option<Row>,
    status: Option<ResultStatus>,
    error: Option<PgErrorResponse>,
    copy_refused: bool,
    seen: u64,
    finished: bool,
}

impl<'a, S: Transport> Cursor<'a, S> {
    /// Reads the statement's description so column metadata is available
    /// before the first row. A statement the server rejects fails here.
    pub(crate) fn open(session: &'a mut Session<S>) -> Result<Self> {
        let mut progress = Progress::extended();
        let columns = loop {
            let resp = session.recv()?;
            progress.advance(&resp).map_err(|e| session.fatal(e))?;
            match resp {
                Response::RowDescription(columns) => break Some(Arc::new(columns)),
                Response::NoData => break None,
                Response::Error(e) => {
                    // Nothing else runs after a failed Parse or Bind; the
                    // rest is the ReadyForQuery that follows Sync.
                    session.drain_from(Drain::Extended { keep_rows: false }, progress)?;
                    return Err(session.record(Error::Sql(e)));
                }
                _ => {}
            }
        };

        Ok(Cursor {
            session,
            columns,
            progress,
            current: None,
            status: None,
            error: None,
            copy_refused: false,
            seen: 0,
            finished: false,
        })
    }

    /// Loads the next row. Returns `false` once the result is exhausted,
    /// at which point the session is released.
    pub fn next_row(&mut self) -> Result<bool> {
        self.current = None;
        if self.finished {
            return Ok(false);
        }
        match self.session.state() {
            SessionState::Streaming => {}
            SessionState::Closed => {
                self.finished = true;
                return Err(self.session.record(crate::ConnectionError::Closed.into()));
            }
            other => return Err(self.session.record(Misuse::Busy(other).into())),
        }

        loop {
            let resp = match self.session.recv() {
                Ok(resp) => resp,
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };
            if let Err(e) = self.progress.advance(&resp) {
                self.finished = true;
                return Err(self.session.fatal(e));
            }

            match resp {
                Response::DataRow(body) => {
                    let Some(columns) = &self.columns else {
                        self.finished = true;
                        return Err(self
                            .session
                            .fatal(Error::protocol("DataRow for a statement without rows")));
                    };
                    let row = match Row::from_data_row(body, columns.clone()) {
                        Ok(row) => row,
                        Err(e) => {
                            self.finished = true;
                            return Err(self.session.fatal(e));
                        }
                    };
                    self.seen += 1;
                    self.current = Some(row);
                    return Ok(true);
                }
                Response::CommandComplete(tag) => {
                    self.status = Some(ResultStatus::from_tag(
                        &tag,
                        self.columns.is_some(),
                        self.seen,
                    ));
                }
                Response::EmptyQuery => self.status = Some(ResultStatus::EmptyQuery),
                Response::Error(e) => self.error = Some(e),
                Response::CopyInResponse => {
                    self.copy_refused = true;
                    if let Err(e) = self.session.refuse_copy(true) {
                        self.finished = true;
                        return Err(e);
                    }
                }
                Response::ReadyForQuery(status) => return self.complete(status),
                // COPY TO STDOUT data is discarded.
                _ => {}
            }
        }
    }

    fn complete(&mut self, status: crate::TransactionStatus) -> Result<bool> {
        self.finished = true;
        self.session.ready(status);
        if self.copy_refused {
            return Err(self.session.record(
                Misuse::WrongStatus {
                    expected: "TuplesOk",
                    actual: ResultStatus::CopyInOk,
                }
                .into(),
            ));
        }
        match self.error.take() {
            Some(e) => Err(self.session.record(Error::Sql(e))),
            None => Ok(false),
        }
    }

    /// The current row. Only valid after [`Cursor::next_row`] returned
    /// `true`.
    pub fn row(&self) -> Result<&Row> {
        self.current
            .as_ref()
            .ok_or(Error::Misuse(Misuse::NoCurrentRow))
    }

    /// Column metadata, or `None` for a statement that returns no rows.
    pub fn columns(&self) -> Option<&Columns> {
        self.columns.as_deref()
    }

    pub fn column_count(&self) -> usize {
        self.columns.as_ref().map_or(0, |c| c.len())
    }

    pub fn column_name(&self, col: usize) -> Result<&str> {
        match &self.columns {
            Some(columns) => columns.name(col),
            None => Err(Error::Index { index: col, len: 0 }),
        }
    }

    pub fn column_by_name(&self, name: &str) -> Result<usize> {
        match &self.columns {
            Some(columns) => columns.column_by_name(name),
            None => Err(Error::ColumnNotFound(name.to_string())),
        }
    }

    pub fn cell(&self, col: usize) -> Result<Option<&[u8]>> {
        self.row()?.cell(col)
    }

    pub fn is_null(&self, col: usize) -> Result<bool> {
        self.row()?.is_null(col)
    }

    pub fn get_bool(&self, col: usize) -> Result<bool> {
        self.row()?.get_bool(col)
    }

    pub fn get_int(&self, col: usize) -> Result<i64> {
        self.row()?.get_int(col)
    }

    pub fn get_float(&self, col: usize) -> Result<f64> {
        self.row()?.get_float(col)
    }

    pub fn get_str(&self, col: usize) -> Result<String> {
        self.row()?.get_str(col)
    }

    pub fn value(&self, col: usize) -> Result<Value> {
        self.row()?.value(col)
    }

    /// Terminal status, once [`Cursor::next_row`] has returned `false`.
    pub fn status(&self) -> Option<ResultStatus> {
        self.status
    }

    /// Rows delivered so far.
    pub fn rows_read(&self) -> u64 {
        self.seen
    }

    /// Discards any remaining rows and releases the session.
    pub fn close(mut self) -> Result<()> {
        while self.next_row()? {}
        Ok(())
    }
}

impl<S: Transport> Drop for Cursor<'_, S> {
    fn drop(&mut self) {
        if self.finished || self.session.is_closed() {
            return;
        }
        tracing::debug!(rows_read = self.seen, "draining unfinished cursor");
        loop {
            match self.next_row() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "cursor drain failed");
                    break;
                }
            }
        }
    }
}

impl<S: Transport> std::fmt::Debug for Cursor<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("columns", &self.column_count())
            .field("rows_read", &self.seen)
            .field("status", &self.status)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
