use crate::{
    ConnectionError, Error, Result,
    connect::Transport,
    session::{Drain, Session, SessionState},
};

/// CopyData is buffered and written once this much is pending.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Feeds a running `COPY ... FROM STDIN`.
///
/// The channel holds the session until [`CopyChannel::end_copy`] or
/// [`CopyChannel::abort`]. Dropping it unfinished aborts the COPY.
pub struct CopyChannel<'a, S: Transport> {
    session: &'a mut Session<S>,
    bytes_sent: u64,
    finished: bool,
}

impl<'a, S: Transport> CopyChannel<'a, S> {
    pub(crate) fn new(session: &'a mut Session<S>) -> Self {
        CopyChannel {
            session,
            bytes_sent: 0,
            finished: false,
        }
    }

    /// Streams raw COPY payload, in whatever format the COPY statement
    /// declared. Record boundaries need not line up with calls.
    pub fn write_copy_data(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        self.ensure_copying()?;
        let data = data.as_ref();
        let stream = self.session.stream()?;
        stream.put_copy_data(data);
        let flush = stream.pending().len() >= FLUSH_THRESHOLD;
        self.bytes_sent += data.len() as u64;

        if flush {
            self.flush_pending()?;
        }
        Ok(())
    }

    /// Payload bytes accepted so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Ends the COPY and returns the number of rows the server stored.
    pub fn end_copy(mut self) -> Result<u64> {
        self.ensure_copying()?;
        self.finished = true;

        self.session.stream()?.put_copy_done();
        self.session.send()?;

        let out = self.session.drain(Drain::Simple)?;
        let mut out = self.session.check(out, "CommandOk")?;
        let status = self.session.expect_command_ok(&mut out)?;
        let rows = status.rows().unwrap_or_default();
        tracing::debug!(rows, bytes = self.bytes_sent, "copy complete");
        Ok(rows)
    }

    /// Makes the server abandon the COPY with `reason`. Nothing written
    /// through this channel is kept.
    pub fn abort(mut self, reason: &str) -> Result<()> {
        self.abort_copy(reason)
    }

    fn abort_copy(&mut self, reason: &str) -> Result<()> {
        self.ensure_copying()?;
        self.finished = true;

        let stream = self.session.stream()?;
        stream.clear_pending();
        stream.put_copy_fail(reason);
        self.session.send()?;

        // The server answers CopyFail with an error, which is the expected
        // outcome here.
        let out = self.session.drain(Drain::Simple)?;
        if let Some(e) = out.error {
            tracing::debug!(error = %e, "copy aborted");
        }
        Ok(())
    }

    /// Writes buffered CopyData. A failed write fails the COPY and closes
    /// the session.
    fn flush_pending(&mut self) -> Result<()> {
        let res = self.session.stream()?.flush_blocking();
        res.map_err(|e| {
            self.finished = true;
            self.session.fatal(ConnectionError::Io(e).into())
        })
    }

    fn ensure_copying(&mut self) -> Result<()> {
        match self.session.state() {
            SessionState::Copying if !self.finished => Ok(()),
            SessionState::Closed => {
                self.finished = true;
                Err(self.session.record(ConnectionError::Closed.into()))
            }
            other => Err(self.session.record(crate::Misuse::Busy(other).into())),
        }
    }
}

impl<S: Transport> Drop for CopyChannel<'_, S> {
    fn drop(&mut self) {
        if self.finished || self.session.is_closed() {
            return;
        }
        tracing::debug!(bytes = self.bytes_sent, "aborting unfinished copy");
        if let Err(e) = self.abort_copy("copy channel dropped before end_copy") {
            tracing::debug!(error = %e, "copy abort failed");
        }
    }
}

impl<S: Transport> std::fmt::Debug for CopyChannel<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyChannel")
            .field("bytes_sent", &self.bytes_sent)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<S: Transport> std::io::Write for CopyChannel<'_, S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_copy_data(buf).map_err(into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.ensure_copying().map_err(into_io)?;
        self.flush_pending().map_err(into_io)
    }
}

fn into_io(err: Error) -> std::io::Error {
    match err {
        Error::Connection(ConnectionError::Io(e)) => e,
        other => std::io::Error::other(other),
    }
}
