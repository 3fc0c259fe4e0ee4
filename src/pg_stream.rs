use std::io::{BufReader, Read, Write};

use bytes::{BufMut, BytesMut};

use crate::messages::{
    FormatCode, Oid,
    backend::{self, PgFrame},
    frontend::{self, BindParameter, TargetKind, put_cstring},
};

/// Buffered Postgres protocol stream.
///
/// Frontend messages are accumulated in an output buffer by the `put_*`
/// methods and written in one go by [`PgStream::flush_blocking`]. Backend
/// messages are read one frame at a time through a read buffer.
pub struct PgStream<S> {
    stream: BufReader<S>,
    buf: BytesMut,
}

impl<S: Read> PgStream<S> {
    /// Creates a new Postgres stream from an underlying stream.
    pub fn from_stream(stream: S) -> Self {
        PgStream {
            stream: BufReader::new(stream),
            buf: BytesMut::new(),
        }
    }

    /// Reads a backend message frame from the stream.
    pub fn read_frame_blocking(&mut self) -> std::io::Result<PgFrame> {
        backend::read_frame_blocking(&mut self.stream)
    }

    pub(crate) fn reader(&mut self) -> &mut BufReader<S> {
        &mut self.stream
    }
}

impl<S> PgStream<S> {
    /// Consumes the stream and returns the underlying stream and the frontend
    /// bytes that were never flushed.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream.into_inner(), self.buf.to_vec())
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Frontend bytes waiting for the next flush.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Discards frontend bytes that were never flushed.
    pub fn clear_pending(&mut self) {
        self.buf.clear();
    }

    /// Appends pre-framed bytes, such as a startup message, to the buffer.
    pub fn put_raw_bytes(&mut self, src: impl AsRef<[u8]>) -> &mut Self {
        self.buf.put_slice(src.as_ref());
        self
    }

    /// Adds a simple query message to the buffer.
    ///
    /// # Arguments
    ///
    /// * `stmt` - SQL text, possibly several `;`-separated statements
    pub fn put_query(&mut self, stmt: impl AsRef<str>) -> &mut Self {
        frontend::MessageCode::QUERY.frame(&mut self.buf, |b| {
            put_cstring(b, stmt.as_ref().as_bytes());
        });
        self
    }

    /// Adds a Parse message to the buffer for prepared statement creation.
    ///
    /// # Arguments
    ///
    /// * `name` - Name for the prepared statement (empty for unnamed)
    /// * `stmt` - SQL statement text
    /// * `param_types` - Parameter data types (unspecified to infer)
    pub fn put_parse(
        &mut self,
        name: impl AsRef<str>,
        stmt: impl AsRef<str>,
        param_types: impl IntoIterator<Item = Oid>,
    ) -> &mut Self {
        frontend::MessageCode::PARSE.frame(&mut self.buf, |b| {
            put_cstring(b, name.as_ref().as_bytes());
            put_cstring(b, stmt.as_ref().as_bytes());

            let count_at = b.len();
            b.put_u16(0);
            let mut count: u16 = 0;
            for param_type in param_types {
                b.put_u32(param_type.into());
                count += 1;
            }
            b[count_at..count_at + size_of::<u16>()].copy_from_slice(&count.to_be_bytes());
        });
        self
    }

    /// Adds a Describe message to the buffer.
    pub fn put_describe(&mut self, target: &TargetKind) -> &mut Self {
        frontend::MessageCode::DESCRIBE.frame(&mut self.buf, |b| {
            b.put_u8(target.tag());
            put_cstring(b, target.name().as_bytes());
        });
        self
    }

    /// Adds a Bind message to the buffer for binding parameters to a prepared statement.
    ///
    /// # Arguments
    ///
    /// * `portal_name` - Name for the portal (empty for unnamed)
    /// * `stmt_name` - Name of the prepared statement to bind
    /// * `params` - Parameter values with their format codes
    /// * `result_format` - Format requested for every result column
    pub fn put_bind(
        &mut self,
        portal_name: impl AsRef<str>,
        stmt_name: impl AsRef<str>,
        params: &[BindParameter],
        result_format: FormatCode,
    ) -> &mut Self {
        frontend::MessageCode::BIND.frame(&mut self.buf, |b| {
            put_cstring(b, portal_name.as_ref().as_bytes());
            put_cstring(b, stmt_name.as_ref().as_bytes());

            // Format codes can be zero to indicate that there are no parameters
            // or that the parameters all use the default format (text); or one,
            // in which case the specified format code is applied to all
            // parameters; or it can equal the actual number of parameters.
            match params {
                [first, rest @ ..]
                    if rest.iter().all(|p| p.format_code() == first.format_code()) =>
                {
                    if first.format_code() == FormatCode::Text {
                        b.put_u16(0);
                    } else {
                        b.put_u16(1);
                        b.put_u16(first.format_code().into());
                    }
                }
                _ => {
                    b.put_u16(params.len() as u16);
                    for param in params {
                        b.put_u16(param.format_code().into());
                    }
                }
            };

            b.put_u16(params.len() as u16);
            for param in params {
                param.encode(b);
            }

            // Same rule as above for the result columns.
            match result_format {
                FormatCode::Text => b.put_u16(0),
                FormatCode::Binary => {
                    b.put_u16(1);
                    b.put_u16(FormatCode::Binary.into());
                }
            }
        });
        self
    }

    /// Adds an Execute message to the buffer for executing a bound portal.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the portal to execute
    /// * `max_rows` - Maximum number of rows to return (None or 0 for unlimited)
    pub fn put_execute(
        &mut self,
        name: impl AsRef<str>,
        max_rows: impl Into<Option<u32>>,
    ) -> &mut Self {
        frontend::MessageCode::EXECUTE.frame(&mut self.buf, |b| {
            put_cstring(b, name.as_ref().as_bytes());
            b.put_u32(max_rows.into().unwrap_or_default());
        });
        self
    }

    /// Adds a Close message to the buffer.
    pub fn put_close(&mut self, target: &TargetKind) -> &mut Self {
        frontend::MessageCode::CLOSE.frame(&mut self.buf, |b| {
            b.put_u8(target.tag());
            put_cstring(b, target.name().as_bytes());
        });
        self
    }

    /// Adds a Flush message to the buffer to force sending buffered messages.
    pub fn put_flush(&mut self) -> &mut Self {
        frontend::MessageCode::FLUSH.frame(&mut self.buf, |_| {});
        self
    }

    /// Adds a Sync message to the buffer to end an extended query protocol sequence.
    pub fn put_sync(&mut self) -> &mut Self {
        frontend::MessageCode::SYNC.frame(&mut self.buf, |_| {});
        self
    }

    /// Adds a CopyData message carrying raw COPY payload.
    pub fn put_copy_data(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        frontend::MessageCode::COPY_DATA.frame(&mut self.buf, |b| {
            b.put_slice(data.as_ref());
        });
        self
    }

    /// Adds a CopyDone message, ending a successful COPY FROM STDIN.
    pub fn put_copy_done(&mut self) -> &mut Self {
        frontend::MessageCode::COPY_DONE.frame(&mut self.buf, |_| {});
        self
    }

    /// Adds a CopyFail message, making the server abort the COPY with `reason`.
    pub fn put_copy_fail(&mut self, reason: impl AsRef<str>) -> &mut Self {
        frontend::MessageCode::COPY_FAIL.frame(&mut self.buf, |b| {
            put_cstring(b, reason.as_ref().as_bytes());
        });
        self
    }

    /// Adds a Terminate message, the polite way to end a session.
    pub fn put_terminate(&mut self) -> &mut Self {
        frontend::MessageCode::TERMINATE.frame(&mut self.buf, |_| {});
        self
    }
}

impl<S: Write> PgStream<S> {
    /// Writes all buffered frontend messages to the stream.
    pub fn flush_blocking(&mut self) -> std::io::Result<()> {
        let stream = self.stream.get_mut();
        let res = stream.write_all(&self.buf).and_then(|_| stream.flush());
        self.buf.clear();
        res
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BufMut, BytesMut};

    use super::PgStream;
    use crate::messages::{
        FormatCode, Oid,
        backend::MessageCode,
        frontend::{BindParameter, TargetKind},
    };

    /// Helper macro for asserting a slice or string from the buffer.
    /// Usage: `assert_buf_eq!(pg_stream, b"STMT\0");`
    macro_rules! assert_buf_eq {
        ($pg_stream:expr, $expected:expr) => {{
            let len = $expected.len();
            let got = $pg_stream.buf.copy_to_bytes(len);
            assert_eq!(&$expected[..], &got[..]);
        }};
    }

    fn new_stream() -> PgStream<&'static [u8]> {
        PgStream::from_stream(&[][..])
    }

    #[test]
    fn test_put_query() {
        let mut pg_stream = new_stream();
        pg_stream.put_query("SELECT 1");

        assert_eq!(b'Q', pg_stream.buf.get_u8());
        assert_eq!(13, pg_stream.buf.get_u32());
        assert_buf_eq!(pg_stream, b"SELECT 1\0");
    }

    #[test]
    fn test_put_parse() {
        let mut pg_stream = new_stream();
        pg_stream.put_parse("STMT", "SELECT $1", [Oid::INT4]);

        assert_eq!(b'P', pg_stream.buf.get_u8());
        assert_eq!(25, pg_stream.buf.get_u32());
        assert_buf_eq!(pg_stream, b"STMT\0");
        assert_buf_eq!(pg_stream, b"SELECT $1\0");
        assert_eq!(1, pg_stream.buf.get_u16());
        assert_eq!(23, pg_stream.buf.get_u32());
        assert!(pg_stream.buf.is_empty());
    }

    #[test]
    fn test_put_describe_portal() {
        let mut pg_stream = new_stream();
        pg_stream.put_describe(&TargetKind::new_portal("PORTAL"));

        let mut expected = BytesMut::new();
        expected.put_u8(b'D');
        expected.put_u32(12);
        expected.put_u8(b'P');
        expected.put(&b"PORTAL\0"[..]);

        assert_eq!(&pg_stream.buf, &expected);
    }

    #[test]
    fn test_put_close_stmt() {
        let mut pg_stream = new_stream();
        pg_stream.put_close(&TargetKind::new_stmt("STMT"));

        let mut expected = BytesMut::new();
        expected.put_u8(b'C');
        expected.put_u32(10);
        expected.put_u8(b'S');
        expected.put(&b"STMT\0"[..]);

        assert_eq!(&pg_stream.buf, &expected);
    }

    #[test]
    fn test_put_bind_mixed_formats() {
        let mut pg_stream = new_stream();
        pg_stream.put_bind(
            "",
            "",
            &[BindParameter::Bool(false), BindParameter::Text("x".into())],
            FormatCode::Binary,
        );

        let mut expected = BytesMut::new();
        expected.put_u8(b'B');
        expected.put_u32(28);
        expected.put(&b"\0\0"[..]);

        expected.put_u16(2);
        expected.put_u16(1);
        expected.put_u16(0);

        expected.put_u16(2);
        expected.put_u32(1);
        expected.put_u8(0);
        expected.put_u32(1);
        expected.put_u8(b'x');

        expected.put_u16(1);
        expected.put_u16(1);

        assert_eq!(&pg_stream.buf, &expected);
    }

    #[test]
    fn test_put_bind_uniform_text() {
        let mut pg_stream = new_stream();
        pg_stream.put_bind("", "", &[BindParameter::Null], FormatCode::Text);

        let mut expected = BytesMut::new();
        expected.put_u8(b'B');
        expected.put_u32(16);
        expected.put(&b"\0\0"[..]);
        expected.put_u16(0);
        expected.put_u16(1);
        expected.put_i32(-1);
        expected.put_u16(0);

        assert_eq!(&pg_stream.buf, &expected);
    }

    #[test]
    fn test_put_execute() {
        let mut pg_stream = new_stream();
        pg_stream.put_execute("PORTAL", None);

        let mut expected = BytesMut::new();
        expected.put_u8(b'E');
        expected.put_u32(15);
        expected.put(&b"PORTAL\0"[..]);
        expected.put_u32(0);

        assert_eq!(&pg_stream.buf, &expected);
    }

    #[test]
    fn test_put_copy_messages() {
        let mut pg_stream = new_stream();
        pg_stream
            .put_copy_data("1\n2\n")
            .put_copy_done()
            .put_copy_fail("no");

        let mut expected = BytesMut::new();
        expected.put_u8(b'd');
        expected.put_u32(8);
        expected.put(&b"1\n2\n"[..]);
        expected.put_u8(b'c');
        expected.put_u32(4);
        expected.put_u8(b'f');
        expected.put_u32(7);
        expected.put(&b"no\0"[..]);

        assert_eq!(&pg_stream.buf, &expected);
    }

    #[test]
    fn test_put_sync_and_terminate() {
        let mut pg_stream = new_stream();
        pg_stream.put_sync().put_terminate();
        assert_eq!(pg_stream.pending(), &[b'S', 0, 0, 0, 4, b'X', 0, 0, 0, 4]);
    }

    #[test]
    fn test_flush_blocking() {
        let mut out = Vec::<u8>::new();
        {
            let mut pg_stream = PgStream::from_stream(std::io::Cursor::new(&mut out));
            pg_stream.put_sync();
            pg_stream.flush_blocking().unwrap();
            assert!(pg_stream.pending().is_empty());
        }

        assert_eq!(out, [b'S', 0, 0, 0, 4]);
    }

    #[test]
    fn test_read_frame_blocking() {
        let stream = vec![b'Z', 0, 0, 0, 5, b'I', b'1', 0, 0, 0, 4];
        let mut pg_stream = PgStream::from_stream(stream.as_slice());

        let frame = pg_stream.read_frame_blocking().unwrap();
        assert_eq!(frame.code, MessageCode::READY_FOR_QUERY);
        assert_eq!(frame.body.as_ref(), &[b'I']);

        let frame = pg_stream.read_frame_blocking().unwrap();
        assert_eq!(frame.code, MessageCode::PARSE_COMPLETE);
        assert!(frame.body.is_empty());
    }
}
