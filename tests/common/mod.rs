#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io::{self, Read, Write},
    rc::Rc,
    time::Duration,
};

use bytes::{BufMut, BytesMut};
use pg_session::{FormatCode, Oid, PgStream, Session, StartupResponse, Transport};

/// What the client did to the transport, readable after the session has
/// taken ownership of it.
#[derive(Clone, Default)]
pub struct Wire {
    sent: Rc<RefCell<Vec<u8>>>,
    shut: Rc<Cell<bool>>,
    timeout: Rc<Cell<Option<Duration>>>,
}

impl Wire {
    pub fn sent(&self) -> Vec<u8> {
        self.sent.borrow().clone()
    }

    /// Message codes of every frontend message sent, in order.
    pub fn codes(&self) -> String {
        frames(&self.sent()).iter().map(|(code, _)| *code as char).collect()
    }

    pub fn frames(&self) -> Vec<(u8, Vec<u8>)> {
        frames(&self.sent())
    }

    pub fn clear(&self) {
        self.sent.borrow_mut().clear();
    }

    pub fn is_shut(&self) -> bool {
        self.shut.get()
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.timeout.get()
    }
}

/// Replays canned backend bytes and records everything written.
///
/// Once the script runs out, reads either hit end-of-file or, for a
/// stalled server, fail the way a socket read timeout does.
pub struct Scripted {
    input: VecDeque<u8>,
    stall: bool,
    wire: Wire,
}

impl Scripted {
    pub fn new(input: Vec<u8>) -> (Self, Wire) {
        let wire = Wire::default();
        let stream = Scripted {
            input: input.into(),
            stall: false,
            wire: wire.clone(),
        };
        (stream, wire)
    }

    pub fn stalled(input: Vec<u8>) -> (Self, Wire) {
        let (mut stream, wire) = Self::new(input);
        stream.stall = true;
        (stream, wire)
    }
}

impl Read for Scripted {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() && self.stall {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "read timed out"));
        }
        self.input.read(buf)
    }
}

impl Write for Scripted {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.wire.shut.get() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.wire.sent.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for Scripted {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.wire.timeout.set(timeout);
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        self.wire.shut.set(true);
        Ok(())
    }
}

/// A session past startup, talking to `server`.
pub fn session(server: Backend) -> (Session<Scripted>, Wire) {
    let (stream, wire) = Scripted::new(server.build());
    let startup = StartupResponse {
        process_id: 4242,
        secret_key: 99,
        ..StartupResponse::default()
    };
    (Session::from_parts(PgStream::from_stream(stream), startup), wire)
}

pub fn stalled_session(server: Backend) -> (Session<Scripted>, Wire) {
    let (stream, wire) = Scripted::stalled(server.build());
    (
        Session::from_parts(PgStream::from_stream(stream), StartupResponse::default()),
        wire,
    )
}

/// Splits frontend bytes into `(code, body)` pairs.
pub fn frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    while bytes.len() >= 5 {
        let code = bytes[0];
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        out.push((code, bytes[5..1 + len].to_vec()));
        bytes = &bytes[1 + len..];
    }
    out
}

/// Builds the byte stream a server would send.
#[derive(Default)]
pub struct Backend {
    buf: BytesMut,
}

impl Backend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    fn frame(mut self, code: u8, body: impl FnOnce(&mut BytesMut)) -> Self {
        let mut payload = BytesMut::new();
        body(&mut payload);
        self.buf.put_u8(code);
        self.buf.put_u32(payload.len() as u32 + 4);
        self.buf.put(payload);
        self
    }

    pub fn auth_ok(self) -> Self {
        self.frame(b'R', |b| b.put_u32(0))
    }

    pub fn parameter_status(self, name: &str, value: &str) -> Self {
        self.frame(b'S', |b| {
            put_cstr(b, name);
            put_cstr(b, value);
        })
    }

    pub fn backend_key_data(self, process_id: u32, secret_key: u32) -> Self {
        self.frame(b'K', |b| {
            b.put_u32(process_id);
            b.put_u32(secret_key);
        })
    }

    pub fn parse_complete(self) -> Self {
        self.frame(b'1', |_| {})
    }

    pub fn bind_complete(self) -> Self {
        self.frame(b'2', |_| {})
    }

    pub fn no_data(self) -> Self {
        self.frame(b'n', |_| {})
    }

    pub fn row_description(self, cols: &[(&str, Oid, FormatCode)]) -> Self {
        self.frame(b'T', |b| {
            b.put_u16(cols.len() as u16);
            for (name, oid, format) in cols {
                put_cstr(b, name);
                b.put_u32(0);
                b.put_u16(0);
                b.put_u32(u32::from(*oid));
                b.put_i16(type_size(*oid));
                b.put_i32(-1);
                b.put_u16(*format as u16);
            }
        })
    }

    pub fn data_row(self, cells: &[Option<&[u8]>]) -> Self {
        self.frame(b'D', |b| {
            b.put_u16(cells.len() as u16);
            for cell in cells {
                match cell {
                    Some(v) => {
                        b.put_i32(v.len() as i32);
                        b.put_slice(v);
                    }
                    None => b.put_i32(-1),
                }
            }
        })
    }

    /// One text-format row.
    pub fn text_row(self, cells: &[&str]) -> Self {
        let cells: Vec<Option<&[u8]>> = cells.iter().map(|c| Some(c.as_bytes())).collect();
        self.data_row(&cells)
    }

    pub fn command_complete(self, tag: &str) -> Self {
        self.frame(b'C', |b| put_cstr(b, tag))
    }

    pub fn empty_query(self) -> Self {
        self.frame(b'I', |_| {})
    }

    pub fn error(self, code: &str, message: &str) -> Self {
        self.frame(b'E', |b| fields(b, "ERROR", code, message))
    }

    pub fn notice(self, message: &str) -> Self {
        self.frame(b'N', |b| fields(b, "NOTICE", "00000", message))
    }

    pub fn notification(self, process_id: u32, channel: &str, payload: &str) -> Self {
        self.frame(b'A', |b| {
            b.put_u32(process_id);
            put_cstr(b, channel);
            put_cstr(b, payload);
        })
    }

    pub fn copy_in_response(self, columns: u16) -> Self {
        self.frame(b'G', |b| {
            b.put_u8(0);
            b.put_u16(columns);
            for _ in 0..columns {
                b.put_u16(0);
            }
        })
    }

    pub fn copy_out_response(self, columns: u16) -> Self {
        self.frame(b'H', |b| {
            b.put_u8(0);
            b.put_u16(columns);
            for _ in 0..columns {
                b.put_u16(0);
            }
        })
    }

    pub fn copy_data(self, data: &[u8]) -> Self {
        self.frame(b'd', |b| b.put_slice(data))
    }

    pub fn copy_done(self) -> Self {
        self.frame(b'c', |_| {})
    }

    pub fn portal_suspended(self) -> Self {
        self.frame(b's', |_| {})
    }

    pub fn ready(self) -> Self {
        self.ready_with(b'I')
    }

    pub fn ready_with(self, status: u8) -> Self {
        self.frame(b'Z', |b| b.put_u8(status))
    }

    /// The frames an extended-protocol command gets before its rows.
    pub fn extended_header(self, cols: &[(&str, Oid, FormatCode)]) -> Self {
        self.parse_complete().bind_complete().row_description(cols)
    }

    /// A full successful response to a row-less extended command.
    pub fn extended_command(self, tag: &str) -> Self {
        self.parse_complete()
            .bind_complete()
            .no_data()
            .command_complete(tag)
            .ready()
    }

    /// Startup reply for trust authentication.
    pub fn startup(self) -> Self {
        self.auth_ok()
            .parameter_status("server_version", "16.2")
            .parameter_status("client_encoding", "UTF8")
            .backend_key_data(4242, 99)
            .ready()
    }
}

fn put_cstr(b: &mut BytesMut, s: &str) {
    b.put_slice(s.as_bytes());
    b.put_u8(0);
}

fn fields(b: &mut BytesMut, severity: &str, code: &str, message: &str) {
    for (tag, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        b.put_u8(tag);
        put_cstr(b, value);
    }
    b.put_u8(0);
}

fn type_size(oid: Oid) -> i16 {
    match oid {
        Oid::BOOL => 1,
        Oid::INT2 => 2,
        Oid::INT4 | Oid::FLOAT4 | Oid::OID => 4,
        Oid::INT8 | Oid::FLOAT8 => 8,
        _ => -1,
    }
}
