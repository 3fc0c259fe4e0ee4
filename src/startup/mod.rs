//! Blocking connection startup: protocol negotiation, authentication and
//! the server's initial parameter report.

use std::{
    collections::HashMap,
    io::{Read, Write},
};

use bytes::{BufMut, Bytes, BytesMut};
use scram::ScramClient;

use crate::{
    PgStream,
    messages::{
        backend::{self, MessageCode},
        frontend::{self, put_cstring},
    },
    startup::auth::{AuthMessage, md5_password, read_auth_message},
};

mod auth;
mod error;

pub use error::*;

/// Authentication mode for a Postgres connection.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// Trust authentication (no password required).
    Trust,
    /// Password authentication with the provided password. Answers
    /// cleartext, MD5 and SCRAM-SHA-256 challenges.
    Password(String),
}

impl std::fmt::Debug for AuthenticationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthenticationMode::Trust => write!(f, "Trust"),
            AuthenticationMode::Password(_) => write!(f, "Password(..)"),
        }
    }
}

const CURRENT_VERSION: ProtocolVersion = ProtocolVersion::new(3, 0);

/// Postgres protocol version number.
///
/// The version is encoded as a 32-bit integer where the upper 16 bits represent
/// the major version and the lower 16 bits represent the minor version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProtocolVersion(u32);

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self(((major as u32) << 16) | (minor as u32))
    }

    pub fn major(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl From<u32> for ProtocolVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ProtocolVersion> for u32 {
    fn from(value: ProtocolVersion) -> Self {
        value.0
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Response data from a successful Postgres startup handshake.
#[derive(Debug, Clone, Default)]
pub struct StartupResponse {
    /// Backend process ID for this connection.
    pub process_id: u32,
    /// Secret key for canceling queries on this connection.
    pub secret_key: u32,
    /// Server parameters returned during startup (e.g., server_version, client_encoding).
    pub parameters: HashMap<String, String>,
}

/// Builder for configuring and establishing Postgres connections.
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    auth: AuthenticationMode,
    protocol: ProtocolVersion,
    options: HashMap<String, String>,
}

impl ConnectionBuilder {
    /// Creates a new connection builder with the specified user.
    ///
    /// Defaults to trust authentication and protocol version 3.0.
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();

        let mut options = HashMap::new();
        options.insert("application_name".into(), "pg_session".into());
        options.insert("database".into(), user.clone());
        options.insert("user".into(), user);

        Self {
            auth: AuthenticationMode::Trust,
            protocol: CURRENT_VERSION,
            options,
        }
    }

    /// Sets the database name to connect to.
    ///
    /// If not specified, defaults to the username.
    pub fn database(self, db: impl Into<String>) -> Self {
        self.add_option("database", db.into())
    }

    /// Sets the username for authentication.
    pub fn user(self, user: impl Into<String>) -> Self {
        self.add_option("user", user.into())
    }

    /// Sets the authentication mode.
    pub fn auth(mut self, auth: AuthenticationMode) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the application name.
    pub fn application_name(self, app: impl Into<String>) -> Self {
        self.add_option("application_name", app.into())
    }

    /// Sets the Postgres protocol version.
    pub fn protocol(mut self, protocol: impl Into<ProtocolVersion>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Adds a startup parameter option.
    pub fn add_option(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.options.insert(key.into(), val.into());
        self
    }

    /// A startup option, such as `user` or `database`.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    fn get_user(&self) -> &str {
        self.option("user").unwrap_or_default()
    }

    fn as_startup_message(&self) -> Bytes {
        let mut buf = BytesMut::new();
        frontend::frame(&mut buf, |buf| {
            buf.put_u32(self.protocol.into());

            // Sorted so the message is stable across runs.
            let mut options: Vec<_> = self.options.iter().collect();
            options.sort();
            for (key, val) in options {
                put_cstring(buf, key.as_bytes());
                put_cstring(buf, val.as_bytes());
            }

            buf.put_u8(0);
        });

        buf.freeze()
    }

    /// Establishes a Postgres connection with TLS upgrade.
    ///
    /// Sends an SSL request to the server and upgrades the connection using the
    /// provided upgrade function if the server supports TLS.
    pub fn connect_with_tls<S, T, F>(
        &self,
        mut stream: S,
        upgrade_fn: F,
    ) -> Result<(PgStream<T>, StartupResponse)>
    where
        S: Read + Write,
        T: Read + Write,
        F: FnOnce(S) -> std::io::Result<T>,
    {
        stream.write_all(frontend::SSL_REQUEST)?;
        stream.flush()?;

        // Read unbuffered: nothing past this byte may be consumed before the
        // TLS handshake.
        let mut buf = [0; 1];
        stream.read_exact(&mut buf)?;
        let res = u8::from_be_bytes(buf);

        const SSL_SUCCESS: u8 = b'S';
        const SSL_FAILURE: u8 = b'N';

        let stream = match res {
            SSL_SUCCESS => upgrade_fn(stream)?,
            SSL_FAILURE => Err(Error::TlsUnsupported)?,
            _ => Err(format!("unexpected SSL response code '{res}'"))?,
        };

        self.connect(stream)
    }

    /// Establishes a Postgres connection over the provided stream.
    ///
    /// Performs the startup handshake, handles authentication, and waits for
    /// the server to be ready for queries.
    pub fn connect<S>(&self, stream: S) -> Result<(PgStream<S>, StartupResponse)>
    where
        S: Read + Write,
    {
        let mut stream = PgStream::from_stream(stream);
        self.startup(&mut stream)?;

        let mut startup_res = StartupResponse::default();

        loop {
            let mut frame = stream.read_frame_blocking()?;
            match frame.code {
                MessageCode::PARAMETER_STATUS => {
                    let key = backend::read_cstring(&mut frame.body)?;
                    let val = backend::read_cstring(&mut frame.body)?;
                    startup_res.parameters.insert(key, val);
                }
                MessageCode::BACKEND_KEY_DATA => {
                    startup_res.process_id = backend::read_u32(&mut frame.body)?;
                    startup_res.secret_key = backend::read_u32(&mut frame.body)?;
                }
                MessageCode::NOTICE_RESPONSE => {
                    let notice = crate::PgErrorResponse::new(frame.body);
                    tracing::info!(%notice, "server notice during startup");
                }
                MessageCode::ERROR_RESPONSE => {
                    return Err(Error::Server(crate::PgErrorResponse::new(frame.body)));
                }
                MessageCode::READY_FOR_QUERY => break,
                code => Err(format!("unexpected message code {code}"))?,
            }
        }

        tracing::debug!(
            process_id = startup_res.process_id,
            server_version = startup_res.parameters.get("server_version").map(String::as_str),
            "startup complete"
        );

        Ok((stream, startup_res))
    }

    fn startup<S>(&self, stream: &mut PgStream<S>) -> Result<()>
    where
        S: Read + Write,
    {
        stream.put_raw_bytes(self.as_startup_message());
        stream.flush_blocking()?;

        match read_auth_message(stream.reader())? {
            AuthMessage::Ok => Ok(()),
            AuthMessage::CleartextPassword => {
                let pw = self.password()?;
                self.send_password(stream, pw)?;
                expect_auth_ok(stream)
            }
            AuthMessage::Md5Password(salt) => {
                let pw = self.password()?;
                self.send_password(stream, &md5_password(self.get_user(), pw, salt))?;
                expect_auth_ok(stream)
            }
            AuthMessage::Sasl(mech) => {
                let pw = self.password()?;

                let scram = ScramClient::new(self.get_user(), pw, None);
                let (scram, client_first) = scram.client_first();

                let mut msg = BytesMut::new();
                frontend::MessageCode::SASL_RESPONSE.frame(&mut msg, |buf| {
                    put_cstring(buf, mech.to_string().as_bytes());
                    buf.put_u32(client_first.len() as u32);
                    buf.put_slice(client_first.as_bytes());
                });
                stream.put_raw_bytes(msg);
                stream.flush_blocking()?;

                let res = read_auth_message(stream.reader())?;
                let AuthMessage::SaslContinue(server_first) = res else {
                    return Err(format!("unexpected authentication response {res}"))?;
                };

                let scram = scram
                    .handle_server_first(&server_first)
                    .map_err(|e| format!("scram handshake failed: {e}"))?;
                let (scram, client_final) = scram.client_final();

                let mut msg = BytesMut::new();
                frontend::MessageCode::SASL_RESPONSE.frame(&mut msg, |buf| {
                    buf.put_slice(client_final.as_bytes());
                });
                stream.put_raw_bytes(msg);
                stream.flush_blocking()?;

                let res = read_auth_message(stream.reader())?;
                let AuthMessage::SaslFinal(server_final) = res else {
                    return Err(format!("unexpected authentication response {res}"))?;
                };

                scram
                    .handle_server_final(&server_final)
                    .map_err(|e| format!("scram handshake failed: {e}"))?;

                expect_auth_ok(stream)
            }
            other => Err(Error::UnsupportedAuth(other.to_string())),
        }
    }

    fn password(&self) -> Result<&str> {
        match &self.auth {
            AuthenticationMode::Password(pw) => Ok(pw),
            AuthenticationMode::Trust => Err(Error::PasswordRequired),
        }
    }

    fn send_password<S: Write>(&self, stream: &mut PgStream<S>, pw: &str) -> Result<()> {
        let mut msg = BytesMut::new();
        frontend::MessageCode::PASSWORD_MESSAGE.frame(&mut msg, |buf| {
            put_cstring(buf, pw.as_bytes());
        });
        stream.put_raw_bytes(msg);
        Ok(stream.flush_blocking()?)
    }
}

fn expect_auth_ok<S: Read>(stream: &mut PgStream<S>) -> Result<()> {
    match read_auth_message(stream.reader())? {
        AuthMessage::Ok => Ok(()),
        code => Err(format!("unexpected authentication code {code}"))?,
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BufMut, BytesMut};

    use super::*;

    /// Replays canned server bytes and records what the client wrote.
    struct Scripted {
        input: std::io::Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn frame(code: u8, body: &[u8]) -> Vec<u8> {
        let mut b = BytesMut::new();
        b.put_u8(code);
        b.put_u32(4 + body.len() as u32);
        b.put_slice(body);
        b.to_vec()
    }

    fn server(frames: &[Vec<u8>]) -> Scripted {
        Scripted {
            input: std::io::Cursor::new(frames.concat()),
            output: Vec::new(),
        }
    }

    fn ready_sequence() -> Vec<Vec<u8>> {
        vec![
            frame(b'S', b"server_version\x0016.2\x00"),
            frame(b'K', &[0, 0, 0, 42, 0, 0, 0, 7]),
            frame(b'Z', b"I"),
        ]
    }

    #[test]
    fn test_protocol_version() {
        let major = 3;
        let minor = 0;
        let version = ProtocolVersion::new(major, minor);
        assert_eq!(major, version.major());
        assert_eq!(minor, version.minor());
        assert_eq!(196608, version.0);
        assert_eq!(version.to_string(), "3.0");
    }

    #[test]
    fn test_startup_message_layout() {
        let msg = ConnectionBuilder::new("alice").database("shop").as_startup_message();
        let mut body = &msg[..];
        assert_eq!(body.get_u32() as usize, msg.len());
        assert_eq!(body.get_u32(), 196608);
        assert_eq!(
            body,
            &b"application_name\0pg_session\0database\0shop\0user\0alice\0\0"[..]
        );
    }

    #[test]
    fn test_trust_connect() {
        let mut frames = vec![frame(b'R', &[0, 0, 0, 0])];
        frames.extend(ready_sequence());

        let (stream, res) = ConnectionBuilder::new("alice")
            .connect(server(&frames))
            .unwrap();
        assert_eq!(res.process_id, 42);
        assert_eq!(res.secret_key, 7);
        assert_eq!(res.parameters["server_version"], "16.2");
        assert_eq!(stream.get_ref().output[4..8], 196608u32.to_be_bytes());
    }

    #[test]
    fn test_md5_connect_sends_hashed_password() {
        let mut frames = vec![
            frame(b'R', &[0, 0, 0, 5, 1, 2, 3, 4]),
            frame(b'R', &[0, 0, 0, 0]),
        ];
        frames.extend(ready_sequence());

        let (stream, _) = ConnectionBuilder::new("alice")
            .auth(AuthenticationMode::Password("secret".into()))
            .connect(server(&frames))
            .unwrap();

        let written = &stream.get_ref().output;
        let startup_len = u32::from_be_bytes(written[..4].try_into().unwrap()) as usize;
        let password_msg = &written[startup_len..];
        assert_eq!(password_msg[0], b'p');
        assert_eq!(&password_msg[5..], b"md598a0412b9c31436fc53776e863350083\0");
    }

    #[test]
    fn test_password_required() {
        let frames = vec![frame(b'R', &[0, 0, 0, 3])];
        let err = ConnectionBuilder::new("alice")
            .connect(server(&frames))
            .err()
            .unwrap();
        assert!(matches!(err, Error::PasswordRequired));
    }

    #[test]
    fn test_unsupported_auth() {
        let frames = vec![frame(b'R', &[0, 0, 0, 7])];
        let err = ConnectionBuilder::new("alice")
            .connect(server(&frames))
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedAuth(_)));
    }

    #[test]
    fn test_tls_refused() {
        let err = ConnectionBuilder::new("alice")
            .connect_with_tls(server(&[b"N".to_vec()]), Ok::<Scripted, std::io::Error>)
            .err()
            .unwrap();
        assert!(matches!(err, Error::TlsUnsupported));
    }

    #[test]
    fn test_tls_upgrade_then_startup() {
        let mut frames = vec![b"S".to_vec(), frame(b'R', &[0, 0, 0, 0])];
        frames.extend(ready_sequence());

        let (stream, _) = ConnectionBuilder::new("alice")
            .connect_with_tls(server(&frames), Ok::<Scripted, std::io::Error>)
            .unwrap();
        assert_eq!(&stream.get_ref().output[..8], frontend::SSL_REQUEST);
    }
}
