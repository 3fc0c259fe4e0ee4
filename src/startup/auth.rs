use std::io::Read;

use crate::{
    PgErrorResponse,
    messages::backend::{self, MessageCode},
    startup,
};

pub(crate) enum AuthMessage {
    Ok,
    KerberosV5,
    CleartextPassword,
    Md5Password([u8; 4]),
    Gss,
    GssContinue,
    Sspi,
    Sasl(AuthMechanism),
    SaslContinue(String),
    SaslFinal(String),
}

impl std::fmt::Display for AuthMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMessage::Ok => write!(f, "AuthenticationOk"),
            AuthMessage::KerberosV5 => write!(f, "AuthenticationKerberosV5"),
            AuthMessage::CleartextPassword => write!(f, "AuthenticationCleartextPassword"),
            AuthMessage::Md5Password(_) => write!(f, "AuthenticationMD5Password"),
            AuthMessage::Gss => write!(f, "AuthenticationGSS"),
            AuthMessage::GssContinue => write!(f, "AuthenticationGSSContinue"),
            AuthMessage::Sspi => write!(f, "AuthenticationSSPI"),
            AuthMessage::Sasl(mech) => write!(f, "AuthenticationSASL({mech})"),
            AuthMessage::SaslContinue(_) => write!(f, "AuthenticationSASLContinue"),
            AuthMessage::SaslFinal(_) => write!(f, "AuthenticationSASLFinal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthMechanism {
    ScramSha256,
}

impl std::fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScramSha256 => write!(f, "SCRAM-SHA-256"),
        }
    }
}

impl TryFrom<&str> for AuthMechanism {
    type Error = startup::Error;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "SCRAM-SHA-256" => Ok(AuthMechanism::ScramSha256),
            _ => Err(startup::Error::UnsupportedAuth(value.to_string())),
        }
    }
}

/// Computes the response to an MD5 password challenge:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub(crate) fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = md5::compute([password.as_bytes(), user.as_bytes()].concat());
    let outer = md5::compute([format!("{inner:x}").as_bytes(), &salt[..]].concat());
    format!("md5{outer:x}")
}

pub(crate) fn read_auth_message(stream: &mut impl Read) -> startup::Result<AuthMessage> {
    let frame = backend::read_frame_blocking(stream)?;

    match frame.code {
        MessageCode::ERROR_RESPONSE => Err(startup::Error::Server(PgErrorResponse::new(frame.body))),
        MessageCode::NEGOTIATE_PROTOCOL_VERSION => {
            let mut body = frame.body;
            let newest = backend::read_u32(&mut body)?;
            Err(startup::Error::ProtocolUnsupported {
                requested: "3.x".into(),
                supported: format!("{}.{}", newest >> 16, newest & 0xFFFF),
            })
        }
        MessageCode::AUTHENTICATION => {
            let mut body = frame.body;
            let auth_code = backend::read_u32(&mut body)?;
            let msg = match auth_code {
                0 => AuthMessage::Ok,
                2 => AuthMessage::KerberosV5,
                3 => AuthMessage::CleartextPassword,
                5 => {
                    let salt = body[..]
                        .try_into()
                        .map_err(|_| "unexpected body length in md5 password challenge")?;
                    AuthMessage::Md5Password(salt)
                }
                7 => AuthMessage::Gss,
                8 => AuthMessage::GssContinue,
                9 => AuthMessage::Sspi,
                10 => {
                    let offered: Vec<_> = body
                        .split(|b| *b == 0)
                        .filter(|m| !m.is_empty())
                        .map(String::from_utf8_lossy)
                        .collect();
                    let mech = offered
                        .iter()
                        .find_map(|m| AuthMechanism::try_from(m.as_ref()).ok())
                        .ok_or_else(|| startup::Error::UnsupportedAuth(offered.join(", ")))?;
                    AuthMessage::Sasl(mech)
                }
                11 => AuthMessage::SaslContinue(String::from_utf8_lossy(&body).to_string()),
                12 => AuthMessage::SaslFinal(String::from_utf8_lossy(&body).to_string()),
                auth_code => Err(format!("unexpected auth response code {auth_code}"))?,
            };
            Ok(msg)
        }
        code => Err(format!("unexpected message code {code}"))?,
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;

    fn auth_frame(code: u32, extra: &[u8]) -> Vec<u8> {
        let mut b = BytesMut::new();
        b.put_u8(b'R');
        b.put_u32(8 + extra.len() as u32);
        b.put_u32(code);
        b.put_slice(extra);
        b.to_vec()
    }

    #[test]
    fn test_md5_password() {
        let hashed = md5_password("alice", "secret", [1, 2, 3, 4]);
        assert_eq!(hashed, "md598a0412b9c31436fc53776e863350083");
        assert_ne!(hashed, md5_password("alice", "secret", [4, 3, 2, 1]));
    }

    #[test]
    fn test_read_md5_challenge() {
        let bytes = auth_frame(5, &[9, 8, 7, 6]);
        let msg = read_auth_message(&mut bytes.as_slice()).unwrap();
        assert!(matches!(msg, AuthMessage::Md5Password([9, 8, 7, 6])));
    }

    #[test]
    fn test_read_sasl_picks_scram() {
        let bytes = auth_frame(10, b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let msg = read_auth_message(&mut bytes.as_slice()).unwrap();
        assert!(matches!(msg, AuthMessage::Sasl(AuthMechanism::ScramSha256)));
    }

    #[test]
    fn test_read_sasl_without_supported_mechanism() {
        let bytes = auth_frame(10, b"OAUTHBEARER\0\0");
        let err = read_auth_message(&mut bytes.as_slice()).err().unwrap();
        assert!(matches!(err, startup::Error::UnsupportedAuth(m) if m == "OAUTHBEARER"));
    }

    #[test]
    fn test_read_error_response() {
        let mut b = BytesMut::new();
        b.put_u8(b'E');
        let body = b"SFATAL\0C28P01\0Mpassword authentication failed\0\0";
        b.put_u32(4 + body.len() as u32);
        b.put_slice(body);

        let err = read_auth_message(&mut &b[..]).err().unwrap();
        assert!(matches!(err, startup::Error::Server(e) if e.code().as_deref() == Some("28P01")));
    }

    #[test]
    fn test_truncated_auth_code() {
        let bytes = [b'R', 0, 0, 0, 6, 0, 0];
        assert!(matches!(
            read_auth_message(&mut &bytes[..]),
            Err(startup::Error::Io(_))
        ));
    }
}
