//! JET handshake over a raw relay socket.
//!
//! Requests are a single HTTP/1.1 head without body. Anything the peer sent
//! after the blank line belongs to the relayed stream and is returned as
//! leftover.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::candidate::Role;

pub const JET_VERSION_HEADER: &str = "Jet-Version";

/// Upper bound on a handshake head
pub const MAX_HEAD_LEN: usize = 8 * 1024;

const HEAD_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed during handshake")]
    UnexpectedEof,
    #[error("Handshake exceeds {0} bytes")]
    TooLarge(usize),
    #[error("Malformed handshake: {0}")]
    Malformed(String),
    #[error("Unsupported JET version {0}")]
    UnsupportedVersion(u32),
    #[error("Missing authorization token")]
    MissingToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JetMethod {
    Accept,
    Connect,
}

impl JetMethod {
    fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("accept") {
            Some(JetMethod::Accept)
        } else if value.eq_ignore_ascii_case("connect") {
            Some(JetMethod::Connect)
        } else {
            None
        }
    }

    /// `accept` is sent by the server side, `connect` by the client side
    pub fn role(self) -> Role {
        match self {
            JetMethod::Accept => Role::Server,
            JetMethod::Connect => Role::Client,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JetRequest {
    pub method: JetMethod,
    pub association_id: Uuid,
    pub candidate_id: Uuid,
    pub version: u32,
    pub token: String,
    pub host: Option<String>,
}

impl JetRequest {
    pub fn role(&self) -> Role {
        self.method.role()
    }
}

/// Read until the end of an HTTP head.
///
/// `buf` may already hold bytes read by the caller.
pub async fn read_head<R>(
    reader: &mut R,
    mut buf: BytesMut,
    limit: usize,
) -> Result<(Bytes, Bytes), HandshakeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some(pos) = find_head_end(&buf) {
            let mut head = buf.split_to(pos + HEAD_END.len());
            head.truncate(pos);
            return Ok((head.freeze(), buf.freeze()));
        }

        if buf.len() >= limit {
            return Err(HandshakeError::TooLarge(limit));
        }

        buf.reserve(1024);
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_END.len()).position(|w| w == HEAD_END)
}

/// Parse a v1 or v2 JET request head (without the trailing blank line)
pub fn parse_request(head: &[u8]) -> Result<JetRequest, HandshakeError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| HandshakeError::Malformed("non UTF-8 head".to_owned()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_ascii_whitespace();
    let (Some(method), Some(path), Some(http_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::Malformed(format!("bad request line {request_line:?}")));
    };
    if method != "GET" || !http_version.starts_with("HTTP/1.") {
        return Err(HandshakeError::Malformed(format!("bad request line {request_line:?}")));
    }

    let headers = lines
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim(), value.trim()))
                .ok_or_else(|| HandshakeError::Malformed(format!("bad header line {line:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let header = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    };

    let version = match header(JET_VERSION_HEADER) {
        Some(value) => value
            .parse::<u32>()
            .map_err(|_| HandshakeError::Malformed(format!("bad Jet-Version {value:?}")))?,
        None => 1,
    };

    let (method, association_id, candidate_id) = match version {
        2 => parse_v2_path(path)?,
        1 => {
            let method = header("Jet-Method")
                .and_then(JetMethod::parse)
                .ok_or_else(|| HandshakeError::Malformed("missing Jet-Method".to_owned()))?;
            let association_id = header("Jet-Association")
                .ok_or_else(|| HandshakeError::Malformed("missing Jet-Association".to_owned()))
                .and_then(parse_uuid)?;
            let candidate_id = match header("Jet-Candidate") {
                Some(value) => parse_uuid(value)?,
                None => Uuid::new_v4(),
            };
            (method, association_id, candidate_id)
        }
        other => return Err(HandshakeError::UnsupportedVersion(other)),
    };

    let token = header("Authorization")
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(HandshakeError::MissingToken)?
        .to_owned();

    Ok(JetRequest {
        method,
        association_id,
        candidate_id,
        version,
        token,
        host: header("Host").map(str::to_owned),
    })
}

fn parse_v2_path(path: &str) -> Result<(JetMethod, Uuid, Uuid), HandshakeError> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["jet", method, aid, cid] => {
            let method = JetMethod::parse(method)
                .ok_or_else(|| HandshakeError::Malformed(format!("unknown JET method in {path:?}")))?;
            Ok((method, parse_uuid(aid)?, parse_uuid(cid)?))
        }
        _ => Err(HandshakeError::Malformed(format!("unexpected path {path:?}"))),
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, HandshakeError> {
    value
        .parse()
        .map_err(|_| HandshakeError::Malformed(format!("bad identifier {value:?}")))
}

/// Status line plus `Jet-Version`, terminated by a blank line
pub fn response(version: u32, status: u16, reason: &str) -> String {
    format!("HTTP/1.1 {status} {reason}\r\n{JET_VERSION_HEADER}: {version}\r\n\r\n")
}

/// Connection test written by the relay on a candidate socket
pub fn test_request(association_id: Uuid, candidate_id: Uuid) -> String {
    format!(
        "GET /jet/test/{association_id}/{candidate_id} HTTP/1.1\r\n{JET_VERSION_HEADER}: 2\r\n\r\n"
    )
}

/// Status code of a response head
pub fn parse_status(head: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(head).ok()?;
    let status_line = text.split("\r\n").next()?;
    let mut parts = status_line.split_ascii_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}
