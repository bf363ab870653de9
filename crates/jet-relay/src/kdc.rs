//! Kerberos KDC proxy (MS-KKDCP).
//!
//! Clients post a DER `KDC-PROXY-MESSAGE` whose `kerb-message` is a TCP
//! framed Kerberos request. The realm it names must match the token's, and
//! the reply is wrapped back into a `KDC-PROXY-MESSAGE`.

use std::net::SocketAddr;
use std::time::Duration;

use jet_token::{KdcClaims, TargetAddr};
use picky_krb::messages::KdcProxyMessage;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace, warn};

/// Largest KDC reply relayed back
pub const MAX_REPLY_LEN: usize = 1024 * 1024;

/// Largest datagram a UDP KDC can send
const MAX_DATAGRAM_LEN: usize = 65_535;

#[derive(Debug, Error)]
pub enum KdcError {
    #[error("Unsupported KDC scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("Invalid KDC proxy message: {0}")]
    Message(String),
    #[error("Realm is missing from the KDC request")]
    RealmMissing,
    #[error("Requested realm {0:?} is not allowed by the token")]
    RealmMismatch(String),
    #[error("Kerberos message is not length-framed")]
    BadFrame,
    #[error("KDC reply of {0} bytes exceeds the limit")]
    ReplyTooLarge(usize),
    #[error("Could not resolve KDC {0}")]
    Unresolved(String),
    #[error("KDC did not answer in time")]
    Timeout,
    #[error("KDC IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcRequest {
    pub realm: String,
    /// Length-prefixed Kerberos message
    pub message: Vec<u8>,
}

pub fn decode_request(body: &[u8]) -> Result<KdcRequest, KdcError> {
    let message = KdcProxyMessage::from_raw(body).map_err(|e| KdcError::Message(format!("{e:?}")))?;
    trace!(?message, "Received KDC proxy message");

    let realm = match &message.target_domain.0 {
        Some(realm) => realm.0.to_string(),
        None => return Err(KdcError::RealmMissing),
    };
    Ok(KdcRequest {
        realm,
        message: message.kerb_message.0 .0,
    })
}

pub fn encode_reply(reply: &[u8]) -> Result<Vec<u8>, KdcError> {
    let message =
        KdcProxyMessage::from_raw_kerb_message(reply).map_err(|e| KdcError::Message(format!("{e:?}")))?;
    message.to_vec().map_err(|e| KdcError::Message(format!("{e:?}")))
}

/// Realms are compared without regard to case
pub fn check_realm(allowed: &str, requested: &str) -> Result<(), KdcError> {
    if allowed.to_lowercase() == requested.to_lowercase() {
        Ok(())
    } else {
        Err(KdcError::RealmMismatch(requested.to_owned()))
    }
}

/// Check the 4-byte big-endian length prefix of a TCP Kerberos message
pub fn check_frame(message: &[u8]) -> Result<(), KdcError> {
    let Some((len, body)) = message.split_first_chunk::<4>() else {
        return Err(KdcError::BadFrame);
    };
    if u32::from_be_bytes(*len) as usize != body.len() {
        return Err(KdcError::BadFrame);
    }
    Ok(())
}

/// Decode a proxy request, forward it to the token's KDC and wrap the reply
pub async fn proxy(claims: &KdcClaims, body: &[u8], timeout: Duration) -> Result<Vec<u8>, KdcError> {
    let request = decode_request(body)?;
    debug!(realm = %request.realm, kdc = %claims.krb_kdc, "KDC proxy request");
    if let Err(e) = check_realm(&claims.krb_realm, &request.realm) {
        warn!(requested = %request.realm, allowed = %claims.krb_realm, "KDC request for a foreign realm");
        return Err(e);
    }

    let reply = forward(&claims.krb_kdc, &request.message, timeout).await?;
    encode_reply(&reply)
}

/// Send one framed message to the KDC and return its framed reply
pub async fn forward(target: &TargetAddr, message: &[u8], timeout: Duration) -> Result<Vec<u8>, KdcError> {
    let udp = match target.scheme() {
        "tcp" => false,
        "udp" => true,
        other => return Err(KdcError::UnsupportedScheme(other.to_owned())),
    };
    check_frame(message)?;

    let exchange = async {
        let addr = resolve(target).await?;
        if udp {
            exchange_udp(addr, message).await
        } else {
            exchange_tcp(addr, message).await
        }
    };

    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| KdcError::Timeout)??;
    debug!(kdc = %target, request_len = message.len(), reply_len = reply.len(), "KDC exchange done");
    Ok(reply)
}

async fn resolve(target: &TargetAddr) -> Result<SocketAddr, KdcError> {
    tokio::net::lookup_host(target.authority())
        .await?
        .next()
        .ok_or_else(|| KdcError::Unresolved(target.to_string()))
}

async fn exchange_tcp(addr: SocketAddr, message: &[u8]) -> Result<Vec<u8>, KdcError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(message).await?;
    stream.flush().await?;

    let len = stream.read_u32().await? as usize;
    if len > MAX_REPLY_LEN {
        return Err(KdcError::ReplyTooLarge(len));
    }
    let mut reply = vec![0u8; 4 + len];
    reply[..4].copy_from_slice(&(len as u32).to_be_bytes());
    stream.read_exact(&mut reply[4..]).await?;
    Ok(reply)
}

/// UDP carries the bare message; the reply gets its length prefix back
async fn exchange_udp(addr: SocketAddr, message: &[u8]) -> Result<Vec<u8>, KdcError> {
    let local: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    socket.send(&message[4..]).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let len = socket.recv(&mut buf).await?;
    let mut reply = Vec::with_capacity(4 + len);
    reply.extend_from_slice(&(len as u32).to_be_bytes());
    reply.extend_from_slice(&buf[..len]);
    Ok(reply)
}
