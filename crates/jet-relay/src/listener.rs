//! Relay listeners: JET handshakes and RDP preconnection PDUs

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use jet_token::{AccessTokenClaims, AssociationClaims, Channel, Presentation, TokenError, TokenKind};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::association::{AssociationRegistry, RegistryError};
use crate::auth::TokenAuthority;
use crate::candidate::{Candidate, Role, Transport};
use crate::config::{ListenerScheme, ListenerUrl};
use crate::extract::token_status;
use crate::jet::{self, HandshakeError};
use crate::pcb::{self, PcbError};
use crate::tls::TlsIdentity;

/// Time allowed to receive a full handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake timed out")]
    Timeout,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Pcb(#[from] PcbError),
    #[error("Preconnection PDU carries no token")]
    MissingToken,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("Token is for association {token}, request names {requested}")]
    AssociationMismatch { token: Uuid, requested: Uuid },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// State shared by every relay listener
#[derive(Clone)]
pub struct RelayContext {
    pub authority: TokenAuthority,
    pub registry: Arc<AssociationRegistry>,
}

/// Accept connections until shutdown
pub async fn serve(
    listener: TcpListener,
    url: ListenerUrl,
    tls: Option<TlsIdentity>,
    ctx: RelayContext,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(listener = %url, "Relay listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(listener = %url, error = %e, "Accept failed");
                        tokio::select! {
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                            _ = shutdown.changed() => break,
                        }
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);

                let ctx = ctx.clone();
                let acceptor = match url.scheme {
                    ListenerScheme::Tls => tls.as_ref().map(TlsIdentity::acceptor),
                    ListenerScheme::Tcp => None,
                };
                tokio::spawn(async move {
                    let result = match acceptor {
                        Some(acceptor) => match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                            Ok(Ok(tls_stream)) => handle_connection(tls_stream, peer, Channel::Encrypted, &ctx).await,
                            Ok(Err(e)) => Err(ListenerError::Io(e)),
                            Err(_) => Err(ListenerError::Timeout),
                        },
                        None => handle_connection(stream, peer, Channel::Plain, &ctx).await,
                    };
                    if let Err(error) = result {
                        debug!(%peer, %error, "Relay connection rejected");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    info!(listener = %url, "Relay listener stopped");
}

/// Route one accepted connection by its first bytes
pub async fn handle_connection<S: Transport>(
    mut stream: S,
    peer: SocketAddr,
    channel: Channel,
    ctx: &RelayContext,
) -> Result<(), ListenerError> {
    let mut buf = BytesMut::with_capacity(1024);
    let filled = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while buf.len() < 4 {
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(HandshakeError::UnexpectedEof);
            }
        }
        Ok::<(), HandshakeError>(())
    })
    .await;
    match filled {
        Ok(result) => result?,
        Err(_) => return Err(ListenerError::Timeout),
    }

    let presentation = Presentation { channel };
    if buf.starts_with(b"GET ") {
        handle_jet(stream, buf, peer, presentation, ctx).await
    } else {
        handle_pcb(stream, buf, peer, presentation, ctx).await
    }
}

async fn handle_jet<S: Transport>(
    mut stream: S,
    buf: BytesMut,
    peer: SocketAddr,
    presentation: Presentation,
    ctx: &RelayContext,
) -> Result<(), ListenerError> {
    let (head, leftover) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        jet::read_head(&mut stream, buf, jet::MAX_HEAD_LEN),
    )
    .await
    .map_err(|_| ListenerError::Timeout)??;

    let request = match jet::parse_request(&head) {
        Ok(request) => request,
        Err(e) => {
            let _ = stream.write_all(jet::response(2, 400, "Bad Request").as_bytes()).await;
            return Err(e.into());
        }
    };

    let claims = match association_claims(&ctx.authority, &request.token, presentation)
        .and_then(|claims| {
            if claims.association_id == request.association_id {
                Ok(claims)
            } else {
                Err(ListenerError::AssociationMismatch {
                    token: claims.association_id,
                    requested: request.association_id,
                })
            }
        }) {
        Ok(claims) => claims,
        Err(e) => {
            let status = match &e {
                ListenerError::Token(error) => token_status(error),
                _ => axum::http::StatusCode::FORBIDDEN,
            };
            let reason = status.canonical_reason().unwrap_or("Rejected");
            let _ = stream
                .write_all(jet::response(request.version, status.as_u16(), reason).as_bytes())
                .await;
            return Err(e);
        }
    };

    debug!(
        %peer,
        association_id = %request.association_id,
        candidate_id = %request.candidate_id,
        role = %request.role(),
        "JET handshake received"
    );

    let candidate = Candidate::new(request.role(), stream, peer.to_string())
        .with_id(request.candidate_id)
        .with_leftover(leftover)
        .with_jet_greeting(request.version);
    join(ctx, claims, candidate).await
}

async fn handle_pcb<S: Transport>(
    mut stream: S,
    buf: BytesMut,
    peer: SocketAddr,
    presentation: Presentation,
    ctx: &RelayContext,
) -> Result<(), ListenerError> {
    let (blob, leftover) = tokio::time::timeout(HANDSHAKE_TIMEOUT, pcb::read_pcb(&mut stream, buf))
        .await
        .map_err(|_| ListenerError::Timeout)??;
    let token = blob.payload.ok_or(ListenerError::MissingToken)?;
    let claims = association_claims(&ctx.authority, &token, presentation)?;

    debug!(%peer, association_id = %claims.association_id, "Preconnection PDU received");
    let candidate = Candidate::new(Role::Client, stream, peer.to_string()).with_leftover(leftover);
    join(ctx, claims, candidate).await
}

/// Open the association and offer the candidate to it
pub(crate) async fn join(ctx: &RelayContext, claims: AssociationClaims, candidate: Candidate) -> Result<(), ListenerError> {
    let id = claims.association_id;
    if let Err(e) = ctx.registry.open(claims).await {
        let (status, reason) = e.status();
        candidate.reject(status, reason).await;
        return Err(e.into());
    }
    ctx.registry.attach_candidate(id, candidate).await?;
    Ok(())
}

pub(crate) fn association_claims(
    authority: &TokenAuthority,
    token: &str,
    presentation: Presentation,
) -> Result<AssociationClaims, ListenerError> {
    match authority.validate(token, None, presentation)? {
        AccessTokenClaims::Association(claims) => Ok(claims),
        AccessTokenClaims::Jmux(claims) => Ok(claims.into()),
        other => Err(TokenError::WrongTokenKind {
            expected: TokenKind::Association,
            actual: other.kind(),
        }
        .into()),
    }
}
