//! Candidate connections competing for a role in an association

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use jet_token::TargetAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::jet::{self, HandshakeError};

/// Byte stream a candidate or relay endpoint runs over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxTransport = Box<dyn Transport>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the candidate expects back once admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    /// Raw stream, nothing is written before relaying
    None,
    /// JET handshake, answered with a status line
    Jet { version: u32 },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection test timed out")]
    Timeout,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("Connection test answered with status {0:?}")]
    Status(Option<u16>),
}

pub struct Candidate {
    id: Uuid,
    role: Role,
    transport: BoxTransport,
    leftover: Bytes,
    peer: String,
    greeting: Greeting,
    dialed: bool,
}

impl Candidate {
    pub fn new(role: Role, transport: impl Transport, peer: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            transport: Box::new(transport),
            leftover: Bytes::new(),
            peer: peer.into(),
            greeting: Greeting::None,
            dialed: false,
        }
    }

    /// Server candidate produced by the relay's own dial
    pub fn dialed(stream: TcpStream, target: &TargetAddr) -> Self {
        let mut candidate = Self::new(Role::Server, stream, target.to_string());
        candidate.dialed = true;
        candidate
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_leftover(mut self, leftover: Bytes) -> Self {
        self.leftover = leftover;
        self
    }

    pub fn with_jet_greeting(mut self, version: u32) -> Self {
        self.greeting = Greeting::Jet { version };
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_dialed(&self) -> bool {
        self.dialed
    }

    /// Only JET peers understand a connection test
    pub fn speaks_jet(&self) -> bool {
        matches!(self.greeting, Greeting::Jet { .. })
    }

    /// Tell a JET peer it was admitted
    pub async fn acknowledge(&mut self) -> std::io::Result<()> {
        if let Greeting::Jet { version } = self.greeting {
            self.transport
                .write_all(jet::response(version, 200, "OK").as_bytes())
                .await?;
            self.transport.flush().await?;
        }
        Ok(())
    }

    /// Answer a JET peer with an error status and close
    pub async fn reject(mut self, status: u16, reason: &str) {
        if let Greeting::Jet { version } = self.greeting {
            let _ = self
                .transport
                .write_all(jet::response(version, status, reason).as_bytes())
                .await;
        }
        let _ = self.transport.shutdown().await;
    }

    /// Run the JET connection test and wait for a 200 reply
    pub async fn probe(&mut self, association_id: Uuid, timeout: Duration) -> Result<(), ProbeError> {
        let request = jet::test_request(association_id, self.id);
        let pending = std::mem::take(&mut self.leftover);

        let exchange = async {
            self.transport.write_all(request.as_bytes()).await?;
            self.transport.flush().await?;
            let (head, rest) =
                jet::read_head(&mut self.transport, BytesMut::from(&pending[..]), jet::MAX_HEAD_LEN)
                    .await?;
            Ok::<_, ProbeError>((head, rest))
        };

        let (head, rest) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ProbeError::Timeout)??;

        match jet::parse_status(&head) {
            Some(200) => {
                self.leftover = rest;
                Ok(())
            }
            status => Err(ProbeError::Status(status)),
        }
    }

    pub fn into_endpoint(self) -> Endpoint {
        Endpoint {
            transport: self.transport,
            leftover: self.leftover,
        }
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("greeting", &self.greeting)
            .field("dialed", &self.dialed)
            .finish_non_exhaustive()
    }
}

/// A bound socket handed to the relay engine
pub struct Endpoint {
    pub transport: BoxTransport,
    /// Bytes read during the handshake that belong to the relayed stream
    pub leftover: Bytes,
}

impl Endpoint {
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Box::new(transport),
            leftover: Bytes::new(),
        }
    }
}
