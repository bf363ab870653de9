//! jet-relay: token-gated JET relay
//!
//! Peers present an association token over a JET handshake, an RDP
//! preconnection PDU or a WebSocket. The relay pairs a client candidate with
//! a server candidate (or dials the destination itself in forward mode) and
//! pipes bytes between them, optionally recording and filtering the session.
//! A scope-gated REST API exposes sessions, associations, the revocation list
//! and diagnostics.

pub mod api;
pub mod association;
pub mod auth;
pub mod bridge;
pub mod candidate;
pub mod config;
pub mod extract;
pub mod filter;
pub mod forwarder;
pub mod jet;
pub mod jrl;
pub mod kdc;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod negotiation;
pub mod pcb;
pub mod recording;
pub mod server;
pub mod session;
pub mod tls;
pub mod ws;

pub use association::{AssociationRegistry, RegistryError};
pub use auth::TokenAuthority;
pub use config::{Cli, ServerConfig};
pub use forwarder::{Direction, Forwarder, TerminationReason};
pub use jrl::JrlStore;
pub use server::RelayServer;
