//! jet-token: typed access tokens for the JET relay
//!
//! Tokens are compact JWTs whose `cty` header selects one of six claim
//! layouts. [`TokenValidator`] decodes a token once, verifies its signature
//! and time window, checks it against the current revocation list and hands
//! back an [`AccessTokenClaims`] value that callers match exhaustively.

pub mod claims;
pub mod jrl;
pub mod key;
pub mod target_addr;
pub mod validator;

pub use claims::{
    AccessScope, AccessTokenClaims, ApplicationProtocol, AssociationClaims, BridgeClaims,
    ConnectionMode, ConnectionTest, Credentials, JmuxClaims, JrlClaims, KdcClaims, ScopeClaims,
    TokenKind,
};
pub use jrl::JrlSnapshot;
pub use key::{KeyError, KeyStore, VerificationKey};
pub use target_addr::{TargetAddr, TargetAddrError};
pub use validator::{Channel, Presentation, TokenError, TokenValidator, ValidatorConfig};
