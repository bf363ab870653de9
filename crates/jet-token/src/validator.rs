//! Compact JWT decoding and validation

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::claims::{AccessTokenClaims, TokenKind};
use crate::jrl::JrlSnapshot;
use crate::key::KeyStore;

/// Claims that may only travel over an encrypted channel
const SENSITIVE_CLAIMS: [&str; 2] = ["dst_usr", "dst_pwd"];

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Encrypted tokens are not supported")]
    UnsupportedEncryption,
    #[error("Token header has no content type")]
    MissingContentType,
    #[error("Unknown token content type {0:?}")]
    UnknownContentType(String),
    #[error("Wrong token kind: expected {expected}, got {actual}")]
    WrongTokenKind { expected: TokenKind, actual: TokenKind },
    #[error("Unsigned tokens are not accepted")]
    UnsignedToken,
    #[error("Algorithm {0} does not match the configured key")]
    AlgorithmMismatch(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Token expired")]
    Expired,
    #[error("Token not yet valid")]
    NotYetValid,
    #[error("Token is bound to gateway {0}")]
    WrongGateway(Uuid),
    #[error("Token revoked by claim {0:?}")]
    Revoked(String),
    #[error("Sensitive claims received over an unencrypted channel")]
    SensitiveClaimUnencrypted,
    #[error("Malformed claims: {0}")]
    MalformedClaims(String),
}

/// How the token reached the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Plain,
    Encrypted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presentation {
    pub channel: Channel,
}

impl Presentation {
    pub const fn plain() -> Self {
        Self { channel: Channel::Plain }
    }

    pub const fn encrypted() -> Self {
        Self { channel: Channel::Encrypted }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Local instance ID compared against `jet_gw_id`
    pub instance_id: Uuid,
    /// Clock skew tolerance applied to both ends of the validity window
    pub leeway_secs: i64,
    /// Accept `alg: none` tokens. Development only.
    pub allow_unsigned: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::nil(),
            leeway_secs: 600,
            allow_unsigned: false,
        }
    }
}

#[derive(Deserialize)]
struct Header {
    alg: String,
    typ: Option<String>,
    cty: Option<String>,
}

#[derive(Deserialize)]
struct RegisteredClaims {
    iat: Option<i64>,
    nbf: Option<i64>,
    exp: Option<i64>,
    jet_gw_id: Option<Uuid>,
}

/// Stateless token validator.
///
/// The revocation snapshot is passed in by the caller so validation never
/// touches shared state or performs I/O.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    keys: KeyStore,
    config: ValidatorConfig,
}

impl TokenValidator {
    pub fn new(keys: KeyStore, config: ValidatorConfig) -> Self {
        Self { keys, config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate `raw` against the wall clock
    pub fn validate(
        &self,
        raw: &str,
        expected: Option<TokenKind>,
        presentation: Presentation,
        revocations: &JrlSnapshot,
    ) -> Result<AccessTokenClaims, TokenError> {
        let now = chrono::Utc::now().timestamp();
        self.validate_at(raw, expected, presentation, revocations, now)
    }

    pub fn validate_at(
        &self,
        raw: &str,
        expected: Option<TokenKind>,
        presentation: Presentation,
        revocations: &JrlSnapshot,
        now: i64,
    ) -> Result<AccessTokenClaims, TokenError> {
        let raw = raw.trim();
        let segments: Vec<&str> = raw.split('.').collect();
        match segments.len() {
            3 => {}
            5 => return Err(TokenError::UnsupportedEncryption),
            n => return Err(TokenError::Malformed(format!("expected 3 segments, found {n}"))),
        }

        let header: Header = decode_segment(segments[0], "header")?;
        if let Some(typ) = &header.typ {
            if !typ.eq_ignore_ascii_case("JWT") {
                return Err(TokenError::Malformed(format!("unexpected typ {typ:?}")));
            }
        }

        let cty = header.cty.as_deref().ok_or(TokenError::MissingContentType)?;
        let kind: TokenKind = cty
            .parse()
            .map_err(|_| TokenError::UnknownContentType(cty.to_owned()))?;

        if let Some(expected) = expected {
            if expected != kind {
                return Err(TokenError::WrongTokenKind { expected, actual: kind });
            }
        }

        let signed_len = segments[0].len() + 1 + segments[1].len();
        self.verify_signature(kind, &header.alg, &raw[..signed_len], segments[2])?;

        let payload: serde_json::Value = decode_segment(segments[1], "payload")?;
        let serde_json::Value::Object(payload) = payload else {
            return Err(TokenError::Malformed("payload is not a JSON object".to_owned()));
        };

        let registered: RegisteredClaims =
            serde_json::from_value(serde_json::Value::Object(payload.clone()))
                .map_err(|e| TokenError::MalformedClaims(e.to_string()))?;

        self.check_window(kind, &registered, now)?;

        if let Some(gw_id) = registered.jet_gw_id {
            if gw_id != self.config.instance_id {
                return Err(TokenError::WrongGateway(gw_id));
            }
        }

        if let Some(claim) = revocations.find_revoked(&payload) {
            return Err(TokenError::Revoked(claim.to_owned()));
        }

        if presentation.channel == Channel::Plain
            && SENSITIVE_CLAIMS
                .iter()
                .any(|name| payload.get(*name).is_some_and(|value| !value.is_null()))
        {
            return Err(TokenError::SensitiveClaimUnencrypted);
        }

        let claims = AccessTokenClaims::decode(kind, serde_json::Value::Object(payload))
            .map_err(TokenError::MalformedClaims)?;

        debug!(kind = %kind, jti = %claims.jti(), "Token accepted");

        Ok(claims)
    }

    fn verify_signature(
        &self,
        kind: TokenKind,
        alg: &str,
        message: &str,
        signature: &str,
    ) -> Result<(), TokenError> {
        if alg.eq_ignore_ascii_case("none") {
            if !self.config.allow_unsigned {
                return Err(TokenError::UnsignedToken);
            }
            if !signature.is_empty() {
                return Err(TokenError::InvalidSignature);
            }
            tracing::warn!(kind = %kind, "Accepting unsigned token (development override)");
            return Ok(());
        }

        let alg: Algorithm = alg
            .parse()
            .map_err(|_| TokenError::Malformed(format!("unsupported algorithm {alg:?}")))?;

        let key = self.keys.key_for(kind);
        if !key.accepts(alg) {
            return Err(TokenError::AlgorithmMismatch(format!("{alg:?}")));
        }

        match jsonwebtoken::crypto::verify(signature, message.as_bytes(), key.decoding_key(), alg) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(TokenError::InvalidSignature),
        }
    }

    /// Window is `max(iat, nbf) - leeway ..= exp + leeway`
    fn check_window(
        &self,
        kind: TokenKind,
        registered: &RegisteredClaims,
        now: i64,
    ) -> Result<(), TokenError> {
        let leeway = self.config.leeway_secs;

        let not_before = match (registered.iat, registered.nbf) {
            (Some(iat), Some(nbf)) => Some(iat.max(nbf)),
            (iat, nbf) => iat.or(nbf),
        };
        if let Some(not_before) = not_before {
            if now < not_before.saturating_sub(leeway) {
                return Err(TokenError::NotYetValid);
            }
        }

        match registered.exp {
            Some(exp) if now > exp.saturating_add(leeway) => Err(TokenError::Expired),
            Some(_) => Ok(()),
            None if kind == TokenKind::Jrl => Ok(()),
            None => Err(TokenError::MalformedClaims("missing exp".to_owned())),
        }
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str, what: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| TokenError::Malformed(format!("{what}: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed(format!("{what}: {e}")))
}
