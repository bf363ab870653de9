//! Verification keys and per-kind key selection

use std::collections::HashMap;
use std::fmt;

use jsonwebtoken::{Algorithm, DecodingKey};
use thiserror::Error;

use crate::claims::TokenKind;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Empty HMAC secret")]
    EmptySecret,
    #[error("Unsupported public key: expected an RSA, EC or Ed25519 PEM")]
    UnsupportedPem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Hmac,
    Rsa,
    Ec,
    Ed,
}

impl KeyFamily {
    fn of(alg: Algorithm) -> Self {
        match alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => KeyFamily::Hmac,
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => KeyFamily::Rsa,
            Algorithm::ES256 | Algorithm::ES384 => KeyFamily::Ec,
            Algorithm::EdDSA => KeyFamily::Ed,
        }
    }
}

/// A key able to verify token signatures of one algorithm family
#[derive(Clone)]
pub struct VerificationKey {
    family: KeyFamily,
    key: DecodingKey,
}

impl VerificationKey {
    pub fn from_secret(secret: &[u8]) -> Result<Self, KeyError> {
        if secret.is_empty() {
            return Err(KeyError::EmptySecret);
        }
        Ok(Self {
            family: KeyFamily::Hmac,
            key: DecodingKey::from_secret(secret),
        })
    }

    /// Load a PEM public key, trying RSA, EC then Ed25519
    pub fn from_pem(pem: &[u8]) -> Result<Self, KeyError> {
        if let Ok(key) = DecodingKey::from_rsa_pem(pem) {
            return Ok(Self { family: KeyFamily::Rsa, key });
        }
        if let Ok(key) = DecodingKey::from_ec_pem(pem) {
            return Ok(Self { family: KeyFamily::Ec, key });
        }
        if let Ok(key) = DecodingKey::from_ed_pem(pem) {
            return Ok(Self { family: KeyFamily::Ed, key });
        }
        Err(KeyError::UnsupportedPem)
    }

    pub fn family(&self) -> KeyFamily {
        self.family
    }

    /// Whether `alg` may be verified with this key
    pub fn accepts(&self, alg: Algorithm) -> bool {
        KeyFamily::of(alg) == self.family
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

/// Provisioner key plus optional per-kind overrides
#[derive(Debug, Clone)]
pub struct KeyStore {
    provisioner: VerificationKey,
    overrides: HashMap<TokenKind, VerificationKey>,
}

impl KeyStore {
    pub fn new(provisioner: VerificationKey) -> Self {
        Self {
            provisioner,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, kind: TokenKind, key: VerificationKey) -> Self {
        self.overrides.insert(kind, key);
        self
    }

    pub fn key_for(&self, kind: TokenKind) -> &VerificationKey {
        self.overrides.get(&kind).unwrap_or(&self.provisioner)
    }
}
