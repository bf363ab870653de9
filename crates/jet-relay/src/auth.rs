//! Token authority: the validator bound to the live revocation list

use std::sync::Arc;

use jet_token::{AccessTokenClaims, Presentation, TokenError, TokenKind, TokenValidator};
use thiserror::Error;
use tracing::{debug, warn};

use crate::jrl::{JrlError, JrlInfo, JrlStore};
use crate::metrics::RelayMetrics;

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Jrl(#[from] JrlError),
}

/// Short label used for logs and metrics
pub fn rejection_reason(error: &TokenError) -> &'static str {
    match error {
        TokenError::Malformed(_) => "malformed",
        TokenError::UnsupportedEncryption => "unsupported_encryption",
        TokenError::MissingContentType => "missing_content_type",
        TokenError::UnknownContentType(_) => "unknown_content_type",
        TokenError::WrongTokenKind { .. } => "wrong_kind",
        TokenError::UnsignedToken => "unsigned",
        TokenError::AlgorithmMismatch(_) => "algorithm_mismatch",
        TokenError::InvalidSignature => "invalid_signature",
        TokenError::Expired => "expired",
        TokenError::NotYetValid => "not_yet_valid",
        TokenError::WrongGateway(_) => "wrong_gateway",
        TokenError::Revoked(_) => "revoked",
        TokenError::SensitiveClaimUnencrypted => "sensitive_claim_unencrypted",
        TokenError::MalformedClaims(_) => "malformed_claims",
    }
}

#[derive(Clone)]
pub struct TokenAuthority {
    validator: Arc<TokenValidator>,
    jrl: Arc<JrlStore>,
    metrics: Arc<RelayMetrics>,
}

impl TokenAuthority {
    pub fn new(validator: TokenValidator, jrl: Arc<JrlStore>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            validator: Arc::new(validator),
            jrl,
            metrics,
        }
    }

    pub fn jrl(&self) -> &JrlStore {
        &self.jrl
    }

    /// Validate against the revocation list current at call time
    pub fn validate(
        &self,
        raw: &str,
        expected: Option<TokenKind>,
        presentation: Presentation,
    ) -> Result<AccessTokenClaims, TokenError> {
        let revocations = self.jrl.current();
        self.validator
            .validate(raw, expected, presentation, &revocations)
            .map_err(|error| {
                let reason = rejection_reason(&error);
                warn!(reason, %error, "Token rejected");
                self.metrics.record_token_rejected(reason);
                error
            })
    }

    /// Validate a JRL token and install it
    pub async fn push_jrl(&self, raw: &str, presentation: Presentation) -> Result<JrlInfo, PushError> {
        let AccessTokenClaims::Jrl(claims) =
            self.validate(raw, Some(TokenKind::Jrl), presentation)?
        else {
            // validate() enforces the expected kind
            return Err(TokenError::MalformedClaims("not a JRL token".to_owned()).into());
        };

        debug!(jti = %claims.jti, iat = claims.iat, "Installing revocation list");
        let info = self.jrl.push(claims).await?;
        self.metrics.record_jrl_update();
        Ok(info)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Token minting helpers shared by the crate's tests

    use super::*;
    use jet_token::{KeyStore, ValidatorConfig, VerificationKey};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::Value;

    pub const SECRET: &[u8] = b"relay-test-secret";

    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    pub fn mint(kind: TokenKind, mut claims: Value) -> String {
        let object = claims.as_object_mut().expect("claims object");
        object.entry("jti").or_insert_with(|| uuid::Uuid::new_v4().to_string().into());
        object.entry("iat").or_insert_with(|| now().into());
        if kind != TokenKind::Jrl {
            object.entry("exp").or_insert_with(|| (now() + 3600).into());
        }

        let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
        header.cty = Some(kind.as_str().to_owned());
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).expect("encode token")
    }

    pub fn authority() -> TokenAuthority {
        authority_with(Arc::new(JrlStore::in_memory()), Arc::new(RelayMetrics::new().unwrap()))
    }

    pub fn authority_with(jrl: Arc<JrlStore>, metrics: Arc<RelayMetrics>) -> TokenAuthority {
        let keys = KeyStore::new(VerificationKey::from_secret(SECRET).unwrap());
        let validator = TokenValidator::new(keys, ValidatorConfig::default());
        TokenAuthority::new(validator, jrl, metrics)
    }
}
