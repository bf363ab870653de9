//! Immutable revocation list snapshot

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::claims::JrlClaims;

/// Claim values banned by the most recent accepted JRL token.
///
/// An empty snapshot (`iat == 0`, no entries) bans nothing. Snapshots are
/// never mutated; a newer JRL replaces the whole value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JrlSnapshot {
    pub jti: Option<Uuid>,
    pub iat: i64,
    #[serde(default)]
    pub jrl: HashMap<String, Vec<Value>>,
}

impl JrlSnapshot {
    pub fn issued_at(&self) -> i64 {
        self.iat
    }

    /// Returns the first claim name whose value is banned
    pub fn find_revoked<'a>(&'a self, payload: &serde_json::Map<String, Value>) -> Option<&'a str> {
        self.jrl.iter().find_map(|(claim, banned)| {
            payload
                .get(claim)
                .filter(|value| banned.contains(value))
                .map(|_| claim.as_str())
        })
    }

    pub fn entry_count(&self) -> usize {
        self.jrl.values().map(Vec::len).sum()
    }
}

impl From<JrlClaims> for JrlSnapshot {
    fn from(claims: JrlClaims) -> Self {
        Self {
            jti: Some(claims.jti),
            iat: claims.iat,
            jrl: claims.jrl,
        }
    }
}
