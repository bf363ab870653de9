//! Typed claims for each token content type

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::target_addr::TargetAddr;

/// Default Kerberos KDC port used when `krb_kdc` omits one
pub const KDC_DEFAULT_PORT: u16 = 88;

/// Token content type, read from the `cty` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenKind {
    Association,
    Jmux,
    Scope,
    Kdc,
    Jrl,
    Bridge,
}

#[derive(Debug, Error)]
#[error("Unknown token content type {0:?}")]
pub struct UnknownTokenKind(pub String);

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Association => "ASSOCIATION",
            TokenKind::Jmux => "JMUX",
            TokenKind::Scope => "SCOPE",
            TokenKind::Kdc => "KDC",
            TokenKind::Jrl => "JRL",
            TokenKind::Bridge => "BRIDGE",
        }
    }
}

impl FromStr for TokenKind {
    type Err = UnknownTokenKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [TokenKind; 6] = [
            TokenKind::Association,
            TokenKind::Jmux,
            TokenKind::Scope,
            TokenKind::Kdc,
            TokenKind::Jrl,
            TokenKind::Bridge,
        ];

        ALL.into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTokenKind(s.to_owned()))
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application protocol tag (`jet_ap`), lowercased
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ApplicationProtocol(String);

impl ApplicationProtocol {
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new(tag: &str) -> Self {
        Self(tag.trim().to_ascii_lowercase())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Well-known port for the protocol, if any
    pub fn default_port(&self) -> Option<u16> {
        match self.0.as_str() {
            "rdp" => Some(3389),
            "ssh" | "sftp" | "scp" => Some(22),
            "vnc" | "ard" => Some(5900),
            "telnet" => Some(23),
            "http" => Some(80),
            "https" => Some(443),
            "ldap" => Some(389),
            "ldaps" => Some(636),
            "winrm-http" | "pwsh" => Some(5985),
            "winrm-https" => Some(5986),
            "wayk" => Some(12876),
            _ => None,
        }
    }
}

impl fmt::Display for ApplicationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Both endpoints dial the relay
    Rendezvous,
    /// The relay dials `targets` in order, first success wins
    Forward { targets: Vec<TargetAddr> },
}

impl ConnectionMode {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionMode::Rendezvous => "rdv",
            ConnectionMode::Forward { .. } => "fwd",
        }
    }

    pub fn targets(&self) -> &[TargetAddr] {
        match self {
            ConnectionMode::Rendezvous => &[],
            ConnectionMode::Forward { targets } => targets,
        }
    }
}

/// `jet_ct`: whether a probed candidate socket is reused for relaying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionTest {
    Keep,
    Close,
}

#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub prx_usr: Option<String>,
    pub prx_pwd: Option<String>,
    pub dst_usr: Option<String>,
    pub dst_pwd: Option<String>,
}

impl Credentials {
    fn is_empty(&self) -> bool {
        self.prx_usr.is_none()
            && self.prx_pwd.is_none()
            && self.dst_usr.is_none()
            && self.dst_pwd.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("prx_usr", &self.prx_usr)
            .field("prx_pwd", &self.prx_pwd.as_ref().map(|_| "***"))
            .field("dst_usr", &self.dst_usr)
            .field("dst_pwd", &self.dst_pwd.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssociationClaims {
    pub jti: Uuid,
    pub exp: i64,
    pub association_id: Uuid,
    pub application_protocol: ApplicationProtocol,
    pub connection_mode: ConnectionMode,
    pub recording: bool,
    pub filtering: bool,
    pub connection_test: Option<ConnectionTest>,
    /// Maximum session lifetime in minutes
    pub session_ttl_minutes: Option<u64>,
    pub credentials: Option<Credentials>,
}

impl AssociationClaims {
    pub fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes * 60))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JmuxClaims {
    pub jti: Uuid,
    pub exp: i64,
    pub association_id: Uuid,
    pub application_protocol: ApplicationProtocol,
    pub destination: TargetAddr,
    pub additional: Vec<TargetAddr>,
    pub recording: bool,
    pub session_ttl_minutes: Option<u64>,
}

impl From<JmuxClaims> for AssociationClaims {
    /// A jmux grant relays to `dst_hst`, falling back to `dst_addl`
    fn from(claims: JmuxClaims) -> Self {
        let mut targets = Vec::with_capacity(1 + claims.additional.len());
        targets.push(claims.destination);
        targets.extend(claims.additional);

        Self {
            jti: claims.jti,
            exp: claims.exp,
            association_id: claims.association_id,
            application_protocol: claims.application_protocol,
            connection_mode: ConnectionMode::Forward { targets },
            recording: claims.recording,
            filtering: false,
            connection_test: None,
            session_ttl_minutes: claims.session_ttl_minutes,
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessScope {
    #[serde(rename = "*")]
    Wildcard,
    #[serde(rename = "gateway.sessions.read")]
    SessionsRead,
    #[serde(rename = "gateway.session.terminate")]
    SessionTerminate,
    #[serde(rename = "gateway.associations.read")]
    AssociationsRead,
    #[serde(rename = "gateway.diagnostics.read")]
    DiagnosticsRead,
    #[serde(rename = "gateway.jrl.read")]
    JrlRead,
}

impl AccessScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessScope::Wildcard => "*",
            AccessScope::SessionsRead => "gateway.sessions.read",
            AccessScope::SessionTerminate => "gateway.session.terminate",
            AccessScope::AssociationsRead => "gateway.associations.read",
            AccessScope::DiagnosticsRead => "gateway.diagnostics.read",
            AccessScope::JrlRead => "gateway.jrl.read",
        }
    }

    /// Whether a grant of `self` covers `required`
    pub fn grants(&self, required: AccessScope) -> bool {
        *self == AccessScope::Wildcard || *self == required
    }
}

impl fmt::Display for AccessScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeClaims {
    pub jti: Uuid,
    pub exp: i64,
    pub scope: AccessScope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcClaims {
    pub jti: Uuid,
    pub exp: i64,
    pub krb_realm: String,
    pub krb_kdc: TargetAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JrlClaims {
    pub jti: Uuid,
    pub iat: i64,
    pub jrl: HashMap<String, Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeClaims {
    pub jti: Uuid,
    pub exp: i64,
    pub target_host: TargetAddr,
    pub association_id: Option<Uuid>,
    pub application_protocol: ApplicationProtocol,
    pub recording: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccessTokenClaims {
    Association(AssociationClaims),
    Jmux(JmuxClaims),
    Scope(ScopeClaims),
    Kdc(KdcClaims),
    Jrl(JrlClaims),
    Bridge(BridgeClaims),
}

impl AccessTokenClaims {
    pub fn kind(&self) -> TokenKind {
        match self {
            AccessTokenClaims::Association(_) => TokenKind::Association,
            AccessTokenClaims::Jmux(_) => TokenKind::Jmux,
            AccessTokenClaims::Scope(_) => TokenKind::Scope,
            AccessTokenClaims::Kdc(_) => TokenKind::Kdc,
            AccessTokenClaims::Jrl(_) => TokenKind::Jrl,
            AccessTokenClaims::Bridge(_) => TokenKind::Bridge,
        }
    }

    pub fn jti(&self) -> Uuid {
        match self {
            AccessTokenClaims::Association(claims) => claims.jti,
            AccessTokenClaims::Jmux(claims) => claims.jti,
            AccessTokenClaims::Scope(claims) => claims.jti,
            AccessTokenClaims::Kdc(claims) => claims.jti,
            AccessTokenClaims::Jrl(claims) => claims.jti,
            AccessTokenClaims::Bridge(claims) => claims.jti,
        }
    }

    /// Decode the kind-specific payload.
    ///
    /// Errors are human-readable reasons, wrapped into `MalformedClaims` by
    /// the validator.
    pub(crate) fn decode(kind: TokenKind, payload: serde_json::Value) -> Result<Self, String> {
        match kind {
            TokenKind::Association => {
                let raw: RawAssociation = from_value(payload)?;
                raw.try_into().map(AccessTokenClaims::Association)
            }
            TokenKind::Jmux => {
                let raw: RawJmux = from_value(payload)?;
                raw.try_into().map(AccessTokenClaims::Jmux)
            }
            TokenKind::Scope => {
                let raw: RawScope = from_value(payload)?;
                Ok(AccessTokenClaims::Scope(ScopeClaims {
                    jti: raw.jti,
                    exp: raw.exp,
                    scope: raw.scope,
                }))
            }
            TokenKind::Kdc => {
                let raw: RawKdc = from_value(payload)?;
                let krb_kdc = TargetAddr::parse(&raw.krb_kdc, Some(KDC_DEFAULT_PORT))
                    .map_err(|e| format!("krb_kdc: {e}"))?;
                Ok(AccessTokenClaims::Kdc(KdcClaims {
                    jti: raw.jti,
                    exp: raw.exp,
                    krb_realm: raw.krb_realm,
                    krb_kdc,
                }))
            }
            TokenKind::Jrl => from_value(payload).map(AccessTokenClaims::Jrl),
            TokenKind::Bridge => {
                let raw: RawBridge = from_value(payload)?;
                let application_protocol = raw
                    .jet_ap
                    .as_deref()
                    .map(ApplicationProtocol::new)
                    .unwrap_or_else(ApplicationProtocol::unknown);
                let target_host =
                    TargetAddr::parse(&raw.target_host, application_protocol.default_port())
                        .map_err(|e| format!("target_host: {e}"))?;
                Ok(AccessTokenClaims::Bridge(BridgeClaims {
                    jti: raw.jti,
                    exp: raw.exp,
                    target_host,
                    association_id: raw.jet_aid,
                    application_protocol,
                    recording: raw.jet_rec,
                }))
            }
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| e.to_string())
}

#[derive(Deserialize)]
struct RawAssociation {
    jti: Uuid,
    exp: i64,
    jet_aid: Uuid,
    jet_ap: Option<String>,
    jet_cm: String,
    dst_hst: Option<String>,
    #[serde(default)]
    dst_alt: Vec<String>,
    #[serde(default)]
    jet_rec: bool,
    #[serde(default)]
    jet_flt: bool,
    jet_ct: Option<ConnectionTest>,
    jet_ttl: Option<u64>,
    #[serde(flatten)]
    credentials: Credentials,
}

impl TryFrom<RawAssociation> for AssociationClaims {
    type Error = String;

    fn try_from(raw: RawAssociation) -> Result<Self, Self::Error> {
        let application_protocol = raw
            .jet_ap
            .as_deref()
            .map(ApplicationProtocol::new)
            .unwrap_or_else(ApplicationProtocol::unknown);
        let default_port = application_protocol.default_port();

        let connection_mode = match raw.jet_cm.as_str() {
            "rdv" => ConnectionMode::Rendezvous,
            "fwd" => {
                let primary = raw
                    .dst_hst
                    .as_deref()
                    .ok_or_else(|| "dst_hst is required in fwd mode".to_owned())?;
                let targets = std::iter::once(primary)
                    .chain(raw.dst_alt.iter().map(String::as_str))
                    .map(|target| TargetAddr::parse(target, default_port))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| format!("destination: {e}"))?;
                ConnectionMode::Forward { targets }
            }
            other => return Err(format!("unknown jet_cm {other:?}")),
        };

        let credentials = (!raw.credentials.is_empty()).then_some(raw.credentials);

        Ok(Self {
            jti: raw.jti,
            exp: raw.exp,
            association_id: raw.jet_aid,
            application_protocol,
            connection_mode,
            recording: raw.jet_rec,
            filtering: raw.jet_flt,
            connection_test: raw.jet_ct,
            session_ttl_minutes: raw.jet_ttl,
            credentials,
        })
    }
}

#[derive(Deserialize)]
struct RawJmux {
    jti: Uuid,
    exp: i64,
    jet_aid: Uuid,
    jet_ap: Option<String>,
    dst_hst: String,
    #[serde(default)]
    dst_addl: Vec<String>,
    #[serde(default)]
    jet_rec: bool,
    jet_ttl: Option<u64>,
}

impl TryFrom<RawJmux> for JmuxClaims {
    type Error = String;

    fn try_from(raw: RawJmux) -> Result<Self, Self::Error> {
        let application_protocol = raw
            .jet_ap
            .as_deref()
            .map(ApplicationProtocol::new)
            .unwrap_or_else(ApplicationProtocol::unknown);
        let default_port = application_protocol.default_port();

        let destination = TargetAddr::parse(&raw.dst_hst, default_port)
            .map_err(|e| format!("dst_hst: {e}"))?;
        let additional = raw
            .dst_addl
            .iter()
            .map(|target| TargetAddr::parse(target, default_port))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("dst_addl: {e}"))?;

        Ok(Self {
            jti: raw.jti,
            exp: raw.exp,
            association_id: raw.jet_aid,
            application_protocol,
            destination,
            additional,
            recording: raw.jet_rec,
            session_ttl_minutes: raw.jet_ttl,
        })
    }
}

#[derive(Deserialize)]
struct RawScope {
    jti: Uuid,
    exp: i64,
    scope: AccessScope,
}

#[derive(Deserialize)]
struct RawKdc {
    jti: Uuid,
    exp: i64,
    krb_realm: String,
    krb_kdc: String,
}

#[derive(Deserialize)]
struct RawBridge {
    jti: Uuid,
    exp: i64,
    target_host: String,
    jet_aid: Option<Uuid>,
    jet_ap: Option<String>,
    #[serde(default)]
    jet_rec: bool,
}
