//! Management REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use jet_token::{AccessScope, AccessTokenClaims, Presentation, TokenError, TokenKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::association::{AssociationInfo, RegistryError};
use crate::auth::PushError;
use crate::bridge::{self, BridgeError};
use crate::candidate::{Candidate, Role};
use crate::config::{ListenerUrl, ServerConfig};
use crate::extract::{authorize, bearer_token, AuthzError};
use crate::jrl::{JrlError, JrlInfo};
use crate::kdc::{self, KdcError};
use crate::listener::{self, ListenerError, RelayContext};
use crate::negotiation::NegotiationState;
use crate::session::SessionInfo;
use crate::ws;

/// Largest request body accepted by the KDC proxy and the bridge
const MAX_BODY_LEN: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayContext,
    pub config: Arc<ServerConfig>,
    pub listeners: Arc<Vec<ListenerUrl>>,
    pub metrics: Arc<crate::metrics::RelayMetrics>,
    pub http_client: reqwest::Client,
}

/// Error answered as `{"error": ...}` with a status code
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Kdc(#[from] KdcError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Jrl(#[from] JrlError),
    #[error("{1}")]
    Status(StatusCode, String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Authz(e) => e.status(),
            ApiError::Registry(e) => {
                StatusCode::from_u16(e.status().0).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::Kdc(
                KdcError::UnsupportedScheme(_) | KdcError::BadFrame | KdcError::Message(_) | KdcError::RealmMissing,
            ) => StatusCode::BAD_REQUEST,
            ApiError::Kdc(KdcError::RealmMismatch(_)) => StatusCode::FORBIDDEN,
            ApiError::Kdc(KdcError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Kdc(_) => StatusCode::BAD_GATEWAY,
            ApiError::Bridge(e) => e.status(),
            ApiError::Jrl(JrlError::StaleRevocationList { .. }) => StatusCode::CONFLICT,
            ApiError::Jrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Status(status, _) => *status,
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        ApiError::Authz(AuthzError::Token(e))
    }
}

impl From<PushError> for ApiError {
    fn from(e: PushError) -> Self {
        match e {
            PushError::Token(e) => e.into(),
            PushError::Jrl(e) => ApiError::Jrl(e),
        }
    }
}

impl From<ListenerError> for ApiError {
    fn from(e: ListenerError) -> Self {
        match e {
            ListenerError::Token(e) => e.into(),
            ListenerError::Registry(e) => ApiError::Registry(e),
            other => ApiError::Status(StatusCode::FORBIDDEN, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(%status, error = %self, "API request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jet/health", get(health))
        .route("/jet/diagnostics/clock", get(clock))
        .route("/jet/diagnostics/configuration", get(configuration))
        .route("/jet/diagnostics/logs", get(logs))
        .route("/jet/metrics", get(metrics))
        .route("/jet/sessions", get(list_sessions))
        .route("/jet/sessions/recent", get(recent_sessions))
        .route("/jet/session/:id/terminate", post(terminate_session))
        .route("/jet/associations", get(list_associations))
        .route("/jet/association/:id", post(create_association))
        .route("/jet/jrl", get(jrl_info).post(push_jrl))
        .route("/jet/jrl/info", get(jrl_info))
        .route("/jet/KdcProxy/:token", post(kdc_proxy))
        .route("/jet/bridge/message", post(bridge_message))
        .route("/jet/fwd/tcp/:id", get(fwd_tcp))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Identity {
    id: Uuid,
    hostname: String,
    version: &'static str,
}

impl Identity {
    fn of(config: &ServerConfig) -> Self {
        Self {
            id: config.instance_id(),
            hostname: config.hostname.clone(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<Identity> {
    Json(Identity::of(&state.config))
}

#[derive(Debug, Serialize)]
struct Clock {
    timestamp_secs: i64,
    timestamp_millis: i64,
}

async fn clock() -> Json<Clock> {
    let now = Utc::now();
    Json(Clock {
        timestamp_secs: now.timestamp(),
        timestamp_millis: now.timestamp_millis(),
    })
}

#[derive(Debug, Serialize)]
struct Configuration {
    #[serde(flatten)]
    identity: Identity,
    listeners: Vec<String>,
}

async fn configuration(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Configuration>> {
    authorize(&state.relay.authority, &headers, AccessScope::DiagnosticsRead)?;
    Ok(Json(Configuration {
        identity: Identity::of(&state.config),
        listeners: state.listeners.iter().map(ToString::to_string).collect(),
    }))
}

async fn logs(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<String> {
    authorize(&state.relay.authority, &headers, AccessScope::DiagnosticsRead)?;
    let path = state
        .config
        .log_file
        .as_ref()
        .ok_or_else(|| ApiError::Status(StatusCode::NOT_FOUND, "File logging is disabled".to_owned()))?;
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ApiError::Status(StatusCode::NOT_FOUND, format!("Log file unavailable: {e}")))
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    authorize(&state.relay.authority, &headers, AccessScope::DiagnosticsRead)?;
    let text = state
        .metrics
        .export()
        .map_err(|e| ApiError::Status(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}

async fn list_sessions(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<SessionInfo>>> {
    authorize(&state.relay.authority, &headers, AccessScope::SessionsRead)?;
    Ok(Json(state.relay.registry.sessions().list()))
}

async fn recent_sessions(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<SessionInfo>>> {
    authorize(&state.relay.authority, &headers, AccessScope::SessionsRead)?;
    Ok(Json(state.relay.registry.sessions().recent()))
}

async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state.relay.authority, &headers, AccessScope::SessionTerminate)?;
    if state.relay.registry.sessions().get(id).is_none() {
        return Err(ApiError::Status(StatusCode::NOT_FOUND, format!("No running session {id}")));
    }
    state.relay.registry.terminate(id)?;
    info!(session_id = %id, "Session terminated through the API");
    Ok(Json(json!({ "id": id, "terminated": true })))
}

async fn list_associations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<AssociationInfo>>> {
    authorize(&state.relay.authority, &headers, AccessScope::AssociationsRead)?;
    Ok(Json(state.relay.registry.list()))
}

#[derive(Debug, Serialize)]
struct AssociationCreated {
    id: Uuid,
    #[serde(flatten)]
    state: NegotiationState,
    candidates_urls: Vec<String>,
}

async fn create_association(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<AssociationCreated>> {
    let token = bearer_token(&headers).ok_or(AuthzError::MissingToken)?;
    let claims = listener::association_claims(&state.relay.authority, token, Presentation::plain())?;
    if claims.association_id != id {
        return Err(ApiError::from(ListenerError::AssociationMismatch {
            token: claims.association_id,
            requested: id,
        }));
    }

    let handle = state.relay.registry.open(claims).await?;
    Ok(Json(AssociationCreated {
        id,
        state: handle.state(),
        candidates_urls: candidate_urls(&state, id),
    }))
}

/// Where peers can reach the relay for association `id`
fn candidate_urls(state: &AppState, id: Uuid) -> Vec<String> {
    let host = &state.config.hostname;
    let mut urls: Vec<String> = state
        .listeners
        .iter()
        .map(|url| format!("{}://{}:{}", url.scheme, host, url.addr.port()))
        .collect();
    urls.push(format!(
        "ws://{}:{}/jet/fwd/tcp/{id}",
        host,
        state.config.http_listener.port()
    ));
    urls
}

async fn jrl_info(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<JrlInfo>> {
    authorize(&state.relay.authority, &headers, AccessScope::JrlRead)?;
    Ok(Json(state.relay.authority.jrl().info()))
}

async fn push_jrl(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<JrlInfo>> {
    let token = bearer_token(&headers).ok_or(AuthzError::MissingToken)?;
    let info = state.relay.authority.push_jrl(token, Presentation::plain()).await?;
    info!(jti = ?info.jti, iat = info.iat, "Revocation list updated");
    Ok(Json(info))
}

async fn kdc_proxy(State(state): State<AppState>, Path(token): Path<String>, body: Bytes) -> ApiResult<Response> {
    let AccessTokenClaims::Kdc(claims) =
        state
            .relay
            .authority
            .validate(&token, Some(TokenKind::Kdc), Presentation::plain())?
    else {
        return Err(TokenError::MalformedClaims("not a KDC token".to_owned()).into());
    };
    if body.len() > MAX_BODY_LEN {
        return Err(ApiError::Status(StatusCode::PAYLOAD_TOO_LARGE, "Kerberos message too large".to_owned()));
    }

    let reply = kdc::proxy(&claims, &body, state.config.dial_timeout()).await?;
    Ok(([(header::CONTENT_TYPE, "application/kerberos")], reply).into_response())
}

async fn bridge_message(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> ApiResult<Response> {
    let token = bridge::bridge_token(&headers).ok_or(AuthzError::MissingToken)?;
    let AccessTokenClaims::Bridge(claims) =
        state
            .relay
            .authority
            .validate(token, Some(TokenKind::Bridge), Presentation::plain())?
    else {
        return Err(TokenError::MalformedClaims("not a bridge token".to_owned()).into());
    };

    let response = bridge::forward(&state.http_client, &claims, method, headers, query.as_deref(), body).await?;
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct FwdParams {
    token: String,
    #[serde(default)]
    role: Option<Role>,
}

async fn fwd_tcp(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<FwdParams>,
    peer: Option<ConnectInfo<SocketAddr>>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let claims = listener::association_claims(&state.relay.authority, &params.token, Presentation::plain())?;
    if claims.association_id != id {
        return Err(ApiError::from(ListenerError::AssociationMismatch {
            token: claims.association_id,
            requested: id,
        }));
    }

    let role = params.role.unwrap_or(Role::Client);
    let peer = peer.map_or_else(|| "websocket".to_owned(), |ConnectInfo(addr)| addr.to_string());
    let relay = state.relay.clone();

    Ok(upgrade.on_upgrade(move |socket| async move {
        let candidate = Candidate::new(role, ws::into_stream(socket), peer.clone());
        debug!(association_id = %id, %role, %peer, "WebSocket candidate connected");
        if let Err(error) = listener::join(&relay, claims, candidate).await {
            debug!(association_id = %id, %error, "WebSocket candidate rejected");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{AssociationRegistry, NegotiationConfig};
    use crate::auth::test_support::{authority_with, mint, now};
    use crate::forwarder::Forwarder;
    use crate::jrl::JrlStore;
    use crate::metrics::RelayMetrics;
    use crate::session::SessionManager;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        let registry = Arc::new(AssociationRegistry::new(
            NegotiationConfig::default(),
            Forwarder::new(None, Arc::clone(&metrics)),
            SessionManager::new(8),
            Arc::clone(&metrics),
        ));
        let authority = authority_with(Arc::new(JrlStore::in_memory()), Arc::clone(&metrics));
        let config = ServerConfig {
            hostname: "relay.test".to_owned(),
            ..ServerConfig::default()
        };
        let listeners = config.listener_urls().unwrap();

        router(AppState {
            relay: RelayContext { authority, registry },
            config: Arc::new(config),
            listeners: Arc::new(listeners),
            metrics,
            http_client: reqwest::Client::new(),
        })
    }

    fn request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_clock_need_no_token() {
        let app = app();

        let response = app.clone().oneshot(request(Method::GET, "/jet/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["hostname"], "relay.test");

        let response = app.oneshot(request(Method::GET, "/jet/diagnostics/clock", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["timestamp_secs"].as_i64().unwrap() >= now() - 5);
    }

    #[tokio::test]
    async fn test_sessions_read_scope() {
        let app = app();
        let token = mint(TokenKind::Scope, json!({ "scope": "gateway.sessions.read" }));

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/jet/sessions", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await.as_array().unwrap().is_empty());

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/jet/jrl", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(request(Method::GET, "/jet/associations", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let response = app().oneshot(request(Method::GET, "/jet/sessions", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_jrl_push_then_read() {
        let app = app();
        let jti = Uuid::new_v4();
        let jrl = mint(
            TokenKind::Jrl,
            json!({ "jti": jti, "iat": now(), "jrl": { "jti": [Uuid::new_v4()] } }),
        );

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/jet/jrl", Some(&jrl)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let reader = mint(TokenKind::Scope, json!({ "scope": "gateway.jrl.read" }));
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/jet/jrl", Some(&reader)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["jti"], jti.to_string());

        // same iat again is stale
        let stale = mint(
            TokenKind::Jrl,
            json!({ "iat": body["iat"], "jrl": {} }),
        );
        let response = app
            .oneshot(request(Method::POST, "/jet/jrl", Some(&stale)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_create_association_and_list() {
        let app = app();
        let aid = Uuid::new_v4();
        let token = mint(
            TokenKind::Association,
            json!({ "jet_aid": aid, "jet_ap": "rdp", "jet_cm": "rdv" }),
        );

        let response = app
            .clone()
            .oneshot(request(Method::POST, &format!("/jet/association/{}", Uuid::new_v4()), Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(request(Method::POST, &format!("/jet/association/{aid}"), Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["id"], aid.to_string());
        assert_eq!(body["state"], "awaiting_candidates");
        assert!(body["candidates_urls"][0].as_str().unwrap().starts_with("tcp://relay.test:"));

        let reader = mint(TokenKind::Scope, json!({ "scope": "gateway.associations.read" }));
        let response = app
            .oneshot(request(Method::GET, "/jet/associations", Some(&reader)))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], aid.to_string());
    }

    #[tokio::test]
    async fn test_terminate_unknown_session() {
        let token = mint(TokenKind::Scope, json!({ "scope": "gateway.session.terminate" }));
        let response = app()
            .oneshot(request(
                Method::POST,
                &format!("/jet/session/{}/terminate", Uuid::new_v4()),
                Some(&token),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logs_without_file_logging() {
        let token = mint(TokenKind::Scope, json!({ "scope": "gateway.diagnostics.read" }));
        let response = app()
            .oneshot(request(Method::GET, "/jet/diagnostics/logs", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_export() {
        let token = mint(TokenKind::Scope, json!({ "scope": "*" }));
        let response = app()
            .oneshot(request(Method::GET, "/jet/metrics", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("jet_relay_"));
    }

    #[tokio::test]
    async fn test_kdc_proxy_rejects_other_tokens() {
        let token = mint(TokenKind::Scope, json!({ "scope": "*" }));
        let response = app()
            .oneshot(request(Method::POST, &format!("/jet/KdcProxy/{token}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    fn kdc_request(token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(format!("/jet/KdcProxy/{token}"))
            .header(header::CONTENT_TYPE, "application/kerberos")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_kdc_proxy_enforces_token_realm() {
        use crate::kdc::test_support::{framed, proxy_message};

        let token = mint(
            TokenKind::Kdc,
            json!({ "krb_realm": "EXAMPLE.COM", "krb_kdc": "tcp://127.0.0.1:1" }),
        );

        let response = app()
            .oneshot(kdc_request(&token, proxy_message(&framed(b"as-req"), Some("OTHER.COM"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app()
            .oneshot(kdc_request(&token, proxy_message(&framed(b"as-req"), None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app().oneshot(kdc_request(&token, framed(b"as-req"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_kdc_proxy_relays_wrapped_reply() {
        use crate::kdc::test_support::{framed, proxy_message};
        use picky_krb::messages::KdcProxyMessage;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let kdc = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let kdc_addr = kdc.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = kdc.accept().await.unwrap();
            let len = stream.read_u32().await.unwrap() as usize;
            let mut request = vec![0u8; len];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request, b"as-req");
            stream.write_all(&framed(b"as-rep")).await.unwrap();
        });

        let token = mint(
            TokenKind::Kdc,
            json!({ "krb_realm": "EXAMPLE.COM", "krb_kdc": format!("tcp://{kdc_addr}") }),
        );
        let response = app()
            .oneshot(kdc_request(&token, proxy_message(&framed(b"as-req"), Some("example.com"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let reply = KdcProxyMessage::from_raw(&body[..]).unwrap();
        assert_eq!(reply.kerb_message.0 .0, framed(b"as-rep"));
    }
}
