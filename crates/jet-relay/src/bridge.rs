//! HTTP bridge: forward one request to the host named by a bridge token

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use jet_token::{BridgeClaims, TargetAddr};
use thiserror::Error;
use tracing::debug;

pub const BRIDGE_TOKEN_HEADER: &str = "Gateway-Bridge-Token";

/// Request headers never forwarded to the target
const STRIPPED_REQUEST_HEADERS: [HeaderName; 5] = [
    header::HOST,
    header::AUTHORIZATION,
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Target scheme {0:?} cannot be bridged")]
    UnsupportedScheme(String),
    #[error("Bridge target failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::UnsupportedScheme(_) => StatusCode::BAD_REQUEST,
            BridgeError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Token from `Gateway-Bridge-Token`, falling back to the bearer token
pub fn bridge_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(BRIDGE_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .or_else(|| crate::extract::bearer_token(headers))
}

/// URL the request is sent to; `tcp` targets are reached over plain HTTP
pub fn target_url(target: &TargetAddr, query: Option<&str>) -> Result<String, BridgeError> {
    let scheme = match target.scheme() {
        "http" | "tcp" => "http",
        "https" => "https",
        other => return Err(BridgeError::UnsupportedScheme(other.to_owned())),
    };
    let mut url = format!("{scheme}://{}/", target.authority());
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    Ok(url)
}

/// Send the request to `target_host` and relay the answer
pub async fn forward(
    client: &reqwest::Client,
    claims: &BridgeClaims,
    method: Method,
    mut headers: HeaderMap,
    query: Option<&str>,
    body: Bytes,
) -> Result<Response, BridgeError> {
    let url = target_url(&claims.target_host, query)?;

    headers.remove(BRIDGE_TOKEN_HEADER);
    for name in &STRIPPED_REQUEST_HEADERS {
        headers.remove(name);
    }

    debug!(jti = %claims.jti, %method, %url, "Forwarding bridge request");
    let upstream = client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    response_headers.remove(header::TRANSFER_ENCODING);
    response_headers.remove(header::CONNECTION);
    let body = upstream.bytes().await?;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum::routing::post;
    use axum::Router;
    use jet_token::ApplicationProtocol;
    use uuid::Uuid;

    #[test]
    fn test_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(bridge_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(bridge_token(&headers), Some("from-bearer"));

        headers.insert(BRIDGE_TOKEN_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(bridge_token(&headers), Some("from-header"));
    }

    #[test]
    fn test_target_url() {
        let target = TargetAddr::parse("https://api.example", None).unwrap();
        assert_eq!(target_url(&target, Some("a=1")).unwrap(), "https://api.example:443/?a=1");

        let target = TargetAddr::parse("10.0.0.1:8080", None).unwrap();
        assert_eq!(target_url(&target, None).unwrap(), "http://10.0.0.1:8080/");

        let target = TargetAddr::parse("wss://host", None).unwrap();
        assert!(matches!(target_url(&target, None), Err(BridgeError::UnsupportedScheme(_))));
    }

    #[tokio::test]
    async fn test_forward_to_local_target() {
        let app = Router::new().route(
            "/",
            post(|headers: HeaderMap, body: Bytes| async move {
                assert!(headers.get(BRIDGE_TOKEN_HEADER).is_none());
                assert!(headers.get(header::AUTHORIZATION).is_none());
                (StatusCode::ACCEPTED, [("x-target", "yes")], body)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let claims = BridgeClaims {
            jti: Uuid::new_v4(),
            exp: 0,
            target_host: TargetAddr::parse(&format!("http://{addr}"), None).unwrap(),
            association_id: None,
            application_protocol: ApplicationProtocol::unknown(),
            recording: false,
        };
        let mut headers = HeaderMap::new();
        headers.insert(BRIDGE_TOKEN_HEADER, HeaderValue::from_static("secret"));

        let response = forward(
            &reqwest::Client::new(),
            &claims,
            Method::POST,
            headers,
            None,
            Bytes::from_static(b"ping"),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-target"], "yes");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ping");
    }
}
