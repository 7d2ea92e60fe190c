// InboundAuth — bearer-token check for inbound clients, implemented as an
// axum middleware. Grounded on the comparison-and-403 idiom in
// `engine/webchat/server.rs::handle_auth`, adapted to return an explicit
// result rather than writing a raw HTTP response by hand.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::state::AppState;

/// Resolve the client address: the first `X-Forwarded-For` entry if
/// present (trimmed), else the immediate peer address.
pub fn resolve_client_addr(headers: &HeaderMap, peer: std::net::SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    peer.ip().to_string()
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.config.allow_unauthenticated {
        return next.run(req).await;
    }

    match check_bearer(req.headers(), state.config.proxy_auth_token.as_deref()) {
        Ok(()) => next.run(req).await,
        Err(status) => status.into_response(),
    }
}

fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), StatusCode> {
    let Some(expected) = expected else {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let token = auth
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if token == expected {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn missing_header_is_unauthorized() {
        let headers = HeaderMap::new();
        assert_eq!(check_bearer(&headers, Some("tok")), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn mismatched_token_is_forbidden() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer wrong"));
        assert_eq!(check_bearer(&headers, Some("tok")), Err(StatusCode::FORBIDDEN));
    }

    #[test]
    fn matching_token_is_ok() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        assert_eq!(check_bearer(&headers, Some("tok")), Ok(()));
    }

    #[test]
    fn client_addr_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 5.6.7.8 , 9.9.9.9"));
        let peer: std::net::SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(resolve_client_addr(&headers, peer), "5.6.7.8");
    }

    #[test]
    fn client_addr_falls_back_to_peer() {
        let headers = HeaderMap::new();
        let peer: std::net::SocketAddr = "10.0.0.1:1234".parse().unwrap();
        assert_eq!(resolve_client_addr(&headers, peer), "10.0.0.1");
    }
}
