// Dispatcher — per-request attempt loop: ask the Selector for a key,
// forward upstream with streaming, classify the response, update the
// PenaltyRegistry, and either retry with another key or hand the stream
// to the TailParser.
//
// Grounded on the retry-loop shape of `engine/providers/openai.rs::chat_stream`
// (attempt counter, per-attempt header/body build, status classification,
// retry-vs-return branching) generalized from "retry the same provider N
// times" to "retry across the key pool, excluding keys already tried".

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use log::{info, warn};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::auth::resolve_client_addr;
use crate::http_client::{is_retryable_5xx, parse_ratelimit_reset};
use crate::selector::KeySelector;
use crate::state::AppState;
use crate::tail_parser::tail_parsing_stream;

/// Rewrite an inbound path: `v1/...` and `api/...` are used verbatim; an
/// empty path becomes `api`; anything else is prefixed with `api/`.
pub fn rewrite_path(incoming: &str) -> String {
    let trimmed = incoming.trim_start_matches('/');
    if trimmed.starts_with("v1/") || trimmed.starts_with("api/") {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        "api".to_string()
    } else {
        format!("api/{trimmed}")
    }
}

fn build_upstream_url(base_url: &str, incoming_path: &str) -> String {
    let rewritten = rewrite_path(incoming_path);
    format!("{}/{}", base_url.trim_end_matches('/'), rewritten)
}

enum AttemptOutcome {
    /// Non-retryable: stream this response back to the client.
    Return(reqwest::Response),
    /// Retryable failure; loop continues.
    Retry,
}

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let client_addr = resolve_client_addr(&headers, peer);

    let path = uri.path().trim_start_matches('/').to_string();
    let query = uri.query().map(str::to_string);

    let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            warn!("[dispatcher] failed to buffer inbound body: {e}");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    // Archive the raw body and create the pre-dispatch RequestLog row.
    // Persistence failures are logged and swallowed — the proxy path
    // still succeeds.
    let archived_path = crate::archival::archive_body_best_effort(
        &state.config.data_dir,
        &client_addr,
        &body_bytes,
    );
    let request_log_id = state
        .usage
        .create_pending_request(
            &client_addr,
            method.as_str(),
            &path,
            archived_path.as_ref().and_then(|p| p.to_str()),
        )
        .unwrap_or(-1);

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let upstream_url = build_upstream_url(&state.config.upstream_base_url, &path);

    let mut attempted: HashSet<usize> = HashSet::new();
    // Only the most recent attempt's failure class decides 500 vs 503 —
    // not whether a transport error was ever seen across the whole loop.
    let mut last_failure: Option<String> = None;

    for _ in 0..state.keys.len() {
        let Some(i) = KeySelector::select(&state.keys, &state.penalties, &state.usage, &attempted)
        else {
            break;
        };
        attempted.insert(i);

        let credential = state.keys.credential(i).unwrap_or("").to_string();

        match attempt_once(
            &state,
            &method,
            &upstream_url,
            query.as_deref(),
            &body_bytes,
            &content_type,
            &credential,
            i,
        )
        .await
        {
            Ok(AttemptOutcome::Return(upstream_resp)) => {
                return stream_to_client(state, upstream_resp, client_addr, request_log_id, i);
            }
            Ok(AttemptOutcome::Retry) => {
                last_failure = None;
                continue;
            }
            Err(e) => {
                warn!("[dispatcher] transport error for key {i}: {e}");
                last_failure = Some(e);
            }
        }
    }

    exhausted_response(last_failure).into_response()
}

/// Decide the response once every key has been tried (or none remained to
/// try): 500 only when the most recent attempt was a transport exception,
/// 503 otherwise (rate-limited, 5xx, or no candidates left).
fn exhausted_response(last_failure: Option<String>) -> (StatusCode, String) {
    match last_failure {
        Some(err) => (StatusCode::INTERNAL_SERVER_ERROR, err),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "All API keys exhausted, rate-limited, or returned errors".to_string(),
        ),
    }
}

#[allow(clippy::too_many_arguments)]
async fn attempt_once(
    state: &Arc<AppState>,
    method: &Method,
    upstream_url: &str,
    query: Option<&str>,
    body_bytes: &axum::body::Bytes,
    content_type: &str,
    credential: &str,
    key_index: usize,
) -> Result<AttemptOutcome, String> {
    let now = Instant::now();
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);

    let mut builder = state
        .client
        .request(reqwest_method, upstream_url)
        .header("Authorization", format!("Bearer {credential}"))
        .header("Content-Type", content_type)
        .body(body_bytes.to_vec());

    if let Some(q) = query {
        builder = builder.query(&parse_query_pairs(q));
    }

    let resp = match builder.send().await {
        Ok(r) => r,
        Err(e) => {
            // Transport exception: treat like 5xx for retry purposes, but
            // do not advance the 5xx backoff level — a connection failure
            // is evidence about the network path, not the key.
            return Err(e.to_string());
        }
    };

    let status = resp.status().as_u16();

    if status == 429 {
        let hint = parse_ratelimit_reset(resp.headers().get("x-ratelimit-reset"));
        let duration = state.penalties.penalize_429(key_index, now, hint);
        info!(
            "[dispatcher] key {key_index} rate-limited, penalized for {:?}",
            duration
        );
        return Ok(AttemptOutcome::Retry);
    }

    if is_retryable_5xx(status) {
        let duration = state.penalties.penalize_5xx(key_index, now);
        info!(
            "[dispatcher] key {key_index} upstream {status}, penalized for {:?}",
            duration
        );
        return Ok(AttemptOutcome::Retry);
    }

    // 200 or other non-retryable (including other 4xx): clear penalty,
    // capture rate-limit headers, return for streaming.
    state.penalties.clear(key_index);
    state.ratelimits.capture(key_index, resp.headers());
    Ok(AttemptOutcome::Return(resp))
}

fn stream_to_client(
    state: Arc<AppState>,
    upstream_resp: reqwest::Response,
    client_addr: String,
    request_log_id: i64,
    key_index: usize,
) -> Response {
    let status = upstream_resp.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_resp.headers().iter() {
        response_headers.insert(name.clone(), value.clone());
    }

    let stream = tail_parsing_stream(upstream_resp, move |usage| {
        if let Some(record) = usage {
            if let Err(e) = state.usage.record(
                &client_addr,
                key_index,
                &record.model,
                record.prompt_eval_count,
                record.eval_count,
            ) {
                warn!("[tail-parser] failed to record usage: {e}");
            }
            if let Err(e) = state.usage.finalize_request(
                request_log_id,
                &record.model,
                record.prompt_eval_count,
                record.eval_count,
            ) {
                warn!("[tail-parser] failed to finalize request log: {e}");
            }
        }
    });

    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn parse_query_pairs(q: &str) -> Vec<(String, String)> {
    q.split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (
                urlencoding_decode(k),
                urlencoding_decode(v),
            ),
            None => (urlencoding_decode(pair), String::new()),
        })
        .collect()
}

fn urlencoding_decode(s: &str) -> String {
    percent_decode(s)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(
                    std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""),
                    16,
                ) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_rewrite_v1_used_verbatim() {
        assert_eq!(rewrite_path("v1/models"), "v1/models");
    }

    #[test]
    fn path_rewrite_api_used_verbatim() {
        assert_eq!(rewrite_path("api/generate"), "api/generate");
    }

    #[test]
    fn path_rewrite_empty_becomes_api() {
        assert_eq!(rewrite_path(""), "api");
        assert_eq!(rewrite_path("/"), "api");
    }

    #[test]
    fn path_rewrite_other_gets_prefixed() {
        assert_eq!(rewrite_path("chat"), "api/chat");
        assert_eq!(rewrite_path("models/list"), "api/models/list");
    }

    #[test]
    fn build_url_trims_trailing_slash() {
        let url = build_upstream_url("https://example.com/", "api/generate");
        assert_eq!(url, "https://example.com/api/generate");
    }

    #[test]
    fn query_pairs_decode_plus_and_percent() {
        let pairs = parse_query_pairs("a=1&b=hello+world&c=%2F");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "hello world".to_string()),
                ("c".to_string(), "/".to_string()),
            ]
        );
    }

    #[test]
    fn exhausted_response_is_500_when_last_attempt_was_transport_error() {
        let (status, _) = exhausted_response(Some("connection reset".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn exhausted_response_is_503_when_no_failure_recorded() {
        // Also the outcome when a transport error on an earlier key is
        // followed by a 429/5xx on the true last attempt: the loop clears
        // last_failure back to None on every Retry before the next attempt.
        let (status, _) = exhausted_response(None);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
