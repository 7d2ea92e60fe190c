// Shared upstream HTTP client + small helpers, grounded in
// `engine/http.rs`'s retry/status utilities. Unlike the provider clients
// there, the Dispatcher's upstream call has no overall timeout (streams
// may run long) — only the HealthWorker probe client carries a short one.

use reqwest::Client;
use std::sync::LazyLock;
use std::time::Duration;

/// One long-lived client, shared by the Dispatcher across all requests for
/// connection pooling and streaming stability.
static UPSTREAM_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build upstream reqwest::Client")
});

pub fn upstream_client() -> Client {
    UPSTREAM_CLIENT.clone()
}

/// A short-lived client for the HealthWorker's per-iteration probes.
pub fn probe_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build probe reqwest::Client")
}

pub fn is_retryable_5xx(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

/// Parse the `x-ratelimit-reset` header as a nonnegative integer seconds
/// hint. Non-numeric or missing values yield `None`.
pub fn parse_ratelimit_reset(header_value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    header_value?.to_str().ok()?.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_5xx_set() {
        assert!(is_retryable_5xx(500));
        assert!(is_retryable_5xx(502));
        assert!(is_retryable_5xx(503));
        assert!(is_retryable_5xx(504));
        assert!(!is_retryable_5xx(429));
        assert!(!is_retryable_5xx(200));
        assert!(!is_retryable_5xx(404));
    }

    #[test]
    fn parse_ratelimit_reset_valid() {
        let v = reqwest::header::HeaderValue::from_static("90");
        assert_eq!(parse_ratelimit_reset(Some(&v)), Some(90));
        let bad = reqwest::header::HeaderValue::from_static("soon");
        assert_eq!(parse_ratelimit_reset(Some(&bad)), None);
        assert_eq!(parse_ratelimit_reset(None), None);
    }
}
