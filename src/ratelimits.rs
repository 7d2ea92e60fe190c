// Rate-limit header cache — shared mutable state alongside the
// PenaltyRegistry and HealthSnapshot. Populated by the Dispatcher
// whenever an upstream attempt is non-retryable (200 or other 4xx); read
// by the `/ratelimits` operator surface. Same discipline as
// PenaltyRegistry: a single lock held only across constant-time map
// operations.

use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RateLimitSnapshot {
    pub headers: HashMap<String, String>,
}

#[derive(Default)]
pub struct RateLimitCache {
    by_key: Mutex<HashMap<usize, RateLimitSnapshot>>,
}

impl RateLimitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture any `x-ratelimit-*` response headers for key `i`.
    pub fn capture(&self, i: usize, headers: &reqwest::header::HeaderMap) {
        let mut map = HashMap::new();
        for (name, value) in headers.iter() {
            let name_str = name.as_str();
            if name_str.starts_with("x-ratelimit-") {
                if let Ok(v) = value.to_str() {
                    map.insert(name_str.to_string(), v.to_string());
                }
            }
        }
        if !map.is_empty() {
            self.by_key
                .lock()
                .insert(i, RateLimitSnapshot { headers: map });
        }
    }

    pub fn snapshot(&self) -> HashMap<usize, RateLimitSnapshot> {
        self.by_key.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn captures_only_ratelimit_headers() {
        let cache = RateLimitCache::new();
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("10"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        cache.capture(0, &headers);
        let snap = cache.snapshot();
        let entry = snap.get(&0).unwrap();
        assert_eq!(entry.headers.get("x-ratelimit-remaining").unwrap(), "10");
        assert!(!entry.headers.contains_key("content-type"));
    }
}
