// TailParser — wraps the upstream body stream: copies bytes to the client
// verbatim, maintains a bounded trailing buffer, and on EOF extracts the
// terminal usage object for accounting.
//
// Grounded on the streaming SSE read loop in `engine/providers/openai.rs`
// (`chat_stream`'s `while let Some(result) = byte_stream.next().await`
// buffer-accumulation idiom) and on the schema-tolerant `Value` indexing
// used throughout the provider modules (unknown fields ignored, missing
// fields defaulted via `.as_str()`/`.as_u64()` with `unwrap_or`).

use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::warn;
use serde_json::Value;
use std::collections::VecDeque;

/// Retain only the last 4096 bytes of the stream for tail parsing.
const TAIL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct UsageRecord {
    pub model: String,
    pub prompt_eval_count: u64,
    pub eval_count: u64,
}

struct TailBuffer {
    buf: VecDeque<u8>,
}

impl TailBuffer {
    fn new() -> Self {
        Self {
            buf: VecDeque::with_capacity(TAIL_CAPACITY),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.buf.len() == TAIL_CAPACITY {
                self.buf.pop_front();
            }
            self.buf.push_back(b);
        }
    }

    fn as_bytes(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }
}

/// Decode the tail as lossy text, split on newlines, and scan in reverse
/// for the first line that is both brace-delimited and a qualifying usage
/// object (`done` truthy, or an `eval_count` field present).
pub fn extract_usage(tail: &[u8]) -> Option<UsageRecord> {
    let text = String::from_utf8_lossy(tail);
    for line in text.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') || !line.ends_with('}') {
            continue;
        }
        let Ok(v) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let done = v.get("done").and_then(Value::as_bool).unwrap_or(false);
        let has_eval_count = v.get("eval_count").is_some();
        if !done && !has_eval_count {
            continue;
        }
        return Some(UsageRecord {
            model: v
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            prompt_eval_count: v
                .get("prompt_eval_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            eval_count: v.get("eval_count").and_then(Value::as_u64).unwrap_or(0),
        });
    }
    None
}

/// Build a byte stream that mirrors `upstream` to the client while
/// accumulating a bounded tail buffer, invoking `on_complete` exactly once
/// with the extracted usage record (or `None`) when the stream ends.
///
/// Parse/extraction failures never propagate to the client: `on_complete`
/// always receives `Some`/`None`, never an error.
pub fn tail_parsing_stream(
    upstream: reqwest::Response,
    on_complete: impl FnOnce(Option<UsageRecord>) + Send + 'static,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let state = (
        upstream.bytes_stream(),
        TailBuffer::new(),
        Some(Box::new(on_complete) as Box<dyn FnOnce(Option<UsageRecord>) + Send>),
    );

    futures::stream::unfold(state, |(mut stream, mut tail, mut cb)| async move {
        match stream.next().await {
            Some(Ok(chunk)) => {
                tail.push(&chunk);
                Some((Ok(chunk), (stream, tail, cb)))
            }
            Some(Err(e)) => {
                warn!("[tail-parser] upstream body read error: {e}");
                if let Some(f) = cb.take() {
                    f(None);
                }
                Some((
                    Err(std::io::Error::other(e.to_string())),
                    (stream, tail, None),
                ))
            }
            None => {
                if let Some(f) = cb.take() {
                    let usage = extract_usage(&tail.as_bytes());
                    f(usage);
                }
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_done_true_object() {
        let tail = br#"{"response":"hi"}
{"done":true,"model":"m","prompt_eval_count":7,"eval_count":11}"#;
        let usage = extract_usage(tail).unwrap();
        assert_eq!(usage.model, "m");
        assert_eq!(usage.prompt_eval_count, 7);
        assert_eq!(usage.eval_count, 11);
    }

    #[test]
    fn extracts_eval_count_without_done() {
        let tail = br#"{"eval_count":3,"model":"x"}"#;
        let usage = extract_usage(tail).unwrap();
        assert_eq!(usage.model, "x");
        assert_eq!(usage.eval_count, 3);
    }

    #[test]
    fn defaults_missing_fields() {
        let tail = br#"{"done":true}"#;
        let usage = extract_usage(tail).unwrap();
        assert_eq!(usage.model, "unknown");
        assert_eq!(usage.prompt_eval_count, 0);
        assert_eq!(usage.eval_count, 0);
    }

    #[test]
    fn no_qualifying_object_returns_none() {
        let tail = br#"{"response":"partial"}
not json at all
{"other":"stuff"}"#;
        assert!(extract_usage(tail).is_none());
    }

    #[test]
    fn scans_lines_in_reverse_takes_last_match() {
        let tail = br#"{"done":true,"eval_count":1}
{"some":"noise"}
{"done":true,"eval_count":99}"#;
        let usage = extract_usage(tail).unwrap();
        assert_eq!(usage.eval_count, 99);
    }

    #[test]
    fn tail_buffer_retains_only_last_capacity_bytes() {
        let mut tail = TailBuffer::new();
        let filler = vec![b'a'; TAIL_CAPACITY + 100];
        tail.push(&filler);
        assert_eq!(tail.as_bytes().len(), TAIL_CAPACITY);
    }
}
