// HealthWorker — periodic background probe of each key, updating the
// PenaltyRegistry and a cached HealthSnapshot exposed on /health/keys.
//
// Grounded on `engine/memory/ollama.rs`'s reachability-probe idiom
// (`client.get(...).timeout(...).send().await`, match on status/transport
// error) and on the 60s cron-heartbeat loop shape in `lib.rs` — here
// expressed as a plain `tokio::spawn`'d loop with a cancellation flag
// instead of a framework-level event.

use crate::http_client::probe_client;
use crate::keys::KeyStore;
use crate::penalty::PenaltyRegistry;
use crate::usage::UsageLedger;
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct HealthEntry {
    pub status_label: String,
    pub penalty_active: bool,
    pub expires_in_seconds: i64,
    pub backoff_level: u8,
    pub usage_2h: i64,
}

#[derive(Default)]
pub struct HealthSnapshotCache {
    inner: Mutex<HashMap<usize, HealthEntry>>,
}

impl HealthSnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<usize, HealthEntry> {
        self.inner.lock().clone()
    }

    fn set(&self, i: usize, entry: HealthEntry) {
        self.inner.lock().insert(i, entry);
    }
}

pub struct HealthWorker {
    keys: Arc<KeyStore>,
    penalties: Arc<PenaltyRegistry>,
    usage: Arc<UsageLedger>,
    upstream_base_url: String,
    snapshot: Arc<HealthSnapshotCache>,
    stop: Arc<AtomicBool>,
}

impl HealthWorker {
    pub fn new(
        keys: Arc<KeyStore>,
        penalties: Arc<PenaltyRegistry>,
        usage: Arc<UsageLedger>,
        upstream_base_url: String,
        snapshot: Arc<HealthSnapshotCache>,
    ) -> Self {
        Self {
            keys,
            penalties,
            usage,
            upstream_base_url,
            snapshot,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run the infinite 60s-interval loop. Spawned at startup, cancelled at
    /// shutdown via the stop flag.
    pub async fn run(self) {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.run_iteration(false).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }

    /// One iteration: probe every non-penalized key (or every key, if
    /// `force`), concurrently, then publish a fresh snapshot annotated with
    /// usage_2h.
    pub async fn run_iteration(&self, force: bool) {
        let now = Instant::now();
        let client = probe_client();

        let mut handles = Vec::new();
        for i in self.keys.indices() {
            let penalized = !force && self.penalties.is_penalized(i, now);
            if penalized {
                continue;
            }
            let credential = self.keys.credential(i).unwrap_or("").to_string();
            let url = self.upstream_base_url.clone();
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let status = probe_key(&client, &url, &credential).await;
                (i, status)
            }));
        }

        let mut probed_labels: HashMap<usize, String> = HashMap::new();
        for handle in handles {
            if let Ok((i, status)) = handle.await {
                probed_labels.insert(i, Self::status_label(&status));
                self.apply_probe_result(i, status, now);
            }
        }

        self.publish_snapshot(now, &probed_labels);
    }

    fn apply_probe_result(&self, i: usize, status: ProbeStatus, now: Instant) {
        match status {
            ProbeStatus::Ok => {
                self.penalties.clear(i);
            }
            ProbeStatus::RateLimited(hint) => {
                self.penalties.penalize_429(i, now, hint);
            }
            ProbeStatus::Error(_) | ProbeStatus::Offline => {
                // Other-status and transport-exception probes don't touch
                // the penalty box.
            }
        }
    }

    fn status_label(status: &ProbeStatus) -> String {
        match status {
            ProbeStatus::Ok => "OK".to_string(),
            ProbeStatus::RateLimited(_) => "RATE LIMITED".to_string(),
            ProbeStatus::Error(code) => format!("ERROR {code}"),
            ProbeStatus::Offline => "OFFLINE".to_string(),
        }
    }

    /// `probed_labels` carries the actual probe outcome's status label for
    /// every key probed this iteration (keyed by index), so that a
    /// non-429 error or a transport failure — neither of which touches the
    /// PenaltyRegistry — still shows as "ERROR <code>"/"OFFLINE" rather
    /// than being inferred as "OK" from penalty state alone. Keys skipped
    /// this iteration (already penalized, not forced) fall back to a label
    /// derived from their penalty state.
    fn publish_snapshot(&self, now: Instant, probed_labels: &HashMap<usize, String>) {
        let candidates: Vec<usize> = self.keys.indices().collect();
        let usage_map = self.usage.usage_2h(&candidates).unwrap_or_default();
        for i in candidates {
            let penalty = self.penalties.snapshot_one(i, now);
            let usage_2h = usage_map.get(&i).copied().unwrap_or(0);
            let label = if let Some(probed) = probed_labels.get(&i) {
                probed.clone()
            } else if penalty.penalty_active {
                if penalty.backoff_level_429 > 0 && penalty.backoff_level_5xx == 0 {
                    "RATE LIMITED".to_string()
                } else {
                    "PENALIZED".to_string()
                }
            } else {
                "OK".to_string()
            };
            self.snapshot.set(
                i,
                HealthEntry {
                    status_label: label,
                    penalty_active: penalty.penalty_active,
                    expires_in_seconds: penalty.expires_in_seconds,
                    backoff_level: penalty.backoff_level_429.max(penalty.backoff_level_5xx),
                    usage_2h,
                },
            );
        }
    }

    /// Operator reset: clear all penalty state, then synchronously probe
    /// and update the snapshot entry in place. A 429 on the probe
    /// immediately re-enters level 0 of the 429 ladder.
    pub async fn reset_key(&self, i: usize) {
        self.penalties.reset(i);
        let now = Instant::now();
        let credential = self.keys.credential(i).unwrap_or("").to_string();
        let client = probe_client();
        let status = probe_key(&client, &self.upstream_base_url, &credential).await;
        let label = Self::status_label(&status);
        self.apply_probe_result(i, status, now);
        let penalty = self.penalties.snapshot_one(i, now);
        let usage_2h = self.usage.usage_2h(&[i]).unwrap_or_default().get(&i).copied().unwrap_or(0);
        self.snapshot.set(
            i,
            HealthEntry {
                status_label: label,
                penalty_active: penalty.penalty_active,
                expires_in_seconds: penalty.expires_in_seconds,
                backoff_level: penalty.backoff_level_429.max(penalty.backoff_level_5xx),
                usage_2h,
            },
        );
    }

    /// Operator force-penalize: overwrite the snapshot entry to reflect the
    /// new expiry.
    pub fn force_penalize_key(&self, i: usize) {
        let now = Instant::now();
        self.penalties.force_penalize(i, now);
        let penalty = self.penalties.snapshot_one(i, now);
        let usage_2h = self.usage.usage_2h(&[i]).unwrap_or_default().get(&i).copied().unwrap_or(0);
        self.snapshot.set(
            i,
            HealthEntry {
                status_label: "PENALIZED".to_string(),
                penalty_active: penalty.penalty_active,
                expires_in_seconds: penalty.expires_in_seconds,
                backoff_level: penalty.backoff_level_429.max(penalty.backoff_level_5xx),
                usage_2h,
            },
        );
    }
}

enum ProbeStatus {
    Ok,
    RateLimited(Option<u64>),
    Error(u16),
    Offline,
}

/// Issue a minimal generation request against the upstream with a 10s
/// total timeout (carried by `probe_client()`).
async fn probe_key(client: &reqwest::Client, base_url: &str, credential: &str) -> ProbeStatus {
    let url = format!("{}/api/generate", base_url.trim_end_matches('/'));
    let body = serde_json::json!({"model": "health-check", "prompt": "", "stream": false});

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {credential}"))
        .json(&body)
        .send()
        .await;

    match resp {
        Ok(r) => {
            let status = r.status().as_u16();
            if status == 200 {
                ProbeStatus::Ok
            } else if status == 429 {
                let hint = crate::http_client::parse_ratelimit_reset(
                    r.headers().get("x-ratelimit-reset"),
                );
                ProbeStatus::RateLimited(hint)
            } else {
                ProbeStatus::Error(status)
            }
        }
        Err(e) => {
            warn!("[health] probe transport error: {e}");
            ProbeStatus::Offline
        }
    }
}

pub fn spawn(worker: HealthWorker) -> tokio::task::JoinHandle<()> {
    info!("[health] Starting background health worker (60s interval)");
    tokio::spawn(worker.run())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_label_formats_error_code() {
        assert_eq!(HealthWorker::status_label(&ProbeStatus::Error(503)), "ERROR 503");
        assert_eq!(HealthWorker::status_label(&ProbeStatus::Ok), "OK");
        assert_eq!(HealthWorker::status_label(&ProbeStatus::Offline), "OFFLINE");
    }

    #[tokio::test]
    async fn force_penalize_updates_snapshot() {
        let keys = Arc::new(KeyStore::new(vec!["a".into()]));
        let penalties = Arc::new(PenaltyRegistry::new());
        let usage = Arc::new(UsageLedger::open_in_memory().unwrap());
        let snapshot = Arc::new(HealthSnapshotCache::new());
        let worker = HealthWorker::new(
            keys,
            penalties,
            usage,
            "http://127.0.0.1:0".to_string(),
            snapshot.clone(),
        );
        worker.force_penalize_key(0);
        let snap = snapshot.snapshot();
        assert!(snap.get(&0).unwrap().penalty_active);
    }
}
