use crate::config::Config;
use crate::health::HealthSnapshotCache;
use crate::keys::KeyStore;
use crate::penalty::PenaltyRegistry;
use crate::ratelimits::RateLimitCache;
use crate::usage::UsageLedger;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub keys: Arc<KeyStore>,
    pub penalties: Arc<PenaltyRegistry>,
    pub usage: Arc<UsageLedger>,
    pub ratelimits: RateLimitCache,
    pub health: Arc<HealthSnapshotCache>,
    pub client: reqwest::Client,
    pub health_stop: Arc<AtomicBool>,
}
