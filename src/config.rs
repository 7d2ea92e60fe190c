// Proxy configuration — one YAML file for the key pool, everything else
// from environment variables. Config is resolved once, fully, before any
// other subsystem spins up.

use crate::error::{ProxyError, ProxyResult};
use log::info;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    keys: Vec<String>,
}

pub struct Config {
    pub keys: Vec<String>,
    pub proxy_auth_token: Option<String>,
    pub allow_unauthenticated: bool,
    pub app_version: String,
    pub upstream_base_url: String,
    pub data_dir: std::path::PathBuf,
    pub port: u16,
}

impl Config {
    /// Load the key pool from `CONFIG_PATH` (default `config/config.yaml`)
    /// and the rest of the knobs from the environment. Aborts the process
    /// (returns an error the caller turns into `std::process::exit`) if the
    /// key pool is empty.
    pub fn load() -> ProxyResult<Self> {
        let config_path = std::env::var("CONFIG_PATH")
            .unwrap_or_else(|_| "config/config.yaml".to_string());

        let keys = Self::load_keys(&config_path)?;
        if keys.is_empty() {
            return Err(ProxyError::config(format!(
                "no keys loaded from {config_path} — at least one key is required"
            )));
        }
        info!("[config] Loaded {} key(s) from {}", keys.len(), config_path);

        let allow_unauthenticated = std::env::var("ALLOW_UNAUTHENTICATED_ACCESS")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let proxy_auth_token = std::env::var("PROXY_AUTH_TOKEN").ok();
        if proxy_auth_token.is_none() && !allow_unauthenticated {
            return Err(ProxyError::config(
                "PROXY_AUTH_TOKEN is required unless ALLOW_UNAUTHENTICATED_ACCESS=true",
            ));
        }

        let app_version = std::env::var("APP_VERSION").unwrap_or_else(|_| "dev".to_string());
        let upstream_base_url = std::env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| "https://ollama.com".to_string());
        let data_dir = std::env::var("DATA_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| std::path::PathBuf::from("data"));
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(11434);

        Ok(Config {
            keys,
            proxy_auth_token,
            allow_unauthenticated,
            app_version,
            upstream_base_url,
            data_dir,
            port,
        })
    }

    fn load_keys(path: &str) -> ProxyResult<Vec<String>> {
        if !Path::new(path).exists() {
            return Err(ProxyError::config(format!(
                "config file not found: {path}"
            )));
        }
        let raw = std::fs::read_to_string(path)?;
        let parsed: RawConfig = serde_yaml::from_str(&raw)?;
        Ok(parsed.keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_list() {
        let raw: RawConfig = serde_yaml::from_str("keys:\n  - abc\n  - def\n").unwrap();
        assert_eq!(raw.keys, vec!["abc".to_string(), "def".to_string()]);
    }

    #[test]
    fn missing_keys_field_defaults_empty() {
        let raw: RawConfig = serde_yaml::from_str("other: 1\n").unwrap();
        assert!(raw.keys.is_empty());
    }
}
