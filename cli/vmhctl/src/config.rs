//! Configuration for the backend clients.
//!
//! Sources, lowest precedence first:
//! - built-in defaults and environment (`VMAPI_URL`/`VMAPI_IP`,
//!   `NAPI_URL`/`NAPI_IP`, `VMH_OWNER`)
//! - the JSON config file in the platform config directory, if present
//! - command-line flags (applied by the binary)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use vmh_id::OwnerUuid;

use crate::client::{ApiClient, RetryPolicy};
use crate::napi::NapiClient;
use crate::vmapi::VmapiClient;

/// Configuration file name.
const CONFIG_FILE: &str = "config.json";

/// Owner the lifecycle run acts for when none is configured.
pub const DEFAULT_OWNER: &str = "930896af-bf8c-48d4-885c-6573a94b1853";

const DEFAULT_VMAPI_IP: &str = "10.99.99.18";
const DEFAULT_NAPI_IP: &str = "10.99.99.10";

/// Get the config file path.
pub fn config_path() -> Result<PathBuf> {
    ProjectDirs::from("com", "vmh", "vmhctl")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Compute orchestration API endpoint.
    pub vmapi_url: String,

    /// Network inventory API endpoint.
    pub napi_url: String,

    /// Owner VMs are created for and queries are scoped to.
    pub owner_uuid: OwnerUuid,

    /// Total attempts per request, including the first.
    pub retry_max_attempts: u32,

    /// Minimum delay between attempts, in milliseconds.
    pub retry_min_backoff_ms: u64,

    /// Per-request timeout, in seconds.
    pub request_timeout_secs: u64,
}

fn url_from_env(url_var: &str, ip_var: &str, default_ip: &str) -> String {
    std::env::var(url_var).unwrap_or_else(|_| {
        let ip = std::env::var(ip_var).unwrap_or_else(|_| default_ip.to_string());
        format!("http://{ip}")
    })
}

fn default_owner() -> OwnerUuid {
    std::env::var("VMH_OWNER")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| DEFAULT_OWNER.parse().ok())
        .unwrap_or_default()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vmapi_url: url_from_env("VMAPI_URL", "VMAPI_IP", DEFAULT_VMAPI_IP),
            napi_url: url_from_env("NAPI_URL", "NAPI_IP", DEFAULT_NAPI_IP),
            owner_uuid: default_owner(),
            retry_max_attempts: 2,
            retry_min_backoff_ms: 1000,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load config from the default location, or return defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load config from `path`, or return defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", path))
    }

    /// Reject settings no client could work with.
    pub fn validate(&self) -> Result<()> {
        if self.retry_max_attempts == 0 {
            anyhow::bail!("retry_max_attempts must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }
        for (name, url) in [("vmapi_url", &self.vmapi_url), ("napi_url", &self.napi_url)] {
            let parsed = reqwest::Url::parse(url)
                .with_context(|| format!("Invalid {name} '{url}'"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("Invalid {name} '{url}': expected http or https");
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_min_backoff_ms),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Build the compute gateway.
    pub fn vmapi(&self) -> Result<VmapiClient> {
        let api = ApiClient::new(
            "vmapi",
            &self.vmapi_url,
            self.retry_policy(),
            self.request_timeout(),
        )?;
        Ok(VmapiClient::new(api))
    }

    /// Build the network inventory gateway.
    pub fn napi(&self) -> Result<NapiClient> {
        let api = ApiClient::new(
            "napi",
            &self.napi_url,
            self.retry_policy(),
            self.request_timeout(),
        )?;
        Ok(NapiClient::new(api))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            vmapi_url: "http://10.99.99.18".to_string(),
            napi_url: "http://10.99.99.10".to_string(),
            owner_uuid: DEFAULT_OWNER.parse().unwrap(),
            retry_max_attempts: 2,
            retry_min_backoff_ms: 1000,
            request_timeout_secs: 30,
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.vmapi_url.starts_with("http"));
        assert!(config.napi_url.starts_with("http"));
        assert_eq!(config.retry_max_attempts, 2);
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.retry_max_attempts = 0;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.vmapi_url = "10.99.99.18".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.napi_url = "ftp://10.99.99.10".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = config().retry_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.min_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("vmhctl-does-not-exist/config.json");
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.retry_max_attempts, Config::default().retry_max_attempts);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = std::env::temp_dir().join(format!("vmhctl-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, r#"{"vmapi_url": "http://127.0.0.1:8080", "retry_max_attempts": 4}"#)
            .unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.vmapi_url, "http://127.0.0.1:8080");
        assert_eq!(loaded.retry_max_attempts, 4);
        assert_eq!(loaded.request_timeout_secs, 30);

        fs::remove_dir_all(&dir).unwrap();
    }
}
