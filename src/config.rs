use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

fn default_cert_path() -> PathBuf {
    PathBuf::from("/etc/webhook/certs/svid.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/webhook/certs/svid_key.pem")
}

fn default_listen_addr() -> String {
    "[::]:8443".to_string()
}

fn default_cache_sync_timeout_seconds() -> u64 {
    60
}

fn default_shutdown_grace_period_seconds() -> u64 {
    5
}

#[derive(Deserialize, Clone, Debug)]
pub struct WebhookConfig {
    /// Certificate path for HTTPS
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// Certificate key path for HTTPS
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// How long the namespace controller waits for its cache before giving up
    #[serde(default = "default_cache_sync_timeout_seconds")]
    pub cache_sync_timeout_seconds: u64,
    /// How long in-flight HTTP requests may take to finish on shutdown
    #[serde(default = "default_shutdown_grace_period_seconds")]
    pub shutdown_grace_period_seconds: u64,
}

impl WebhookConfig {
    pub fn try_from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CONF_").from_env()
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_seconds)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_seconds)
    }
}
