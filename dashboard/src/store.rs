use std::{io::ErrorKind, path::PathBuf};

use anyhow::Context;
use tracing::warn;

use dashboard_common::DashboardConfig;

const DEFAULT_CONFIG_PATH: &str = "./dashboard.json";

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_env() -> Self {
        let path = std::env::var("DASHBOARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::new(path)
    }

    /// A missing file yields the defaults.
    pub async fn load(&self) -> anyhow::Result<DashboardConfig> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice::<DashboardConfig>(&raw)
                .with_context(|| format!("failed to parse {}", self.path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DashboardConfig::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }
}

pub fn apply_env_overrides(config: &mut DashboardConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("DASHBOARD_BACKEND_URL") {
        config.backend_url = url;
    }
    if let Some(port) = lookup("DASHBOARD_HTTP_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.http_port = port;
    }
    if let Some(timezone) = lookup("DASHBOARD_TIMEZONE") {
        config.timezone = Some(timezone);
    }
}

/// File, then environment, then sanitize. An unreadable file is logged and
/// replaced by defaults.
pub async fn load_config() -> DashboardConfig {
    let store = ConfigStore::from_env();
    let mut config = store.load().await.unwrap_or_else(|err| {
        warn!("failed to load dashboard config: {err:#}");
        DashboardConfig::default()
    });
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.sanitize();
    config
}
