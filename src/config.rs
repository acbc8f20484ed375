//! Service configuration
//!
//! Settings are read from the environment (a local `.env` is honored for
//! development). Everything has a sensible default except the collaborator
//! and archive endpoints, which are optional integrations.

use crate::error::{Error, Result};
use crate::persist::PersistConfig;
use dotenvy::dotenv;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Settings for one service instance
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Interface to bind
    pub host: String,
    /// Port to bind
    pub port: u16,
    /// Directory of pipeline YAML documents loaded at startup
    pub pipeline_dir: Option<PathBuf>,
    /// Base URL of the external agent collaborator service
    pub collaborator_url: Option<Url>,
    /// Endpoint completed records are archived to
    pub archive_url: Option<Url>,
    /// Attempt budget for the archive call
    pub archive_attempts: u32,
    /// Events retained by the bus
    pub history_cap: usize,
    /// Snapshot frames per status-stream subscription
    pub max_stream_events: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8700,
            pipeline_dir: None,
            collaborator_url: None,
            archive_url: None,
            archive_attempts: 3,
            history_cap: 256,
            max_stream_events: 64,
        }
    }
}

impl ServiceConfig {
    /// Load the configuration from the environment.
    ///
    /// Reads `ATELIER_HOST`, `ATELIER_PORT`, `ATELIER_PIPELINE_DIR`,
    /// `ATELIER_AGENT_SERVICE_URL`, `ATELIER_ARCHIVE_URL`,
    /// `ATELIER_ARCHIVE_ATTEMPTS`, `ATELIER_EVENT_HISTORY_CAP`, and
    /// `ATELIER_MAX_STREAM_EVENTS`.
    pub fn from_env() -> Result<Self> {
        // Load .env if present so local development picks up settings.
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            host: std::env::var("ATELIER_HOST").unwrap_or(defaults.host),
            port: env_parse("ATELIER_PORT", defaults.port)?,
            pipeline_dir: std::env::var("ATELIER_PIPELINE_DIR").ok().map(PathBuf::from),
            collaborator_url: env_url("ATELIER_AGENT_SERVICE_URL")?,
            archive_url: env_url("ATELIER_ARCHIVE_URL")?,
            archive_attempts: env_parse("ATELIER_ARCHIVE_ATTEMPTS", defaults.archive_attempts)?,
            history_cap: env_parse("ATELIER_EVENT_HISTORY_CAP", defaults.history_cap)?,
            max_stream_events: env_parse("ATELIER_MAX_STREAM_EVENTS", defaults.max_stream_events)?,
        })
    }

    /// Set the bind host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the bind port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the collaborator base URL
    pub fn with_collaborator_url(mut self, url: Url) -> Self {
        self.collaborator_url = Some(url);
        self
    }

    /// Set the archive endpoint
    pub fn with_archive_url(mut self, url: Url) -> Self {
        self.archive_url = Some(url);
        self
    }

    /// The address the HTTP listener binds
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Archive settings, when an archive endpoint is configured
    pub fn persist_config(&self) -> Option<PersistConfig> {
        self.archive_url.clone().map(|endpoint| {
            PersistConfig::new(endpoint)
                .with_attempts(self.archive_attempts)
                .with_timeout(Duration::from_secs(30))
        })
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::config(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn env_url(key: &str) -> Result<Option<Url>> {
    match std::env::var(key) {
        Ok(raw) => Url::parse(&raw)
            .map(Some)
            .map_err(|e| Error::config(format!("invalid URL in {key}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_service_local() {
        let config = ServiceConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:8700");
        assert!(config.persist_config().is_none());
        assert!(config.collaborator_url.is_none());
    }

    #[test]
    fn archive_endpoint_enables_persistence() {
        let config = ServiceConfig::default()
            .with_archive_url(Url::parse("http://localhost:8000/api/v1/projects/save-generated").unwrap());
        let persist = config.persist_config().unwrap();
        assert_eq!(persist.attempts, 3);
    }

    #[test]
    fn builders_override_defaults() {
        let config = ServiceConfig::default().with_host("0.0.0.0").with_port(9000);
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }
}
