use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// Well-connected public relays.
const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.primal.net",
    "wss://offchain.pub",
    "wss://nostr21.com",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub relays: RelayConfig,
    pub log: LogConfig,
    pub profile: ProfileConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ack_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failed connects before the user is told.
    pub connect_failure_notice_after: u32,
    pub dedup_window: usize,
    pub heartbeat_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            connect_failure_notice_after: 3,
            dedup_window: 512,
            heartbeat_timeout_ms: 45_000,
            queue_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub urls: Vec<String>,
    pub connect_timeout_ms: u64,
    /// How often the relay pool is polled for a sign of life.
    pub liveness_interval_ms: u64,
    pub history_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            urls: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            connect_timeout_ms: 10_000,
            liveness_interval_ms: 10_000,
            history_limit: 500,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub nickname: Option<String>,
    pub language: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            nickname: None,
            language: "en".to_string(),
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("babelroom")
            .join("config.toml")
    }

    /// Load from `path`, or from the default location. A missing file yields
    /// the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Zero timeouts and zero-sized buffers are rejected, as is a relay
    /// liveness poll slower than the session's heartbeat timeout.
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        let positive = [
            ("session.ack_timeout_ms", session.ack_timeout_ms),
            ("session.backoff_initial_ms", session.backoff_initial_ms),
            ("session.heartbeat_timeout_ms", session.heartbeat_timeout_ms),
            ("session.dedup_window", session.dedup_window as u64),
            ("session.queue_capacity", session.queue_capacity as u64),
            ("relays.connect_timeout_ms", self.relays.connect_timeout_ms),
            ("relays.liveness_interval_ms", self.relays.liveness_interval_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }
        if session.backoff_max_ms < session.backoff_initial_ms {
            bail!(
                "session.backoff_max_ms ({}) is below session.backoff_initial_ms ({})",
                session.backoff_max_ms,
                session.backoff_initial_ms
            );
        }
        if self.relays.liveness_interval_ms >= session.heartbeat_timeout_ms {
            bail!(
                "relays.liveness_interval_ms ({}) must be shorter than session.heartbeat_timeout_ms ({})",
                self.relays.liveness_interval_ms,
                session.heartbeat_timeout_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [session]
            ack_timeout_ms = 2500

            [profile]
            language = "ko"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.ack_timeout(), Duration::from_millis(2500));
        assert_eq!(config.session.dedup_window, 512);
        assert_eq!(config.profile.language, "ko");
        assert_eq!(config.relays.urls.len(), 4);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[session]\nack_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        for raw in [
            "[session]\nheartbeat_timeout_ms = 0",
            "[session]\nack_timeout_ms = 0",
            "[session]\nqueue_capacity = 0",
            "[relays]\nliveness_interval_ms = 0",
        ] {
            let error = Config::parse(raw).unwrap_err().to_string();
            assert!(error.contains("must be greater than zero"), "{raw}: {error}");
        }
    }

    #[test]
    fn backoff_ceiling_below_floor_is_rejected() {
        let raw = "[session]\nbackoff_initial_ms = 5000\nbackoff_max_ms = 1000";
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn liveness_must_beat_the_heartbeat_timeout() {
        let raw = "[session]\nheartbeat_timeout_ms = 5000\n[relays]\nliveness_interval_ms = 5000";
        let error = Config::parse(raw).unwrap_err().to_string();
        assert!(error.contains("shorter than"), "{error}");

        let raw = "[session]\nheartbeat_timeout_ms = 5000\n[relays]\nliveness_interval_ms = 1000";
        assert!(Config::parse(raw).is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/babelroom.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }
}
