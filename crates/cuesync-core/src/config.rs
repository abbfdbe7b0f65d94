//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/cuesync/config.toml)
//! 3. Environment variables (CUESYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "CUESYNC";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control server WebSocket URL
    pub server_url: Option<String>,

    /// First reconnect delay ceiling
    pub reconnect_base_delay_ms: u64,

    /// Upper bound for any reconnect delay
    pub reconnect_max_delay_ms: u64,

    /// Drift beyond this triggers a corrective seek
    pub drift_tolerance_ms: u64,

    /// Heartbeat silence after which clock confidence starts to decay
    pub heartbeat_staleness_ms: u64,

    /// Period of the drift check while following
    pub drift_check_interval_ms: u64,

    /// Upper bound for a single outbound send
    pub send_timeout_ms: u64,

    /// Upper bound for the WebSocket handshake
    pub connect_timeout_ms: u64,

    /// Keep-alive ping period, 0 disables pings
    pub ping_interval_ms: u64,

    /// Weight of the newest heartbeat sample in the clock offset
    pub smoothing_factor: f64,

    /// Heartbeats needed before the clock estimate reaches full confidence
    pub clock_warmup_samples: u32,

    /// Confidence required before any seek is issued
    pub min_clock_confidence: f64,

    /// Largest playback-rate deviation from 1.0 used for fine correction
    pub max_rate_adjustment: f64,

    /// Log file (stderr when unset)
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            drift_tolerance_ms: 300,
            heartbeat_staleness_ms: 10_000,
            drift_check_interval_ms: 2_000,
            send_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            ping_interval_ms: 15_000,
            smoothing_factor: 0.2,
            clock_warmup_samples: 3,
            min_clock_confidence: 0.5,
            max_rate_adjustment: 0.05,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path given on the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        // CUESYNC_SERVER_URL
        if let Some(val) = env_var("SERVER_URL") {
            self.server_url = if val.is_empty() { None } else { Some(val) };
        }

        override_number(&mut self.reconnect_base_delay_ms, "RECONNECT_BASE_DELAY_MS")?;
        override_number(&mut self.reconnect_max_delay_ms, "RECONNECT_MAX_DELAY_MS")?;
        override_number(&mut self.drift_tolerance_ms, "DRIFT_TOLERANCE_MS")?;
        override_number(&mut self.heartbeat_staleness_ms, "HEARTBEAT_STALENESS_MS")?;
        override_number(&mut self.drift_check_interval_ms, "DRIFT_CHECK_INTERVAL_MS")?;
        override_number(&mut self.send_timeout_ms, "SEND_TIMEOUT_MS")?;
        override_number(&mut self.connect_timeout_ms, "CONNECT_TIMEOUT_MS")?;
        override_number(&mut self.ping_interval_ms, "PING_INTERVAL_MS")?;
        override_number(&mut self.smoothing_factor, "SMOOTHING_FACTOR")?;
        override_number(&mut self.clock_warmup_samples, "CLOCK_WARMUP_SAMPLES")?;
        override_number(&mut self.min_clock_confidence, "MIN_CLOCK_CONFIDENCE")?;
        override_number(&mut self.max_rate_adjustment, "MAX_RATE_ADJUSTMENT")?;

        // CUESYNC_LOG_FILE
        if let Some(val) = env_var("LOG_FILE") {
            self.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        Ok(())
    }

    /// Reject values the sync loop cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.reconnect_base_delay_ms == 0 {
            bail!("reconnect_base_delay_ms must be greater than 0");
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            bail!(
                "reconnect_base_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                self.reconnect_base_delay_ms,
                self.reconnect_max_delay_ms
            );
        }
        if self.drift_check_interval_ms == 0 {
            bail!("drift_check_interval_ms must be greater than 0");
        }
        if self.heartbeat_staleness_ms == 0 {
            bail!("heartbeat_staleness_ms must be greater than 0");
        }
        if !(self.smoothing_factor > 0.0 && self.smoothing_factor <= 1.0) {
            bail!(
                "smoothing_factor must be in (0, 1], got {}",
                self.smoothing_factor
            );
        }
        if self.clock_warmup_samples == 0 {
            bail!("clock_warmup_samples must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.min_clock_confidence) {
            bail!(
                "min_clock_confidence must be in [0, 1], got {}",
                self.min_clock_confidence
            );
        }
        if !(0.0..0.5).contains(&self.max_rate_adjustment) {
            bail!(
                "max_rate_adjustment must be in [0, 0.5), got {}",
                self.max_rate_adjustment
            );
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with CUESYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cuesync")
            .join("config.toml")
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Never zero, so it can drive a timer even on an unvalidated config
    pub fn drift_check_interval(&self) -> Duration {
        Duration::from_millis(self.drift_check_interval_ms.max(1))
    }

    /// `None` when keep-alive pings are disabled
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, suffix)).ok()
}

fn override_number<T>(target: &mut T, suffix: &str) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(val) = env_var(suffix) {
        *target = val
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}_{}: '{}'", ENV_PREFIX, suffix, val))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "CUESYNC_SERVER_URL",
        "CUESYNC_DRIFT_TOLERANCE_MS",
        "CUESYNC_RECONNECT_BASE_DELAY_MS",
        "CUESYNC_RECONNECT_MAX_DELAY_MS",
        "CUESYNC_LOG_FILE",
        "CUESYNC_SMOOTHING_FACTOR",
        "CUESYNC_CLOCK_WARMUP_SAMPLES",
        "CUESYNC_MIN_CLOCK_CONFIDENCE",
        "CUESYNC_MAX_RATE_ADJUSTMENT",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.server_url.is_none());
        assert_eq!(config.reconnect_base_delay(), Duration::from_millis(500));
        assert_eq!(config.reconnect_max_delay(), Duration::from_secs(30));
        assert_eq!(config.drift_tolerance_ms, 300);
        assert_eq!(config.heartbeat_staleness_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override_server_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("CUESYNC_SERVER_URL", "ws://localhost:8000/ws/playback/");
        config.apply_env_overrides().unwrap();
        assert_eq!(
            config.server_url.as_deref(),
            Some("ws://localhost:8000/ws/playback/")
        );

        // Empty string clears it
        env::set_var("CUESYNC_SERVER_URL", "");
        config.apply_env_overrides().unwrap();
        assert!(config.server_url.is_none());
    }

    #[test]
    fn test_env_override_numbers() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("CUESYNC_DRIFT_TOLERANCE_MS", "150");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.drift_tolerance_ms, 150);

        env::set_var("CUESYNC_DRIFT_TOLERANCE_MS", "fast");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_env_override_clock_tuning() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("CUESYNC_SMOOTHING_FACTOR", "0.5");
        env::set_var("CUESYNC_CLOCK_WARMUP_SAMPLES", "5");
        env::set_var("CUESYNC_MIN_CLOCK_CONFIDENCE", "0.9");
        env::set_var("CUESYNC_MAX_RATE_ADJUSTMENT", "0.02");
        let config = Config::load_from_str("").unwrap();
        assert!((config.smoothing_factor - 0.5).abs() < 1e-9);
        assert_eq!(config.clock_warmup_samples, 5);
        assert!((config.min_clock_confidence - 0.9).abs() < 1e-9);
        assert!((config.max_rate_adjustment - 0.02).abs() < 1e-9);

        // Overrides go through validation like file values
        env::set_var("CUESYNC_SMOOTHING_FACTOR", "1.5");
        assert!(Config::load_from_str("").is_err());

        env::set_var("CUESYNC_CLOCK_WARMUP_SAMPLES", "-1");
        assert!(Config::load_from_str("").is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = Config {
            reconnect_base_delay_ms: 60_000,
            reconnect_max_delay_ms: 1_000,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_validate_rejects_bad_smoothing() {
        let config = Config {
            smoothing_factor: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            smoothing_factor: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            server_url = "ws://example.com/sync"
            drift_tolerance_ms = 250
            smoothing_factor = 0.3
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.server_url.as_deref(), Some("ws://example.com/sync"));
        assert_eq!(config.drift_tolerance_ms, 250);
        assert!((config.smoothing_factor - 0.3).abs() < f64::EPSILON);
        // Unspecified keys keep their defaults
        assert_eq!(config.reconnect_max_delay_ms, 30_000);
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);

        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config {
            server_url: Some("wss://sync.example.com".to_string()),
            ping_interval_ms: 0,
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.ping_interval().is_none());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config, Config::default());
    }
}
