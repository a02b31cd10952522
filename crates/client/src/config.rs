use std::fmt;
use std::str::FromStr;

use talkgroup_core::VoxConfig;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Where and as whom a session signs in.
///
/// An auth token, when present, is sent instead of the username/password
/// pair.
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub server_url: String,
    pub channel: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_token: Option<String>,
}

impl ChannelConfig {
    pub fn new(server_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            channel: channel.into(),
            username: None,
            password: None,
            auth_token: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "TALKGROUP_SERVER_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", self.server_url),
            ));
        }
        if self.channel.trim().is_empty() {
            return Err(ConfigError::MissingVar("TALKGROUP_CHANNEL".to_string()));
        }
        if self.auth_token.is_none() && (self.username.is_none() || self.password.is_none()) {
            return Err(ConfigError::MissingVar(
                "TALKGROUP_AUTH_TOKEN or TALKGROUP_USERNAME and TALKGROUP_PASSWORD".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("server_url", &self.server_url)
            .field("channel", &self.channel)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub channel: ChannelConfig,
    pub vox: VoxConfig,
    pub log_level: Level,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{}': {}", raw, e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let server_url = std::env::var("TALKGROUP_SERVER_URL")
            .map_err(|_| ConfigError::MissingVar("TALKGROUP_SERVER_URL".to_string()))?;
        let channel_name = std::env::var("TALKGROUP_CHANNEL")
            .map_err(|_| ConfigError::MissingVar("TALKGROUP_CHANNEL".to_string()))?;

        let channel = ChannelConfig {
            server_url,
            channel: channel_name,
            username: std::env::var("TALKGROUP_USERNAME").ok(),
            password: std::env::var("TALKGROUP_PASSWORD").ok(),
            auth_token: std::env::var("TALKGROUP_AUTH_TOKEN").ok(),
        };
        channel.validate()?;

        let defaults = VoxConfig::default();
        let vox = VoxConfig {
            open_threshold: parse_var("VOX_OPEN_THRESHOLD", defaults.open_threshold)?,
            close_threshold: parse_var("VOX_CLOSE_THRESHOLD", defaults.close_threshold)?,
            hang_time_ms: parse_var("VOX_HANG_TIME_MS", defaults.hang_time_ms)?,
            pre_roll_frames: parse_var("VOX_PRE_ROLL_FRAMES", defaults.pre_roll_frames)?,
        };
        vox.validate()
            .map_err(|e| ConfigError::InvalidValue("VOX_OPEN_THRESHOLD".to_string(), e.to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            channel,
            vox,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            for name in [
                "TALKGROUP_SERVER_URL",
                "TALKGROUP_CHANNEL",
                "TALKGROUP_USERNAME",
                "TALKGROUP_PASSWORD",
                "TALKGROUP_AUTH_TOKEN",
                "VOX_OPEN_THRESHOLD",
                "VOX_CLOSE_THRESHOLD",
                "VOX_HANG_TIME_MS",
                "VOX_PRE_ROLL_FRAMES",
                "RUST_LOG",
            ] {
                env::remove_var(name);
            }
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("TALKGROUP_SERVER_URL", "wss://zello.io/ws");
            env::set_var("TALKGROUP_CHANNEL", "dispatch");
            env::set_var("TALKGROUP_AUTH_TOKEN", "test-token");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    fn test_channel_config_debug_redacts_secrets() {
        let config = ChannelConfig::new("ws://localhost:8080", "ops")
            .with_credentials("alice", "hunter2")
            .with_auth_token("secret-token");
        let printed = format!("{:?}", config);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("[redacted]"));
    }

    #[test]
    fn test_channel_config_validation() {
        let base = ChannelConfig::new("ws://localhost:8080", "ops");
        assert!(matches!(base.validate(), Err(ConfigError::MissingVar(_))));
        assert!(base.clone().with_credentials("a", "b").validate().is_ok());
        assert!(base.clone().with_auth_token("t").validate().is_ok());

        let http = ChannelConfig::new("http://localhost", "ops").with_auth_token("t");
        assert!(matches!(
            http.validate(),
            Err(ConfigError::InvalidValue(var, _)) if var == "TALKGROUP_SERVER_URL"
        ));
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.channel.server_url, "wss://zello.io/ws");
        assert_eq!(config.channel.channel, "dispatch");
        assert_eq!(config.channel.auth_token, Some("test-token".to_string()));
        assert_eq!(config.channel.username, None);
        assert_eq!(config.vox, VoxConfig::default());
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("TALKGROUP_SERVER_URL", "ws://127.0.0.1:9000");
            env::set_var("TALKGROUP_CHANNEL", "ops");
            env::set_var("TALKGROUP_USERNAME", "alice");
            env::set_var("TALKGROUP_PASSWORD", "pw");
            env::set_var("VOX_OPEN_THRESHOLD", "0.1");
            env::set_var("VOX_CLOSE_THRESHOLD", "0.08");
            env::set_var("VOX_HANG_TIME_MS", "1500");
            env::set_var("VOX_PRE_ROLL_FRAMES", "5");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.channel.username, Some("alice".to_string()));
        assert_eq!(config.channel.password, Some("pw".to_string()));
        assert_eq!(config.channel.auth_token, None);
        assert_eq!(config.vox.open_threshold, 0.1);
        assert_eq!(config.vox.close_threshold, 0.08);
        assert_eq!(config.vox.hang_time_ms, 1500);
        assert_eq!(config.vox.pre_roll_frames, 5);
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_missing_channel() {
        clear_env_vars();
        unsafe {
            env::set_var("TALKGROUP_SERVER_URL", "wss://zello.io/ws");
            env::set_var("TALKGROUP_AUTH_TOKEN", "test-token");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "TALKGROUP_CHANNEL"),
            _ => panic!("Expected MissingVar for TALKGROUP_CHANNEL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_credentials() {
        clear_env_vars();
        unsafe {
            env::set_var("TALKGROUP_SERVER_URL", "wss://zello.io/ws");
            env::set_var("TALKGROUP_CHANNEL", "dispatch");
            env::set_var("TALKGROUP_USERNAME", "alice");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("TALKGROUP_PASSWORD")),
            _ => panic!("Expected MissingVar for credentials"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_vox_value() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("VOX_HANG_TIME_MS", "soon");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "VOX_HANG_TIME_MS"),
            _ => panic!("Expected InvalidValue for VOX_HANG_TIME_MS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_rejects_inverted_vox_thresholds() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("VOX_OPEN_THRESHOLD", "0.01");
            env::set_var("VOX_CLOSE_THRESHOLD", "0.2");
        }

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue(_, _))
        ));
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}
