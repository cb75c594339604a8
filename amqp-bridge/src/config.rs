use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, Result};

/// Default credit window for consumers
pub const DEFAULT_MAX_BUFFERED_MESSAGES: u32 = 1000;

/// Default number of reply links kept open between replies
pub const DEFAULT_REPLY_LINK_CACHE_SIZE: usize = 16;

/// PKCS12 key or trust store location
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PfxOptions {
    pub path: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for PfxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PfxOptions")
            .field("path", &self.path)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Options handed to the transport and the bridge itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// Use TLS for the connection
    pub ssl: bool,
    /// Store used to verify the server certificate
    pub trust_store: Option<PfxOptions>,
    /// Store holding the client certificate for TLS client authentication
    pub key_store: Option<PfxOptions>,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Idle timeout advertised to the peer in seconds (0 disables)
    pub idle_timeout_s: u32,
    /// AMQP container id; the transport picks one when unset
    pub container_id: Option<String>,
    /// Create the dynamic reply consumer on start
    pub reply_handling_support: bool,
    /// Credit window for consumers created without explicit options
    pub default_max_buffered_messages: u32,
    /// Reply links kept open for reuse; idle links beyond this are closed
    pub reply_link_cache_size: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            ssl: false,
            trust_store: None,
            key_store: None,
            connect_timeout_ms: 60_000,
            idle_timeout_s: 0,
            container_id: None,
            reply_handling_support: true,
            default_max_buffered_messages: DEFAULT_MAX_BUFFERED_MESSAGES,
            reply_link_cache_size: DEFAULT_REPLY_LINK_CACHE_SIZE,
        }
    }
}

/// Where and how to connect
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub options: BridgeOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: None,
            password: None,
            options: BridgeOptions::default(),
        }
    }
}

impl BridgeConfig {
    /// Create new configuration for a host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Authenticate with SASL PLAIN credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_options(mut self, options: BridgeOptions) -> Self {
        self.options = options;
        self
    }

    /// Load configuration from defaults, an optional `amqp-bridge.toml` in
    /// the working directory and `AMQP_BRIDGE__*` environment variables
    /// (e.g. `AMQP_BRIDGE__OPTIONS__SSL=true`).
    pub fn load() -> Result<Self> {
        Self::load_from("amqp-bridge")
    }

    /// Same as [`BridgeConfig::load`] with a custom file stem
    pub fn load_from(file_stem: &str) -> Result<Self> {
        let defaults = Self::default();
        let config = Config::builder()
            .set_default("host", defaults.host)?
            .set_default("port", i64::from(defaults.port))?
            .set_default("options.ssl", defaults.options.ssl)?
            .set_default("options.connect_timeout_ms", defaults.options.connect_timeout_ms as i64)?
            .set_default("options.idle_timeout_s", i64::from(defaults.options.idle_timeout_s))?
            .set_default("options.reply_handling_support", defaults.options.reply_handling_support)?
            .set_default(
                "options.default_max_buffered_messages",
                i64::from(defaults.options.default_max_buffered_messages),
            )?
            .set_default(
                "options.reply_link_cache_size",
                defaults.options.reply_link_cache_size as i64,
            )?
            .add_source(File::with_name(file_stem).required(false))
            .add_source(Environment::with_prefix("AMQP_BRIDGE").separator("__"))
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(BridgeError::config_error("host must not be empty"));
        }
        if self.options.default_max_buffered_messages < 1 {
            return Err(BridgeError::InvalidCreditWindow {
                window: self.options.default_max_buffered_messages,
            });
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(BridgeError::config_error(
                "username and password must be given together",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5672);
        assert!(config.options.reply_handling_support);
        assert_eq!(config.options.default_max_buffered_messages, 1000);
        assert_eq!(config.options.reply_link_cache_size, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::new("broker.internal", 5671)
            .with_credentials("user", "secret")
            .with_options(BridgeOptions {
                ssl: true,
                ..Default::default()
            });
        assert_eq!(config.username.as_deref(), Some("user"));
        assert!(config.options.ssl);
        assert!(!format!("{:?}", config).contains("secret"));
    }

    #[test]
    fn test_validate() {
        let mut config = BridgeConfig::default();
        config.options.default_max_buffered_messages = 0;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidCreditWindow);

        let mut config = BridgeConfig::default();
        config.username = Some("user".into());
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn test_load_without_sources() {
        let config = BridgeConfig::load_from("does-not-exist-amqp-bridge").unwrap();
        assert_eq!(config.port, 5672);
        assert!(config.options.reply_handling_support);
        assert_eq!(config.options.reply_link_cache_size, DEFAULT_REPLY_LINK_CACHE_SIZE);
    }
}
