use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{NamespaceError, NamespaceResult};

pub const KEY_FETCH_EXPIRATION_SECONDS: &str = "FETCH_EXPIRATION_SECONDS";
pub const KEY_FAIL_FAST_ON_FETCH_ERROR: &str = "FAIL_FAST_ON_FETCH_ERROR";
pub const KEY_FETCH_BACKOFF_BASE_MILLIS: &str = "FETCH_BACKOFF_BASE_MILLIS";
pub const KEY_FETCH_BACKOFF_CAP_MILLIS: &str = "FETCH_BACKOFF_CAP_MILLIS";
pub const KEY_BROADCAST_CAPACITY: &str = "BROADCAST_CAPACITY";
pub const KEY_OBSERVERS_ENABLED: &str = "OBSERVERS_ENABLED";

const ENV_PREFIX: &str = "BLOCKCHAIN_NAMESPACE_";
const ENV_ENVIRONMENT: &str = "BLOCKCHAIN_NAMESPACE_ENV";

/// Build flavour the engine runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    /// `Development` for debug builds, `Production` otherwise, unless
    /// `BLOCKCHAIN_NAMESPACE_ENV` says differently.
    pub fn current() -> Self {
        match std::env::var(ENV_ENVIRONMENT) {
            Ok(value) => Self::parse(&value),
            Err(_) if cfg!(debug_assertions) => Environment::Development,
            Err(_) => Environment::Production,
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "production" | "prod" | "release" => Environment::Production,
            "test" | "testing" => Environment::Test,
            _ => Environment::Development,
        }
    }
}

/// Environment-keyed settings for the session engine.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    environment: Environment,
    config_map: HashMap<String, String>,
}

impl NamespaceConfig {
    /// Defaults for `environment`, without looking at the process environment.
    pub fn new(environment: Environment) -> Self {
        let mut config = NamespaceConfig {
            environment,
            config_map: HashMap::new(),
        };
        config.load_defaults();
        config
    }

    /// Defaults for [`Environment::current`] with `BLOCKCHAIN_NAMESPACE_*` overrides.
    pub fn from_env() -> Self {
        Self::from_environment(Environment::current())
    }

    pub fn from_environment(environment: Environment) -> Self {
        let mut config = Self::new(environment);
        config.load_from_env_vars();
        config
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.config_map.get(key)
    }

    /// Set a configuration value (mostly for tests)
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config_map.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn get_bool_with_default(&self, key: &str, default: bool) -> NamespaceResult<bool> {
        match self.config_map.get(key) {
            Some(value) => parse_bool_flag(value, key),
            None => Ok(default),
        }
    }

    pub fn get_u64_with_default(&self, key: &str, default: u64) -> NamespaceResult<u64> {
        match self.config_map.get(key) {
            Some(value) => parse_u64_value(value, key),
            None => Ok(default),
        }
    }

    /// Cache window requested from the remote source for a fetch that is not stale.
    pub fn fetch_expiration(&self) -> NamespaceResult<Duration> {
        let default = match self.environment {
            Environment::Production => 3600,
            Environment::Development | Environment::Test => 30,
        };
        self.get_u64_with_default(KEY_FETCH_EXPIRATION_SECONDS, default)
            .map(Duration::from_secs)
    }

    /// Whether a failed remote fetch is surfaced as an error instead of degrading to cached values.
    pub fn fail_fast_on_fetch_error(&self) -> NamespaceResult<bool> {
        self.get_bool_with_default(
            KEY_FAIL_FAST_ON_FETCH_ERROR,
            self.environment == Environment::Development,
        )
    }

    pub fn fetch_backoff_base(&self) -> NamespaceResult<Duration> {
        self.get_u64_with_default(KEY_FETCH_BACKOFF_BASE_MILLIS, 500)
            .map(Duration::from_millis)
    }

    pub fn fetch_backoff_cap(&self) -> NamespaceResult<Duration> {
        self.get_u64_with_default(KEY_FETCH_BACKOFF_CAP_MILLIS, 30_000)
            .map(Duration::from_millis)
    }

    pub fn broadcast_capacity(&self) -> NamespaceResult<usize> {
        let capacity = self.get_u64_with_default(KEY_BROADCAST_CAPACITY, 256)?;
        if capacity == 0 {
            return Err(NamespaceError::Configuration(format!(
                "Configuration key '{}' must be greater than zero",
                KEY_BROADCAST_CAPACITY
            )));
        }
        usize::try_from(capacity).map_err(|_| {
            NamespaceError::Configuration(format!(
                "Configuration key '{}' is out of range",
                KEY_BROADCAST_CAPACITY
            ))
        })
    }

    pub fn observers_enabled(&self) -> NamespaceResult<bool> {
        self.get_bool_with_default(KEY_OBSERVERS_ENABLED, true)
    }

    /// Parses every known key, failing on the first malformed value.
    pub fn validate(&self) -> NamespaceResult<()> {
        self.fetch_expiration()?;
        self.fail_fast_on_fetch_error()?;
        self.fetch_backoff_base()?;
        self.fetch_backoff_cap()?;
        self.broadcast_capacity()?;
        self.observers_enabled()?;
        Ok(())
    }

    fn load_defaults(&mut self) {
        self.config_map
            .insert(KEY_FETCH_BACKOFF_BASE_MILLIS.to_string(), "500".to_string());
        self.config_map
            .insert(KEY_FETCH_BACKOFF_CAP_MILLIS.to_string(), "30000".to_string());
        self.config_map
            .insert(KEY_BROADCAST_CAPACITY.to_string(), "256".to_string());
        self.config_map
            .insert(KEY_OBSERVERS_ENABLED.to_string(), "true".to_string());

        match self.environment {
            Environment::Production => {
                self.config_map
                    .insert(KEY_FETCH_EXPIRATION_SECONDS.to_string(), "3600".to_string());
                self.config_map
                    .insert(KEY_FAIL_FAST_ON_FETCH_ERROR.to_string(), "false".to_string());
            }
            Environment::Development => {
                self.config_map
                    .insert(KEY_FETCH_EXPIRATION_SECONDS.to_string(), "30".to_string());
                self.config_map
                    .insert(KEY_FAIL_FAST_ON_FETCH_ERROR.to_string(), "true".to_string());
            }
            Environment::Test => {
                self.config_map
                    .insert(KEY_FETCH_EXPIRATION_SECONDS.to_string(), "30".to_string());
                self.config_map
                    .insert(KEY_FAIL_FAST_ON_FETCH_ERROR.to_string(), "false".to_string());
            }
        }
    }

    fn load_from_env_vars(&mut self) {
        let keys = [
            KEY_FETCH_EXPIRATION_SECONDS,
            KEY_FAIL_FAST_ON_FETCH_ERROR,
            KEY_FETCH_BACKOFF_BASE_MILLIS,
            KEY_FETCH_BACKOFF_CAP_MILLIS,
            KEY_BROADCAST_CAPACITY,
            KEY_OBSERVERS_ENABLED,
        ];

        for config_key in keys {
            let env_var = format!("{}{}", ENV_PREFIX, config_key);
            if let Ok(value) = std::env::var(&env_var) {
                if value.trim().is_empty() {
                    log::warn!("Environment variable {} is empty", env_var);
                    continue;
                }

                if value.chars().any(|c| c.is_control()) {
                    log::warn!(
                        "Environment variable {} contains control characters, ignoring",
                        env_var
                    );
                    continue;
                }

                self.config_map.insert(config_key.to_string(), value);
                log::debug!(
                    "Loaded configuration {} from environment variable {}",
                    config_key,
                    env_var
                );
            }
        }
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self::new(Environment::Development)
    }
}

fn parse_bool_flag(value: &str, key: &str) -> NamespaceResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(NamespaceError::Configuration(format!(
            "Invalid boolean value '{}' for key '{}'",
            value, key
        ))),
    }
}

fn parse_u64_value(value: &str, key: &str) -> NamespaceResult<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(NamespaceError::Configuration(format!(
            "Configuration key '{}' cannot be empty",
            key
        )));
    }

    trimmed.parse::<u64>().map_err(|_| {
        NamespaceError::Configuration(format!(
            "Invalid numeric value '{}' for key '{}'",
            value, key
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_release_expirations_differ() {
        let development = NamespaceConfig::new(Environment::Development);
        let production = NamespaceConfig::new(Environment::Production);

        assert_eq!(development.fetch_expiration().unwrap(), Duration::from_secs(30));
        assert_eq!(production.fetch_expiration().unwrap(), Duration::from_secs(3600));
        assert!(development.fail_fast_on_fetch_error().unwrap());
        assert!(!production.fail_fast_on_fetch_error().unwrap());
    }

    #[test]
    fn malformed_values_are_configuration_errors() {
        let config = NamespaceConfig::new(Environment::Test)
            .with(KEY_OBSERVERS_ENABLED, "perhaps")
            .with(KEY_BROADCAST_CAPACITY, "0");

        assert!(matches!(
            config.observers_enabled(),
            Err(NamespaceError::Configuration(_))
        ));
        assert!(matches!(
            config.broadcast_capacity(),
            Err(NamespaceError::Configuration(_))
        ));
        assert!(config.validate().is_err());
        assert!(NamespaceConfig::new(Environment::Test).validate().is_ok());
    }

    #[test]
    fn environment_variables_override_defaults() {
        std::env::set_var("BLOCKCHAIN_NAMESPACE_FETCH_BACKOFF_CAP_MILLIS", "1234");
        std::env::set_var("BLOCKCHAIN_NAMESPACE_FETCH_BACKOFF_BASE_MILLIS", "  ");
        let config = NamespaceConfig::from_environment(Environment::Test);
        std::env::remove_var("BLOCKCHAIN_NAMESPACE_FETCH_BACKOFF_CAP_MILLIS");
        std::env::remove_var("BLOCKCHAIN_NAMESPACE_FETCH_BACKOFF_BASE_MILLIS");

        assert_eq!(config.fetch_backoff_cap().unwrap(), Duration::from_millis(1234));
        assert_eq!(config.fetch_backoff_base().unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn environment_names_parse_leniently() {
        assert_eq!(Environment::parse("PROD"), Environment::Production);
        assert_eq!(Environment::parse("testing"), Environment::Test);
        assert_eq!(Environment::parse("anything"), Environment::Development);
    }
}
