pub mod tracing;

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application environment (dev = local/kind, prod = full k8s)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development, // Local dev or kind cluster
    Production,  // Full k8s cluster
}

impl Environment {
    pub fn from_env() -> Self {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(source: &dyn VarSource) -> Self {
        let app_env = env_or_default(source, "APP_ENV", "development");

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// A key/value source configuration is read from.
///
/// The process environment is the usual source; tests and embedders can
/// hand in a plain map so loading stays a pure function of its input.
pub trait VarSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl VarSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

impl VarSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl VarSource for HashMap<&str, &str> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.to_string())
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    /// Build the configuration from an arbitrary variable source.
    fn from_source(source: &dyn VarSource) -> Result<Self, ConfigError>;

    fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }
}

/// Helper to load an environment variable with a default value
pub fn env_or_default(source: &dyn VarSource, key: &str, default: &str) -> String {
    source.var(key).unwrap_or_else(|| default.to_string())
}

/// Helper to load an environment variable or return error
pub fn env_required(source: &dyn VarSource, key: &str) -> Result<String, ConfigError> {
    source
        .var(key)
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Load an optional value. Unset and blank values are both `None`.
pub fn env_opt(source: &dyn VarSource, key: &str) -> Option<String> {
    source.var(key).filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable into `T`, falling back to `default` when unset.
pub fn env_parse<T>(source: &dyn VarSource, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match source.var(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
                key: key.to_string(),
                details: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

/// Parse a boolean flag. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
pub fn env_bool(source: &dyn VarSource, key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = source.var(key) else {
        return Ok(default);
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::ParseError {
            key: key.to_string(),
            details: format!("'{other}' is not a boolean"),
        }),
    }
}

/// Load a comma separated list. Blank entries are dropped.
pub fn env_list(source: &dyn VarSource, key: &str, default: &[&str]) -> Vec<String> {
    match source.var(key) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}
