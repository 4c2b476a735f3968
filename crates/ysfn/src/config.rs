//! Bridge configuration.
//!
//! Values are opaque to the bridge: the dispatcher address and credential
//! are handed to the remote connector untouched.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::bridge::transport::SOCKET_FILE;

pub const ENV_NAME: &str = "YOMO_SFN_NAME";
pub const ENV_ZIPPER: &str = "YOMO_SFN_ZIPPER";
pub const ENV_CREDENTIAL: &str = "YOMO_SFN_CREDENTIAL";
pub const ENV_ACCEPT_TIMEOUT: &str = "YSFN_ACCEPT_TIMEOUT_SECS";
pub const ENV_SHUTDOWN_GRACE: &str = "YSFN_SHUTDOWN_GRACE_SECS";

pub const DEFAULT_DISPATCHER_ADDR: &str = "localhost:9000";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Where the function definition document comes from.
///
/// Exactly one source is authoritative for a run; there is no fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DefinitionSource {
    /// Sent by the child in the handshake header.
    #[default]
    InBand,
    /// Read by the host from the runtime's working directory before the
    /// child starts; the header's definition is ignored.
    WorkDir,
}

impl FromStr for DefinitionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-band" => Ok(DefinitionSource::InBand),
            "work-dir" => Ok(DefinitionSource::WorkDir),
            other => Err(format!(
                "invalid definition source '{other}', expected 'in-band' or 'work-dir'"
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a number of seconds, got '{value}'")]
    InvalidSeconds { var: &'static str, value: String },
}

#[derive(Clone)]
pub struct BridgeConfig {
    pub function_name: Option<String>,
    pub dispatcher_addr: String,
    pub credential: String,
    /// Socket file name, relative to the runtime's working directory.
    pub socket_file: String,
    /// `None` waits for the child forever.
    pub accept_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    pub definition_source: DefinitionSource,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            function_name: None,
            dispatcher_addr: DEFAULT_DISPATCHER_ADDR.to_string(),
            credential: String::new(),
            socket_file: SOCKET_FILE.to_string(),
            accept_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            definition_source: DefinitionSource::default(),
        }
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("function_name", &self.function_name)
            .field("dispatcher_addr", &self.dispatcher_addr)
            .field("credential", &"<redacted>")
            .field("socket_file", &self.socket_file)
            .field("accept_timeout", &self.accept_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("definition_source", &self.definition_source)
            .finish()
    }
}

impl BridgeConfig {
    pub fn new(dispatcher_addr: impl Into<String>) -> Self {
        Self {
            dispatcher_addr: dispatcher_addr.into(),
            ..Self::default()
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let seconds = |var: &'static str| -> Result<Option<Duration>, ConfigError> {
            match get(var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(|s| Some(Duration::from_secs_f64(s)))
                    .ok_or(ConfigError::InvalidSeconds { var, value }),
            }
        };

        let mut config = Self::default();
        config.function_name = get(ENV_NAME);
        if let Some(addr) = get(ENV_ZIPPER) {
            config.dispatcher_addr = addr;
        }
        if let Some(credential) = lookup(ENV_CREDENTIAL) {
            config.credential = credential;
        }
        config.accept_timeout = seconds(ENV_ACCEPT_TIMEOUT)?;
        if let Some(grace) = seconds(ENV_SHUTDOWN_GRACE)? {
            config.shutdown_grace = grace;
        }
        Ok(config)
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_socket_file(mut self, file: impl Into<String>) -> Self {
        self.socket_file = file.into();
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_definition_source(mut self, source: DefinitionSource) -> Self {
        self.definition_source = source;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.function_name, None);
        assert_eq!(config.dispatcher_addr, "localhost:9000");
        assert_eq!(config.socket_file, "sfn.sock");
        assert_eq!(config.accept_timeout, None);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.definition_source, DefinitionSource::InBand);
    }

    #[test]
    fn reads_environment_values() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("YOMO_SFN_NAME", "get_weather"),
            ("YOMO_SFN_ZIPPER", "zipper.example:9000"),
            ("YOMO_SFN_CREDENTIAL", "token:abc"),
            ("YSFN_ACCEPT_TIMEOUT_SECS", "30"),
            ("YSFN_SHUTDOWN_GRACE_SECS", "0.5"),
        ]))
        .unwrap();
        assert_eq!(config.function_name.as_deref(), Some("get_weather"));
        assert_eq!(config.dispatcher_addr, "zipper.example:9000");
        assert_eq!(config.credential, "token:abc");
        assert_eq!(config.accept_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.shutdown_grace, Duration::from_millis(500));
    }

    #[test]
    fn rejects_bad_seconds() {
        let err = BridgeConfig::from_lookup(lookup(&[("YSFN_ACCEPT_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"YSFN_ACCEPT_TIMEOUT_SECS must be a number of seconds, got 'soon'"
        );
        assert!(
            BridgeConfig::from_lookup(lookup(&[("YSFN_SHUTDOWN_GRACE_SECS", "-1")])).is_err()
        );
    }

    #[test]
    fn builders_override_single_fields() {
        let config = BridgeConfig::new("zipper:9000")
            .with_function_name("sink")
            .with_socket_file("custom.sock");
        assert_eq!(config.dispatcher_addr, "zipper:9000");
        assert_eq!(config.function_name.as_deref(), Some("sink"));
        assert_eq!(config.socket_file, "custom.sock");
        assert_eq!(config.credential, "");
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn debug_redacts_credential() {
        let config = BridgeConfig::default().with_credential("hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn definition_source_parses() {
        assert_eq!(
            "work-dir".parse::<DefinitionSource>(),
            Ok(DefinitionSource::WorkDir)
        );
        assert!("file".parse::<DefinitionSource>().is_err());
    }
}
