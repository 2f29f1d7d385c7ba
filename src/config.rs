//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the JSON trust store
    pub trust_file: PathBuf,
    /// Tool signing key pair
    pub keys: KeysConfig,
    /// Cache sizes and TTLs
    pub cache: CacheConfig,
    /// Outbound HTTP
    pub http: HttpConfig,
    /// Login / launch behaviour
    pub launch: LaunchConfig,
}

/// PEM files of the tool's RSA key pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Private key (PKCS#1 or PKCS#8 PEM)
    pub private_key: PathBuf,
    /// Public key (PEM)
    pub public_key: PathBuf,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            private_key: PathBuf::from("config/private.key"),
            public_key: PathBuf::from("config/public.key"),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached platform responses
    pub max_entries: usize,
    /// Maximum memoized derived public keys
    pub key_max_entries: usize,
    /// TTL of cached token endpoint responses
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// TTL of cached JWKS responses
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 128,
            key_max_entries: 32,
            token_ttl: Duration::from_secs(30 * 60),
            jwks_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Login / launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Landing route after a launch without a stored `next_url`
    pub default_redirect: String,
    /// Clock skew tolerated on launch token temporal claims
    pub clock_leeway_secs: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            default_redirect: "/".to_string(),
            clock_leeway_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // LTI_TOOL_CACHE__JWKS_TTL=1h -> cache.jwks_ttl
        figment = figment.merge(Env::prefixed("LTI_TOOL_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// Human-readable duration serialization
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "6h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "6h", "100ms" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_match_platform_cache_policy() {
        let config = Config::default();
        assert_eq!(config.cache.max_entries, 128);
        assert_eq!(config.cache.key_max_entries, 32);
        assert_eq!(config.cache.token_ttl, Duration::from_secs(1800));
        assert_eq!(config.cache.jwks_ttl, Duration::from_secs(21600));
        assert_eq!(config.http.timeout, Duration::from_secs(30));
        assert_eq!(config.launch.default_redirect, "/");
        assert_eq!(config.launch.clock_leeway_secs, 60);
    }

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("6h").unwrap(), Duration::from_secs(21600));
        assert_eq!(humantime_serde::parse("45").unwrap(), Duration::from_secs(45));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lti.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "trust_file: /etc/lti/trust.json\ncache:\n  jwks_ttl: 1h\n  max_entries: 64\nlaunch:\n  default_redirect: /home"
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.trust_file, PathBuf::from("/etc/lti/trust.json"));
        assert_eq!(config.cache.jwks_ttl, Duration::from_secs(3600));
        assert_eq!(config.cache.max_entries, 64);
        assert_eq!(config.cache.token_ttl, Duration::from_secs(1800));
        assert_eq!(config.launch.default_redirect, "/home");
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/lti.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
