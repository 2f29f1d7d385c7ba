//! Trust store: issuers the tool accepts and the tools registered with them
//!
//! The store is a JSON document:
//!
//! ```json
//! {
//!   "kid": "tool-signing-key",
//!   "issuers": {
//!     "https://lms.example": {
//!       "login_url": "https://lms.example/mod/lti/auth.php",
//!       "token_url": "https://lms.example/mod/lti/token.php",
//!       "tools": [
//!         { "aud": "client-1", "jwks_endpoint": "https://lms.example/mod/lti/certs.php" }
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! Audience lookup is always scoped to one issuer. The store is immutable
//! after load except for [`TrustRegistry::register_tool`], which clones an
//! existing tool of the same issuer for a new audience and writes the
//! document back.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{Error, Result};

/// Whole trust document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Key id placed in the header of client assertions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Issuer URL to its endpoints and tools
    #[serde(default)]
    pub issuers: BTreeMap<String, TrustedIssuer>,
    /// Unknown top-level fields, preserved on write-back
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A platform the tool trusts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedIssuer {
    /// OIDC authorization endpoint the login redirect targets
    pub login_url: String,
    /// OAuth2 token endpoint
    pub token_url: String,
    /// Per-issuer override of the top-level `kid`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Tools registered with this issuer
    #[serde(default)]
    pub tools: Vec<ToolRegistration>,
    /// Unknown fields, preserved on write-back
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One tool deployment under an issuer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRegistration {
    /// Audience, i.e. the client id the platform issued
    pub aud: String,
    /// Platform JWKS endpoint for this tool
    pub jwks_endpoint: String,
    /// Remaining fields, carried through cloning
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolRegistration {
    /// Client id used for client assertions
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.aud
    }

    /// Clone this registration for `aud`, substituting the new audience
    /// wherever the old one appears inside a string value.
    #[must_use]
    pub fn with_audience(&self, aud: &str) -> Self {
        let old = self.aud.as_str();
        let substitute = |s: &str| {
            if old.is_empty() {
                s.to_string()
            } else {
                s.replace(old, aud)
            }
        };
        let extra = self
            .extra
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => Value::String(substitute(s)),
                    other => other.clone(),
                };
                (k.clone(), v)
            })
            .collect();
        Self {
            aud: aud.to_string(),
            jwks_endpoint: substitute(&self.jwks_endpoint),
            extra,
        }
    }
}

/// Outcome of [`TrustRegistry::register_tool`]
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// The audience was already registered
    Existing(ToolRegistration),
    /// A new registration was cloned and persisted
    Added(ToolRegistration),
}

impl Registration {
    /// The registration, whichever way it was obtained
    #[must_use]
    pub fn tool(&self) -> &ToolRegistration {
        match self {
            Self::Existing(tool) | Self::Added(tool) => tool,
        }
    }
}

/// Thread-safe view over the trust document
pub struct TrustRegistry {
    path: Option<PathBuf>,
    config: RwLock<TrustConfig>,
}

impl TrustRegistry {
    /// Load the trust document at `path`; registrations are written back there
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read trust store {}: {e}", path.display()))
        })?;
        let config: TrustConfig = serde_json::from_str(&content)?;
        debug!(path = %path.display(), issuers = config.issuers.len(), "Loaded trust store");
        Ok(Self {
            path: Some(path.to_path_buf()),
            config: RwLock::new(config),
        })
    }

    /// In-memory registry; registrations are not persisted
    #[must_use]
    pub fn from_config(config: TrustConfig) -> Self {
        Self {
            path: None,
            config: RwLock::new(config),
        }
    }

    /// Whether `issuer` is in the trust store
    pub fn is_trusted(&self, issuer: &str) -> bool {
        self.config.read().issuers.contains_key(issuer)
    }

    /// Trusted issuer URLs
    pub fn issuers(&self) -> Vec<String> {
        self.config.read().issuers.keys().cloned().collect()
    }

    /// Snapshot of one issuer
    pub fn issuer(&self, issuer: &str) -> Option<TrustedIssuer> {
        self.config.read().issuers.get(issuer).cloned()
    }

    fn require_issuer(&self, issuer: &str) -> Result<TrustedIssuer> {
        self.issuer(issuer)
            .ok_or_else(|| Error::IssuerNotTrusted(issuer.to_string()))
    }

    /// OIDC authorization endpoint of `issuer`
    pub fn login_url(&self, issuer: &str) -> Result<String> {
        Ok(self.require_issuer(issuer)?.login_url)
    }

    /// Token endpoint of `issuer`
    pub fn token_url(&self, issuer: &str) -> Result<String> {
        Ok(self.require_issuer(issuer)?.token_url)
    }

    /// Key id for client assertions sent to `issuer`
    pub fn kid_for(&self, issuer: &str) -> Option<String> {
        let config = self.config.read();
        config
            .issuers
            .get(issuer)
            .and_then(|i| i.kid.clone())
            .or_else(|| config.kid.clone())
    }

    /// Tools registered under `issuer`
    pub fn tools(&self, issuer: &str) -> Vec<ToolRegistration> {
        self.config
            .read()
            .issuers
            .get(issuer)
            .map(|i| i.tools.clone())
            .unwrap_or_default()
    }

    /// The tool registered under `issuer` for `aud`
    pub fn tool(&self, issuer: &str, aud: &str) -> Option<ToolRegistration> {
        self.config
            .read()
            .issuers
            .get(issuer)?
            .tools
            .iter()
            .find(|t| t.aud == aud)
            .cloned()
    }

    /// JWKS endpoint for `(issuer, aud)`.
    ///
    /// An audience that is not registered yet gets the endpoint of the
    /// issuer's first tool with the audience substituted.
    pub fn jwks_endpoint(&self, issuer: &str, aud: &str) -> Result<String> {
        let config = self.config.read();
        let trusted = config
            .issuers
            .get(issuer)
            .ok_or_else(|| Error::IssuerNotTrusted(issuer.to_string()))?;
        if let Some(tool) = trusted.tools.iter().find(|t| t.aud == aud) {
            return Ok(tool.jwks_endpoint.clone());
        }
        trusted
            .tools
            .first()
            .map(|template| template.with_audience(aud).jwks_endpoint)
            .ok_or_else(|| Error::ToolNotRegistered {
                issuer: issuer.to_string(),
                aud: aud.to_string(),
            })
    }

    /// Ensure a tool is registered for `(issuer, aud)`.
    ///
    /// Lookup and insert happen under one write lock, so concurrent launches
    /// for the same new audience register it once.
    pub fn register_tool(&self, issuer: &str, aud: &str) -> Result<Registration> {
        if let Some(tool) = self.tool(issuer, aud) {
            return Ok(Registration::Existing(tool));
        }

        let mut config = self.config.write();
        let trusted = config
            .issuers
            .get(issuer)
            .ok_or_else(|| Error::IssuerNotTrusted(issuer.to_string()))?;
        if let Some(tool) = trusted.tools.iter().find(|t| t.aud == aud) {
            return Ok(Registration::Existing(tool.clone()));
        }
        let template = trusted.tools.first().ok_or_else(|| Error::ToolNotRegistered {
            issuer: issuer.to_string(),
            aud: aud.to_string(),
        })?;
        let tool = template.with_audience(aud);

        let mut updated = config.clone();
        if let Some(entry) = updated.issuers.get_mut(issuer) {
            entry.tools.push(tool.clone());
        }
        self.persist(&updated)?;
        *config = updated;

        info!(issuer = %issuer, aud = %aud, "Registered new tool audience");
        Ok(Registration::Added(tool))
    }

    fn persist(&self, config: &TrustConfig) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(config)?;
        fs::write(path, json)?;
        debug!(path = %path.display(), "Wrote trust store");
        Ok(())
    }
}
