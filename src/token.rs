//! OAuth2 client-credentials exchange with a signed client assertion
//!
//! The tool proves its identity to a platform token endpoint with a short-lived
//! RS256 JWT (`iss = sub = client_id`, `aud = token_url`). The bearer token
//! that comes back is held per `(issuer, client_id)` and reused while its
//! scope set covers what a call needs.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::transport::{Body, HttpRequest, Transport, media};
use crate::trust::TrustRegistry;
use crate::{Error, Result};

/// `client_assertion_type` of a JWT-bearer client assertion
pub const JWT_BEARER: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a client assertion in seconds
pub const ASSERTION_LIFETIME_SECS: u64 = 60;

/// Seconds before `expires_at` a held token stops being reused
const EXPIRY_BUFFER_SECS: u64 = 60;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The tool's RSA signing key pair
pub struct RsaKeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl RsaKeyPair {
    /// Parse PEM-encoded private and public keys
    pub fn from_pem(private_pem: &[u8], public_pem: &[u8]) -> Result<Self> {
        let encoding = EncodingKey::from_rsa_pem(private_pem)
            .map_err(|e| Error::Config(format!("Invalid RSA private key: {e}")))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem)
            .map_err(|e| Error::Config(format!("Invalid RSA public key: {e}")))?;
        Ok(Self { encoding, decoding })
    }

    /// Read both keys from PEM files
    pub fn load(private_key: impl AsRef<Path>, public_key: impl AsRef<Path>) -> Result<Self> {
        let read = |path: &Path| {
            fs::read(path)
                .map_err(|e| Error::Config(format!("Cannot read key {}: {e}", path.display())))
        };
        Self::from_pem(&read(private_key.as_ref())?, &read(public_key.as_ref())?)
    }

    /// Key for signing client assertions
    #[must_use]
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    /// Public half, for checking assertions this tool signed
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}

/// Claims of a client assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAssertionClaims {
    /// Client id
    pub iss: String,
    /// Client id
    pub sub: String,
    /// Token endpoint URL
    pub aud: String,
    /// Issued at (Unix seconds)
    pub iat: u64,
    /// Expiry (Unix seconds), `iat + 60`
    pub exp: u64,
}

impl ClientAssertionClaims {
    /// Claims for `client_id` addressed to `token_url`, issued now
    #[must_use]
    pub fn new(client_id: &str, token_url: &str) -> Self {
        let iat = unix_now();
        Self {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: token_url.to_string(),
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        }
    }
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// A bearer token and the scopes it was granted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Bearer token
    pub access_token: String,
    /// Space-delimited granted scopes
    pub scope: String,
    /// Absolute expiry (Unix seconds), when the platform reported one
    pub expires_at: Option<u64>,
}

impl AccessToken {
    /// Build from a token response received now
    #[must_use]
    pub fn new(access_token: String, scope: String, expires_in: Option<u64>) -> Self {
        Self {
            access_token,
            scope,
            expires_at: expires_in.map(|secs| unix_now() + secs),
        }
    }

    /// Granted scopes as a set
    #[must_use]
    pub fn scopes(&self) -> BTreeSet<&str> {
        self.scope.split(' ').filter(|s| !s.is_empty()).collect()
    }

    /// Whether every scope in `requested` was granted
    pub fn covers<S: AsRef<str>>(&self, requested: &[S]) -> bool {
        let granted = self.scopes();
        requested.iter().all(|s| granted.contains(s.as_ref()))
    }

    /// Whether the token is within 60 seconds of its expiry
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| unix_now() + EXPIRY_BUFFER_SECS >= expires_at)
    }
}

/// Obtains and holds platform access tokens
pub struct TokenManager {
    registry: Arc<TrustRegistry>,
    transport: Arc<dyn Transport>,
    keys: Arc<RsaKeyPair>,
    held: Mutex<HashMap<(String, String), AccessToken>>,
}

impl TokenManager {
    /// Create a token manager
    #[must_use]
    pub fn new(
        registry: Arc<TrustRegistry>,
        transport: Arc<dyn Transport>,
        keys: Arc<RsaKeyPair>,
    ) -> Self {
        Self {
            registry,
            transport,
            keys,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Sign a client assertion for `client_id` at `issuer`'s token endpoint
    pub fn client_assertion(&self, issuer: &str, client_id: &str) -> Result<String> {
        let token_url = self.registry.token_url(issuer)?;
        let claims = ClientAssertionClaims::new(client_id, &token_url);
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.registry.kid_for(issuer);
        jsonwebtoken::encode(&header, &claims, self.keys.encoding_key())
            .map_err(|e| Error::Signing(e.to_string()))
    }

    /// Exchange a fresh client assertion for an access token.
    ///
    /// The new token replaces whatever was held for `(issuer, client_id)`.
    pub async fn get_access_token<S: AsRef<str>>(
        &self,
        issuer: &str,
        client_id: &str,
        scopes: &[S],
    ) -> Result<AccessToken> {
        let token_url = self.registry.token_url(issuer)?;
        let assertion = self.client_assertion(issuer, client_id)?;
        let scope = scopes
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" ");

        let body = Body::Form(vec![
            ("grant_type".into(), "client_credentials".into()),
            ("client_assertion_type".into(), JWT_BEARER.into()),
            ("client_assertion".into(), assertion),
            ("scope".into(), scope),
        ]);
        let request = HttpRequest::post(&token_url, body)
            .header("Accept", media::JSON)
            .header("Content-Type", media::FORM);
        let response: TokenResponse = self.transport.send(request).await?.json()?;

        let token = AccessToken::new(
            response.access_token,
            response.scope.unwrap_or_default(),
            response.expires_in,
        );
        info!(issuer = %issuer, client_id = %client_id, scope = %token.scope, "Obtained access token");
        self.held
            .lock()
            .insert((issuer.to_string(), client_id.to_string()), token.clone());
        Ok(token)
    }

    /// Token covering `scopes`, reusing the held one when possible
    pub async fn authorize<S: AsRef<str>>(
        &self,
        issuer: &str,
        client_id: &str,
        scopes: &[S],
    ) -> Result<AccessToken> {
        let held = self
            .held
            .lock()
            .get(&(issuer.to_string(), client_id.to_string()))
            .filter(|t| t.covers(scopes) && !t.is_expired())
            .cloned();
        if let Some(token) = held {
            debug!(issuer = %issuer, client_id = %client_id, "Reusing held access token");
            return Ok(token);
        }
        self.get_access_token(issuer, client_id, scopes).await
    }

    /// Token currently held for `(issuer, client_id)`
    pub fn held(&self, issuer: &str, client_id: &str) -> Option<AccessToken> {
        self.held
            .lock()
            .get(&(issuer.to_string(), client_id.to_string()))
            .cloned()
    }
}
