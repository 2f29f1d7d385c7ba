//! Launch token verification against platform-published keys
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid`.
//! 2. Resolve the JWKS endpoint of `(issuer, audience)` in the trust store.
//! 3. Fetch the JWKS through the shared transport (cached when the endpoint
//!    is mounted) and derive an RSA public key for every entry. Derived keys
//!    are memoized by `(e, n, kty)` for slightly less than the JWKS TTL.
//! 4. Look up `kid`; require `kty == "RSA"` and a declared `alg`.
//! 5. Verify signature, audience, issuer and `exp` with clock leeway.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cache::TtlLruCache;
use crate::transport::{HttpRequest, Transport, media};
use crate::trust::TrustRegistry;
use crate::{Error, Result};

/// Margin by which derived keys expire before the JWKS response they came from
pub const DERIVED_KEY_MARGIN: Duration = Duration::from_secs(5);

/// One entry of a JWKS document
#[derive(Debug, Clone, Deserialize)]
pub struct JwkEntry {
    /// Key type
    pub kty: String,
    /// Declared signing algorithm
    #[serde(default)]
    pub alg: Option<String>,
    /// Intended usage (`sig`)
    #[serde(default, rename = "use")]
    pub usage: Option<String>,
    /// Key id
    #[serde(default)]
    pub kid: Option<String>,
    /// RSA public exponent, base64
    #[serde(default)]
    pub e: String,
    /// RSA modulus, base64url
    #[serde(default)]
    pub n: String,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    #[serde(default)]
    keys: Vec<JwkEntry>,
}

/// Big-endian RSA public key components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    /// Modulus
    pub n: Vec<u8>,
    /// Exponent
    pub e: Vec<u8>,
}

impl RsaPublicKey {
    fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_rsa_raw_components(&self.n, &self.e)
    }
}

/// Memo key for derived public keys
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DerivedKeyId {
    e: String,
    n: String,
    kty: String,
}

/// A platform key as held by the verifier
#[derive(Debug, Clone)]
pub struct VerificationKey {
    /// Key type
    pub kty: String,
    /// Declared algorithm
    pub alg: Option<String>,
    /// Declared usage
    pub usage: Option<String>,
    /// Derived public key; `None` for non-RSA or malformed entries
    pub material: Option<Arc<RsaPublicKey>>,
}

/// Decode base64 leniently: padding optional, URL-safe or standard alphabet
fn decode_component(value: &str) -> Option<Vec<u8>> {
    let trimmed = value.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .ok()?;
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let unsigned = bytes[first..].to_vec();
    (!unsigned.is_empty()).then_some(unsigned)
}

/// Derive an RSA public key from JWK components
#[must_use]
pub fn derive_rsa_key(e: &str, n: &str, kty: &str) -> Option<RsaPublicKey> {
    if kty != "RSA" {
        return None;
    }
    Some(RsaPublicKey {
        n: decode_component(n)?,
        e: decode_component(e)?,
    })
}

fn is_rsa_algorithm(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
    )
}

/// Verifies launch tokens for every trusted issuer
pub struct KeyVerifier {
    registry: Arc<TrustRegistry>,
    transport: Arc<dyn Transport>,
    derived: TtlLruCache<DerivedKeyId, Option<Arc<RsaPublicKey>>>,
    derived_ttl: Duration,
    keys: Mutex<HashMap<String, HashMap<String, VerificationKey>>>,
    leeway: u64,
}

impl KeyVerifier {
    /// Create a verifier.
    ///
    /// `jwks_ttl` is the TTL the JWKS endpoints are mounted with;
    /// `key_max_entries` bounds the derived-key memo.
    #[must_use]
    pub fn new(
        registry: Arc<TrustRegistry>,
        transport: Arc<dyn Transport>,
        jwks_ttl: Duration,
        key_max_entries: usize,
        leeway: u64,
    ) -> Self {
        Self {
            registry,
            transport,
            derived: TtlLruCache::new(key_max_entries),
            derived_ttl: jwks_ttl.saturating_sub(DERIVED_KEY_MARGIN),
            keys: Mutex::new(HashMap::new()),
            leeway,
        }
    }

    fn derive(&self, entry: &JwkEntry) -> Option<Arc<RsaPublicKey>> {
        let id = DerivedKeyId {
            e: entry.e.clone(),
            n: entry.n.clone(),
            kty: entry.kty.clone(),
        };
        self.derived.get_or_compute(id, Some(self.derived_ttl), || {
            derive_rsa_key(&entry.e, &entry.n, &entry.kty).map(Arc::new)
        })
    }

    /// Fetch the JWKS at `endpoint` and return the key named `kid`.
    ///
    /// The fetched set replaces everything held for `endpoint`, so a key the
    /// platform has dropped stops verifying as soon as the JWKS is refetched.
    pub async fn fetch_key(&self, endpoint: &str, kid: &str) -> Result<VerificationKey> {
        let request = HttpRequest::get(endpoint)
            .header("Accept", media::JSON)
            .header("Content-Type", media::JSON);
        let jwks: JwkSet = self.transport.send(request).await?.json()?;

        let fetched: HashMap<String, VerificationKey> = jwks
            .keys
            .iter()
            .filter_map(|entry| {
                let entry_kid = entry.kid.clone()?;
                let key = VerificationKey {
                    kty: entry.kty.clone(),
                    alg: entry.alg.clone(),
                    usage: entry.usage.clone(),
                    material: self.derive(entry),
                };
                Some((entry_kid, key))
            })
            .collect();
        debug!(endpoint = %endpoint, keys = fetched.len(), "Fetched platform JWKS");

        let key = fetched.get(kid).cloned();
        self.keys.lock().insert(endpoint.to_string(), fetched);
        key.ok_or_else(|| Error::KeyNotFound(kid.to_string()))
    }

    /// Verify `token` as issued by `issuer` for `audience` and decode its claims
    pub async fn verify_and_decode<T: DeserializeOwned>(
        &self,
        token: &str,
        issuer: &str,
        audience: &str,
    ) -> Result<T> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| Error::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::InvalidToken("missing kid in header".to_string()))?;

        let endpoint = self.registry.jwks_endpoint(issuer, audience)?;
        let key = self.fetch_key(&endpoint, &kid).await?;

        if key.kty != "RSA" {
            return Err(Error::UnsupportedAlgorithm(key.kty));
        }
        let alg_name = key.alg.ok_or(Error::KeyNotSigned)?;
        let alg = Algorithm::from_str(&alg_name)
            .ok()
            .filter(|alg| is_rsa_algorithm(*alg))
            .ok_or_else(|| Error::UnsupportedAlgorithm(alg_name.clone()))?;
        let material = key
            .material
            .ok_or_else(|| Error::InvalidToken(format!("malformed RSA key {kid}")))?;

        let mut validation = Validation::new(alg);
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer]);
        validation.leeway = self.leeway;

        let data = jsonwebtoken::decode::<T>(token, &material.decoding_key(), &validation)
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        debug!(issuer = %issuer, kid = %kid, "Verified launch token");
        Ok(data.claims)
    }

    /// Number of keys held across all endpoints
    pub fn held_keys(&self) -> usize {
        self.keys.lock().values().map(HashMap::len).sum()
    }

    /// TTL of memoized derived keys: the JWKS TTL less [`DERIVED_KEY_MARGIN`]
    pub fn derived_ttl(&self) -> Duration {
        self.derived_ttl
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::{Value, json};

    use super::*;
    use crate::transport::{CachingTransport, HttpResponse};
    use crate::trust::TrustConfig;

    const ISS: &str = "https://lms.example";
    const AUD: &str = "client-a";
    const JWKS_URL: &str = "https://lms.example/mod/lti/certs.php";
    const PRIVATE_PEM: &str = include_str!("../tests/fixtures/private.pem");
    const JWKS: &str = include_str!("../tests/fixtures/jwks.json");

    struct StaticJwks {
        body: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for StaticJwks {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: 200,
                body: Bytes::from(self.body.clone()),
            })
        }
    }

    /// Serves whatever JWKS body is current; the platform can rotate it
    struct RotatingJwks {
        body: Mutex<String>,
        calls: AtomicUsize,
    }

    impl RotatingJwks {
        fn new(body: &str) -> Arc<Self> {
            Arc::new(Self {
                body: Mutex::new(body.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn rotate(&self, body: &str) {
            *self.body.lock() = body.to_string();
        }
    }

    #[async_trait]
    impl Transport for RotatingJwks {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: 200,
                body: Bytes::from(self.body.lock().clone()),
            })
        }
    }

    const NO_KEYS: &str = r#"{"keys":[]}"#;

    fn registry() -> Arc<TrustRegistry> {
        let config: TrustConfig = serde_json::from_value(json!({
            "issuers": {
                ISS: {
                    "login_url": "https://lms.example/mod/lti/auth.php",
                    "token_url": "https://lms.example/mod/lti/token.php",
                    "tools": [{ "aud": AUD, "jwks_endpoint": JWKS_URL }]
                }
            }
        }))
        .unwrap();
        Arc::new(TrustRegistry::from_config(config))
    }

    fn verifier_with(body: &str) -> KeyVerifier {
        let transport = Arc::new(StaticJwks {
            body: body.to_string(),
            calls: AtomicUsize::new(0),
        });
        KeyVerifier::new(registry(), transport, Duration::from_secs(3600), 8, 60)
    }

    fn sign(claims: &Value, kid: Option<&str>) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_string);
        let key = EncodingKey::from_rsa_pem(PRIVATE_PEM.as_bytes()).unwrap();
        jsonwebtoken::encode(&header, claims, &key).unwrap()
    }

    fn claims(aud: &str) -> Value {
        let now = chrono::Utc::now().timestamp();
        json!({ "iss": ISS, "aud": aud, "sub": "2", "iat": now, "exp": now + 300, "nonce": "n-1" })
    }

    fn jwks_with(entry: Value) -> String {
        json!({ "keys": [entry] }).to_string()
    }

    #[tokio::test]
    async fn verifies_token_signed_by_platform_key() {
        let verifier = verifier_with(JWKS);
        let token = sign(&claims(AUD), Some("test-key-1"));

        let decoded: Value = verifier.verify_and_decode(&token, ISS, AUD).await.unwrap();
        assert_eq!(decoded["sub"], "2");
        assert_eq!(decoded["nonce"], "n-1");
        assert_eq!(verifier.held_keys(), 1);
    }

    #[tokio::test]
    async fn wrong_audience_is_invalid() {
        let verifier = verifier_with(JWKS);
        let token = sign(&claims("someone-else"), Some("test-key-1"));

        let err = verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)), "{err}");
    }

    #[tokio::test]
    async fn expired_token_is_invalid() {
        let verifier = verifier_with(JWKS);
        let now = chrono::Utc::now().timestamp();
        let stale = json!({ "iss": ISS, "aud": AUD, "iat": now - 900, "exp": now - 600 });
        let token = sign(&stale, Some("test-key-1"));

        let err = verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_kid_is_invalid() {
        let verifier = verifier_with(JWKS);
        let token = sign(&claims(AUD), None);

        let err = verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));
    }

    #[tokio::test]
    async fn unknown_kid_is_key_not_found() {
        let verifier = verifier_with(JWKS);
        let token = sign(&claims(AUD), Some("rotated-away"));

        let err = verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(kid) if kid == "rotated-away"));
    }

    #[tokio::test]
    async fn non_rsa_key_is_unsupported() {
        let body = jwks_with(json!({
            "kty": "EC", "alg": "ES256", "kid": "ec-1", "crv": "P-256", "x": "AA", "y": "AA"
        }));
        let verifier = verifier_with(&body);
        let token = sign(&claims(AUD), Some("ec-1"));

        let err = verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(kty) if kty == "EC"));
    }

    #[tokio::test]
    async fn key_without_alg_is_not_signed() {
        let mut entry: Value = serde_json::from_str::<Value>(JWKS).unwrap()["keys"][0].clone();
        entry.as_object_mut().unwrap().remove("alg");
        let verifier = verifier_with(&jwks_with(entry));
        let token = sign(&claims(AUD), Some("test-key-1"));

        let err = verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap_err();
        assert!(matches!(err, Error::KeyNotSigned));
    }

    #[tokio::test]
    async fn untrusted_issuer_is_rejected_before_fetch() {
        let verifier = verifier_with(JWKS);
        let token = sign(&claims(AUD), Some("test-key-1"));

        let err = verifier
            .verify_and_decode::<Value>(&token, "https://evil.example", AUD)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IssuerNotTrusted(_)));
        assert_eq!(verifier.held_keys(), 0);
    }

    #[test]
    fn components_decode_with_or_without_padding() {
        let plain = derive_rsa_key("AQAB", "AQAB", "RSA").unwrap();
        let padded = derive_rsa_key("AQAB====", "AQAB==", "RSA").unwrap();
        assert_eq!(plain, padded);
        assert_eq!(plain.e, vec![0x01, 0x00, 0x01]);
    }

    #[test]
    fn leading_zero_bytes_are_stripped() {
        let key = derive_rsa_key("AQAB", "AAEC", "RSA").unwrap();
        assert_eq!(key.n, vec![0x01, 0x02]);
    }

    #[test]
    fn non_rsa_components_derive_nothing() {
        assert_eq!(derive_rsa_key("AQAB", "AQAB", "EC"), None);
        assert_eq!(derive_rsa_key("!!", "AQAB", "RSA"), None);
    }

    #[tokio::test]
    async fn rotated_out_key_no_longer_verifies() {
        let platform = RotatingJwks::new(JWKS);
        let verifier = KeyVerifier::new(registry(), platform.clone(), Duration::from_secs(3600), 8, 60);
        let token = sign(&claims(AUD), Some("test-key-1"));

        verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap();
        assert_eq!(verifier.held_keys(), 1);

        platform.rotate(NO_KEYS);
        let err = verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap_err();

        assert_eq!(platform.calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, Error::KeyNotFound(kid) if kid == "test-key-1"));
        assert_eq!(verifier.held_keys(), 0);
    }

    #[test]
    fn derived_keys_expire_before_jwks() {
        let verifier = verifier_with(JWKS);
        assert_eq!(verifier.derived_ttl(), Duration::from_secs(3600) - DERIVED_KEY_MARGIN);

        let short = KeyVerifier::new(
            registry(),
            RotatingJwks::new(JWKS),
            Duration::from_secs(6),
            8,
            60,
        );
        assert_eq!(short.derived_ttl(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn derived_key_is_rederived_while_jwks_is_still_cached() {
        let platform = RotatingJwks::new(JWKS);
        let cached = Arc::new(CachingTransport::new(platform.clone(), 8));
        let jwks_ttl = DERIVED_KEY_MARGIN + Duration::from_millis(200);
        cached.mount(JWKS_URL, jwks_ttl);
        let verifier = KeyVerifier::new(registry(), cached.clone(), jwks_ttl, 8, 60);
        let token = sign(&claims(AUD), Some("test-key-1"));

        verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap();

        // JWKS response still cached, derived key already expired
        assert_eq!(platform.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached.stats().hits, 1);
        let derived = verifier.derived.stats();
        assert_eq!(derived.expirations, 1);
        assert_eq!(derived.hits, 0);
    }

    #[tokio::test]
    async fn jwks_refetch_after_ttl_changes_which_keys_verify() {
        let platform = RotatingJwks::new(JWKS);
        let cached = Arc::new(CachingTransport::new(platform.clone(), 8));
        cached.mount(JWKS_URL, Duration::from_millis(200));
        let verifier = KeyVerifier::new(registry(), cached, Duration::from_secs(3600), 8, 60);
        let token = sign(&claims(AUD), Some("test-key-1"));

        verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap();

        // Rotation is invisible until the cached JWKS expires
        platform.rotate(NO_KEYS);
        verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap();
        assert_eq!(platform.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = verifier.verify_and_decode::<Value>(&token, ISS, AUD).await.unwrap_err();
        assert_eq!(platform.calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, Error::KeyNotFound(_)));
    }
}
