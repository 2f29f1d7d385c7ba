//! OIDC third-party-initiated login and LTI launch
//!
//! ```text
//! Unauthenticated --login()--> LoginInitiated --launch()--> Launched
//!                                    \--------- Err(_) ---> Failed
//! ```
//!
//! [`LtiTool`] owns the process-wide collaborators (trust registry, cached
//! transport, key verifier, token manager) and is shared by every request.
//! Session state is passed in per call.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ags::GradeService;
use crate::config::Config;
use crate::jwks::KeyVerifier;
use crate::lms::LmsClient;
use crate::roles::RoleSet;
use crate::session::{ContextDescriptor, SessionContext, SessionStore, keys};
use crate::token::{RsaKeyPair, TokenManager};
use crate::transport::{CachingTransport, ReqwestTransport, Transport};
use crate::trust::{Registration, TrustRegistry};
use crate::{Error, Result};

/// LTI claim URIs
pub mod claims {
    /// Deployment id
    pub const DEPLOYMENT_ID: &str = "https://purl.imsglobal.org/spec/lti/claim/deployment_id";
    /// Message type
    pub const MESSAGE_TYPE: &str = "https://purl.imsglobal.org/spec/lti/claim/message_type";
    /// Roles
    pub const ROLES: &str = "https://purl.imsglobal.org/spec/lti/claim/roles";
    /// Context
    pub const CONTEXT: &str = "https://purl.imsglobal.org/spec/lti/claim/context";
    /// Resource link
    pub const RESOURCE_LINK: &str = "https://purl.imsglobal.org/spec/lti/claim/resource_link";
    /// Target link URI
    pub const TARGET_LINK_URI: &str = "https://purl.imsglobal.org/spec/lti/claim/target_link_uri";
    /// AGS endpoint
    pub const AGS_ENDPOINT: &str = "https://purl.imsglobal.org/spec/lti-ags/claim/endpoint";
    /// NRPS endpoint
    pub const NRPS: &str = "https://purl.imsglobal.org/spec/lti-nrps/claim/namesroleservice";
}

/// Login initiation parameters posted by the platform
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Platform issuer
    #[serde(default)]
    pub iss: Option<String>,
    /// Where the platform should post the launch
    #[serde(default)]
    pub target_link_uri: Option<String>,
    /// Opaque user hint, echoed back
    #[serde(default)]
    pub login_hint: Option<String>,
    /// Opaque message hint, echoed back
    #[serde(default)]
    pub lti_message_hint: Option<String>,
    /// Tool client id
    #[serde(default)]
    pub client_id: Option<String>,
    /// Deployment id
    #[serde(default)]
    pub lti_deployment_id: Option<String>,
}

impl LoginRequest {
    /// Whether every login initiation parameter is present
    #[must_use]
    pub fn is_lti_login_request(&self) -> bool {
        self.iss.is_some()
            && self.target_link_uri.is_some()
            && self.login_hint.is_some()
            && self.lti_message_hint.is_some()
            && self.client_id.is_some()
            && self.lti_deployment_id.is_some()
    }
}

/// Launch parameters posted by the platform
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Signed launch token
    #[serde(default)]
    pub id_token: Option<String>,
    /// State issued at login
    #[serde(default)]
    pub state: Option<String>,
}

/// Resource link claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLink {
    /// Resource link id
    pub id: String,
    /// Title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// AGS endpoint claim
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgsEndpoint {
    /// Scopes the platform grants
    #[serde(default)]
    pub scope: Vec<String>,
    /// Line items container URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineitems: Option<String>,
    /// Line item of the launched resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineitem: Option<String>,
}

/// NRPS claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamesRoleService {
    /// Memberships URL
    pub context_memberships_url: String,
    /// Supported versions
    #[serde(default)]
    pub service_versions: Vec<String>,
}

/// Claims of a verified launch token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchClaims {
    /// Issuer
    pub iss: String,
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
    /// Nonce echoed from login
    #[serde(default)]
    pub nonce: Option<String>,
    /// Deployment id
    #[serde(default, rename = "https://purl.imsglobal.org/spec/lti/claim/deployment_id")]
    pub deployment_id: Option<String>,
    /// Message type (`LtiResourceLinkRequest`, ...)
    #[serde(default, rename = "https://purl.imsglobal.org/spec/lti/claim/message_type")]
    pub message_type: Option<String>,
    /// Role URNs
    #[serde(default, rename = "https://purl.imsglobal.org/spec/lti/claim/roles")]
    pub roles: Vec<String>,
    /// Course context
    #[serde(default, rename = "https://purl.imsglobal.org/spec/lti/claim/context")]
    pub context: Option<ContextDescriptor>,
    /// Resource link
    #[serde(default, rename = "https://purl.imsglobal.org/spec/lti/claim/resource_link")]
    pub resource_link: Option<ResourceLink>,
    /// Target link URI
    #[serde(default, rename = "https://purl.imsglobal.org/spec/lti/claim/target_link_uri")]
    pub target_link_uri: Option<String>,
    /// AGS endpoint
    #[serde(default, rename = "https://purl.imsglobal.org/spec/lti-ags/claim/endpoint")]
    pub ags: Option<AgsEndpoint>,
    /// NRPS endpoint
    #[serde(default, rename = "https://purl.imsglobal.org/spec/lti-nrps/claim/namesroleservice")]
    pub nrps: Option<NamesRoleService>,
    /// Remaining claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LaunchClaims {
    /// Session context for a launch verified against `aud`
    #[must_use]
    pub fn to_session_context(&self, aud: &str) -> SessionContext {
        SessionContext {
            iss: Some(self.iss.clone()),
            aud: Some(aud.to_string()),
            deployment_id: self.deployment_id.clone(),
            sub: self.sub.clone(),
            roles: RoleSet::from_claims(&self.roles),
            context: self.context.clone(),
            line_items_url: self.ags.as_ref().and_then(|a| a.lineitems.clone()),
            line_item_url: self.ags.as_ref().and_then(|a| a.lineitem.clone()),
            resource_link_id: self.resource_link.as_ref().map(|r| r.id.clone()),
            message_type: self.message_type.clone(),
            memberships_url: self
                .nrps
                .as_ref()
                .map(|n| n.context_memberships_url.clone()),
        }
    }
}

/// A completed launch
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    /// Where to send the user
    pub redirect: String,
    /// What was stored in the session
    pub context: SessionContext,
    /// Verified claims
    pub claims: LaunchClaims,
}

/// Cache policy and launch defaults
#[derive(Debug, Clone)]
pub struct ToolSettings {
    /// TTL of cached token endpoint responses
    pub token_ttl: Duration,
    /// TTL of cached JWKS responses
    pub jwks_ttl: Duration,
    /// Maximum memoized derived keys
    pub key_max_entries: usize,
    /// Landing route when no `next_url` was stored
    pub default_redirect: String,
    /// Clock leeway for launch tokens (seconds)
    pub clock_leeway_secs: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ToolSettings {
    fn from(config: &Config) -> Self {
        Self {
            token_ttl: config.cache.token_ttl,
            jwks_ttl: config.cache.jwks_ttl,
            key_max_entries: config.cache.key_max_entries,
            default_redirect: config.launch.default_redirect.clone(),
            clock_leeway_secs: config.launch.clock_leeway_secs,
        }
    }
}

fn required(value: Option<&String>, name: &'static str) -> Result<String> {
    value.cloned().ok_or(Error::MissingParameter(name))
}

fn append_query(base: &str, pairs: &[(&str, &str)]) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}

/// Process-wide LTI tool
pub struct LtiTool {
    registry: Arc<TrustRegistry>,
    transport: Arc<CachingTransport>,
    verifier: KeyVerifier,
    tokens: Arc<TokenManager>,
    settings: ToolSettings,
}

impl LtiTool {
    /// Assemble a tool from its collaborators
    #[must_use]
    pub fn new(
        registry: Arc<TrustRegistry>,
        transport: Arc<CachingTransport>,
        keys: Arc<RsaKeyPair>,
        settings: ToolSettings,
    ) -> Self {
        let shared: Arc<dyn Transport> = transport.clone();
        let verifier = KeyVerifier::new(
            Arc::clone(&registry),
            Arc::clone(&shared),
            settings.jwks_ttl,
            settings.key_max_entries,
            settings.clock_leeway_secs,
        );
        let tokens = Arc::new(TokenManager::new(Arc::clone(&registry), shared, keys));
        Self {
            registry,
            transport,
            verifier,
            tokens,
            settings,
        }
    }

    /// Build from configuration: load trust store and keys, create the live
    /// transport and mount the default cache policy
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Arc::new(TrustRegistry::load(&config.trust_file)?);
        let keys = Arc::new(RsaKeyPair::load(
            &config.keys.private_key,
            &config.keys.public_key,
        )?);
        let live = Arc::new(ReqwestTransport::new(config.http.timeout)?);
        let transport = Arc::new(CachingTransport::new(live, config.cache.max_entries));
        let tool = Self::new(registry, transport, keys, ToolSettings::from(config));
        tool.mount_defaults();
        Ok(tool)
    }

    /// Mount every issuer's token endpoint and every tool's JWKS endpoint
    pub fn mount_defaults(&self) {
        for issuer in self.registry.issuers() {
            let Some(trusted) = self.registry.issuer(&issuer) else {
                continue;
            };
            self.transport
                .mount(trusted.token_url.clone(), self.settings.token_ttl);
            for tool in &trusted.tools {
                self.transport
                    .mount(tool.jwks_endpoint.clone(), self.settings.jwks_ttl);
            }
        }
    }

    /// Trust registry
    #[must_use]
    pub fn registry(&self) -> &Arc<TrustRegistry> {
        &self.registry
    }

    /// Shared caching transport
    #[must_use]
    pub fn transport(&self) -> &Arc<CachingTransport> {
        &self.transport
    }

    /// Launch token verifier
    #[must_use]
    pub fn verifier(&self) -> &KeyVerifier {
        &self.verifier
    }

    /// Token manager
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Start the handshake: issue state and nonce, return the platform
    /// authorization redirect.
    ///
    /// `next_url` is kept for the post-launch redirect; `None` clears any
    /// previous one.
    pub fn login<S: SessionStore + ?Sized>(
        &self,
        form: &LoginRequest,
        session: &mut S,
        next_url: Option<&str>,
    ) -> Result<String> {
        let iss = required(form.iss.as_ref(), "iss")?;
        if !self.registry.is_trusted(&iss) {
            warn!(issuer = %iss, "Login from untrusted issuer");
            return Err(Error::IssuerNotTrusted(iss));
        }
        let target_link_uri = form
            .target_link_uri
            .clone()
            .ok_or(Error::TargetUriMissing)?;
        let client_id = required(form.client_id.as_ref(), "client_id")?;
        let login_hint = required(form.login_hint.as_ref(), "login_hint")?;
        let login_url = self.registry.login_url(&iss)?;

        let state = Uuid::new_v4().to_string();
        let nonce = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        session.set(keys::STATE, Value::String(state.clone()));
        session.set(keys::NONCE, Value::String(nonce.clone()));

        let mut params = vec![
            ("scope", "openid"),
            ("response_type", "id_token"),
            ("client_id", client_id.as_str()),
            ("redirect_uri", target_link_uri.as_str()),
            ("login_hint", login_hint.as_str()),
        ];
        if let Some(hint) = &form.lti_message_hint {
            params.push(("lti_message_hint", hint.as_str()));
        }
        params.extend([
            ("state", state.as_str()),
            ("response_mode", "form_post"),
            ("nonce", nonce.as_str()),
        ]);
        let redirect = append_query(&login_url, &params);

        session.set(keys::ISS, Value::String(iss.clone()));
        session.set(keys::AUD, Value::String(client_id.clone()));
        match next_url {
            Some(next) => session.set(keys::NEXT_URL, Value::String(next.to_string())),
            None => {
                session.remove(keys::NEXT_URL);
            }
        }

        info!(issuer = %iss, client_id = %client_id, "Login initiated");
        Ok(redirect)
    }

    /// Complete the handshake: check state, verify the token, check nonce,
    /// populate the session and register the audience if it is new.
    pub async fn launch<S: SessionStore + ?Sized>(
        &self,
        form: &LaunchRequest,
        session: &mut S,
    ) -> Result<LaunchOutcome> {
        let outcome = self.complete_launch(form, session).await;
        if let Err(e) = &outcome {
            warn!(error = %e, "Launch rejected");
        }
        outcome
    }

    async fn complete_launch<S: SessionStore + ?Sized>(
        &self,
        form: &LaunchRequest,
        session: &mut S,
    ) -> Result<LaunchOutcome> {
        let state_ok = form
            .state
            .as_ref()
            .is_some_and(|s| session.validate(keys::STATE, &Value::String(s.clone())));
        session.remove(keys::STATE);
        if !state_ok {
            return Err(Error::State);
        }

        let token = form
            .id_token
            .as_deref()
            .ok_or(Error::MissingParameter("id_token"))?;
        let iss = session
            .get_str(keys::ISS)
            .ok_or(Error::MissingSessionValue(keys::ISS))?;
        let aud = session
            .get_str(keys::AUD)
            .ok_or(Error::MissingSessionValue(keys::AUD))?;

        let claims: LaunchClaims = self.verifier.verify_and_decode(token, &iss, &aud).await?;

        let nonce_ok = claims
            .nonce
            .as_ref()
            .is_some_and(|n| session.validate(keys::NONCE, &Value::String(n.clone())));
        session.remove(keys::NONCE);
        if !nonce_ok {
            return Err(Error::Nonce);
        }

        let context = claims.to_session_context(&aud);
        context.store(session);

        if let Registration::Added(tool) = self.registry.register_tool(&iss, &aud)? {
            self.transport
                .mount(tool.jwks_endpoint.clone(), self.settings.jwks_ttl);
        }

        let redirect = session
            .remove(keys::NEXT_URL)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| self.settings.default_redirect.clone());

        info!(
            issuer = %iss,
            aud = %aud,
            sub = claims.sub.as_deref().unwrap_or_default(),
            "Launch completed"
        );
        Ok(LaunchOutcome {
            redirect,
            context,
            claims,
        })
    }

    /// Client for token-gated calls on behalf of the launched session
    pub fn lms_client<S: SessionStore + ?Sized>(&self, session: &S) -> Result<LmsClient> {
        let iss = session
            .get_str(keys::ISS)
            .ok_or(Error::MissingSessionValue(keys::ISS))?;
        let aud = session
            .get_str(keys::AUD)
            .ok_or(Error::MissingSessionValue(keys::AUD))?;
        let shared: Arc<dyn Transport> = self.transport.clone();
        Ok(LmsClient::new(iss, aud, Arc::clone(&self.tokens), shared))
    }

    /// Grade service for the launched session
    pub fn grade_service<S: SessionStore + ?Sized>(&self, session: &S) -> Result<GradeService> {
        let client = self.lms_client(session)?;
        Ok(GradeService::new(client, &SessionContext::from_session(session)))
    }
}
