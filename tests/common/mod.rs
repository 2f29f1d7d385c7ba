//! Shared fixtures: an in-memory platform and launch helpers

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};

use lti_tool::launch::{ToolSettings, claims};
use lti_tool::session::{MemorySession, SessionStore, keys};
use lti_tool::token::RsaKeyPair;
use lti_tool::transport::{Body, CachingTransport, HttpRequest, HttpResponse, Method, Transport};
use lti_tool::trust::{TrustConfig, TrustRegistry};
use lti_tool::{Error, LaunchRequest, LoginRequest, LtiTool, Result};

pub const ISS: &str = "https://lms.example";
pub const CLIENT_ID: &str = "client-a";
pub const LOGIN_URL: &str = "https://lms.example/mod/lti/auth.php";
pub const TOKEN_URL: &str = "https://lms.example/mod/lti/token.php";
pub const JWKS_BASE: &str = "https://lms.example/mod/lti/certs.php";
pub const LINE_ITEMS_URL: &str = "https://lms.example/mod/lti/services.php/2/lineitems?type_id=4";
pub const TARGET_LINK_URI: &str = "https://tool.example/launch";
pub const KID: &str = "test-key-1";

const PRIVATE_PEM: &[u8] = include_bytes!("../fixtures/private.pem");
const PUBLIC_PEM: &[u8] = include_bytes!("../fixtures/public.pem");
const JWKS: &str = include_str!("../fixtures/jwks.json");

/// JWKS endpoint registered for `aud`
pub fn jwks_url(aud: &str) -> String {
    format!("{JWKS_BASE}?client={aud}")
}

/// URL of line item `n` on the fake platform
pub fn line_item_url(n: usize) -> String {
    format!("https://lms.example/mod/lti/services.php/2/lineitems/{n}/lineitem?type_id=4")
}

/// Scripted platform: serves JWKS, tokens, line items, scores and results
/// from memory and records every request it receives.
#[derive(Default)]
pub struct FakePlatform {
    pub line_items: Mutex<Vec<Value>>,
    pub results: Mutex<Vec<Value>>,
    pub requests: Mutex<Vec<HttpRequest>>,
    /// Answer line item creation with an empty body
    pub bare_create: Mutex<bool>,
    tokens_issued: Mutex<usize>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests matching `method` whose URL starts with `prefix`
    pub fn count(&self, method: Method, prefix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.url.starts_with(prefix))
            .count()
    }

    /// Last request sent to a URL starting with `prefix`
    pub fn last(&self, prefix: &str) -> Option<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|r| r.url.starts_with(prefix))
            .cloned()
    }

    fn issue_token(&self, request: &HttpRequest) -> Value {
        let scope = match &request.body {
            Some(Body::Form(pairs)) => pairs
                .iter()
                .find(|(k, _)| k == "scope")
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
            _ => String::new(),
        };
        let mut issued = self.tokens_issued.lock();
        *issued += 1;
        json!({
            "access_token": format!("platform-token-{issued}"),
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": scope
        })
    }

    fn create_line_item(&self, request: &HttpRequest) -> Value {
        let mut created: Value = match &request.body {
            Some(Body::Json(json)) => serde_json::from_str(json).unwrap_or_else(|_| json!({})),
            _ => json!({}),
        };
        let mut items = self.line_items.lock();
        created["id"] = json!(line_item_url(items.len() + 1));
        items.push(created.clone());
        created
    }

    fn respond(&self, request: &HttpRequest) -> Option<Value> {
        let url = request.url.as_str();
        match request.method {
            Method::Get if url.starts_with(JWKS_BASE) => serde_json::from_str(JWKS).ok(),
            Method::Post if url == TOKEN_URL => Some(self.issue_token(request)),
            Method::Get if url == LINE_ITEMS_URL => Some(Value::Array(self.line_items.lock().clone())),
            Method::Post if url == LINE_ITEMS_URL => {
                let created = self.create_line_item(request);
                Some(if *self.bare_create.lock() { Value::Null } else { created })
            }
            Method::Get if url.contains("/results") => Some(Value::Array(self.results.lock().clone())),
            Method::Post if url.contains("/scores") => Some(Value::Null),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for FakePlatform {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().push(request.clone());
        match self.respond(&request) {
            Some(Value::Null) => Ok(HttpResponse {
                status: 200,
                body: Bytes::new(),
            }),
            Some(body) => Ok(HttpResponse {
                status: 200,
                body: Bytes::from(body.to_string()),
            }),
            None => Err(Error::HttpStatus {
                status: 404,
                url: request.url,
                body: String::new(),
            }),
        }
    }
}

/// Trust store with one issuer and `client-a` registered
pub fn trust_config() -> TrustConfig {
    serde_json::from_value(json!({
        "kid": "tool-key",
        "issuers": {
            ISS: {
                "login_url": LOGIN_URL,
                "token_url": TOKEN_URL,
                "tools": [{ "aud": CLIENT_ID, "jwks_endpoint": jwks_url(CLIENT_ID) }]
            }
        }
    }))
    .unwrap()
}

/// Tool wired to `platform` through a caching transport
pub fn tool_with(platform: &Arc<FakePlatform>) -> LtiTool {
    let registry = Arc::new(TrustRegistry::from_config(trust_config()));
    let inner: Arc<dyn Transport> = platform.clone();
    let transport = Arc::new(CachingTransport::new(inner, 64));
    let keys = Arc::new(RsaKeyPair::from_pem(PRIVATE_PEM, PUBLIC_PEM).unwrap());
    let tool = LtiTool::new(registry, transport, keys, ToolSettings::default());
    tool.mount_defaults();
    tool
}

/// Login initiation form as the platform posts it
pub fn login_form(client_id: &str) -> LoginRequest {
    let body = serde_urlencoded::to_string([
        ("iss", ISS),
        ("target_link_uri", TARGET_LINK_URI),
        ("login_hint", "2"),
        ("lti_message_hint", "{\"cmid\":3}"),
        ("client_id", client_id),
        ("lti_deployment_id", "4"),
    ])
    .unwrap();
    serde_urlencoded::from_str(&body).unwrap()
}

/// Query parameters of a redirect URL
pub fn query_params(url: &str) -> HashMap<String, String> {
    let (_, query) = url.split_once('?').unwrap();
    serde_urlencoded::from_str(query).unwrap()
}

/// Launch claims for `aud` echoing `nonce`
pub fn launch_claims(aud: &str, nonce: &str) -> Value {
    let now = chrono::Utc::now().timestamp();
    json!({
        "iss": ISS,
        "aud": aud,
        "sub": "2",
        "iat": now,
        "exp": now + 60,
        "nonce": nonce,
        (claims::DEPLOYMENT_ID): "4",
        (claims::MESSAGE_TYPE): "LtiResourceLinkRequest",
        (claims::ROLES): [
            "http://purl.imsglobal.org/vocab/lis/v2/institution/person#Administrator",
            "http://purl.imsglobal.org/vocab/lis/v2/membership#Instructor",
            "http://purl.imsglobal.org/vocab/lis/v2/system/person#Administrator"
        ],
        (claims::CONTEXT): { "id": "2", "label": "aaaa", "title": "Aaaa", "type": ["CourseSection"] },
        (claims::RESOURCE_LINK): { "id": "3", "title": "Quiz" },
        (claims::AGS_ENDPOINT): {
            "scope": [
                "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem",
                "https://purl.imsglobal.org/spec/lti-ags/scope/score"
            ],
            "lineitems": LINE_ITEMS_URL
        }
    })
}

/// Sign `claims` with the platform fixture key
pub fn sign(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(PRIVATE_PEM).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// Launch form carrying the session's state and a token echoing its nonce
pub fn launch_form(session: &MemorySession, aud: &str) -> LaunchRequest {
    let state = session.get_str(keys::STATE).unwrap();
    let nonce = session.get_str(keys::NONCE).unwrap();
    LaunchRequest {
        id_token: Some(sign(&launch_claims(aud, &nonce))),
        state: Some(state),
    }
}

/// Session that completed login and launch as `client_id`
pub async fn launched_session(tool: &LtiTool, client_id: &str) -> MemorySession {
    let mut session = MemorySession::new();
    tool.login(&login_form(client_id), &mut session, None).unwrap();
    let form = launch_form(&session, client_id);
    tool.launch(&form, &mut session).await.unwrap();
    session
}
