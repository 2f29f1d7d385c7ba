//! Token-gated calls to platform services

use std::sync::Arc;

use tracing::debug;

use crate::token::TokenManager;
use crate::transport::{Body, HttpRequest, HttpResponse, Method, Transport, media};
use crate::{Error, Result};

/// One call to a platform service
#[derive(Debug, Clone)]
pub struct LmsRequest {
    /// Method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// `Accept` header
    pub accept: String,
    /// `Content-Type` header
    pub content_type: String,
    /// Optional body
    pub body: Option<Body>,
    /// Scopes the bearer token must cover; `None` sends no token
    pub scopes: Option<Vec<String>>,
}

impl LmsRequest {
    /// Request with JSON accept/content types and no token
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            accept: media::JSON.to_string(),
            content_type: media::JSON.to_string(),
            body: None,
            scopes: None,
        }
    }

    /// GET `url`
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// POST `body` to `url`
    #[must_use]
    pub fn post(url: impl Into<String>, body: Body) -> Self {
        Self {
            body: Some(body),
            ..Self::new(Method::Post, url)
        }
    }

    /// Set `Accept`
    #[must_use]
    pub fn accept(mut self, media_type: &str) -> Self {
        self.accept = media_type.to_string();
        self
    }

    /// Set `Content-Type`
    #[must_use]
    pub fn content_type(mut self, media_type: &str) -> Self {
        self.content_type = media_type.to_string();
        self
    }

    /// Attach a bearer token covering `scopes`
    #[must_use]
    pub fn with_token<S: AsRef<str>>(mut self, scopes: &[S]) -> Self {
        self.scopes = Some(scopes.iter().map(|s| s.as_ref().to_string()).collect());
        self
    }
}

/// Sends [`LmsRequest`]s on behalf of one `(issuer, client_id)`
#[derive(Clone)]
pub struct LmsClient {
    issuer: String,
    client_id: String,
    tokens: Arc<TokenManager>,
    transport: Arc<dyn Transport>,
}

impl LmsClient {
    /// Client for the tool `client_id` registered with `issuer`
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        tokens: Arc<TokenManager>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            tokens,
            transport,
        }
    }

    /// Issuer this client talks to
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Client id this client authenticates as
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Send `request`, obtaining a bearer token first when it asks for one.
    ///
    /// A token request with no scopes fails before anything is sent.
    pub async fn send(&self, request: LmsRequest) -> Result<HttpResponse> {
        let LmsRequest {
            method,
            url,
            accept,
            content_type,
            body,
            scopes,
        } = request;

        let mut http = HttpRequest {
            method,
            url,
            headers: Default::default(),
            body,
        }
        .header("Accept", accept)
        .header("Content-Type", content_type);

        if let Some(scopes) = scopes {
            if scopes.is_empty() {
                return Err(Error::ScopesRequired);
            }
            let token = self
                .tokens
                .authorize(&self.issuer, &self.client_id, &scopes)
                .await?;
            http = http.header("Authorization", format!("Bearer {}", token.access_token));
        }

        debug!(method = %http.method, url = %http.url, "Calling platform service");
        self.transport.send(http).await
    }
}
