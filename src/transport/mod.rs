//! Outbound HTTP to learning platforms
//!
//! [`Transport`] is the seam between the protocol engine and the network.
//! [`ReqwestTransport`] talks to real platforms; [`CachingTransport`] wraps
//! any transport and serves repeated calls to mounted URL prefixes from a
//! TTL + LRU cache.

mod caching;
mod http;

pub use self::caching::{CachingTransport, RequestKey};
pub use self::http::ReqwestTransport;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Media types used on the wire
pub mod media {
    /// Plain JSON
    pub const JSON: &str = "application/json";
    /// Token endpoint request body
    pub const FORM: &str = "application/x-www-form-urlencoded";
    /// AGS line item
    pub const LINE_ITEM: &str = "application/vnd.ims.lis.v2.lineitem+json";
    /// AGS line item container
    pub const LINE_ITEM_CONTAINER: &str = "application/vnd.ims.lis.v2.lineitemcontainer+json";
    /// AGS result container
    pub const RESULT_CONTAINER: &str = "application/vnd.ims.lis.v2.resultcontainer+json";
    /// AGS score
    pub const SCORE: &str = "application/vnd.ims.lis.v1.score+json";
}

/// HTTP methods the platform protocol needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

impl Method {
    /// Upper-case method name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            _ => Err(Error::UnsupportedHttpMethod(s.to_string())),
        }
    }
}

/// Request body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Body {
    /// `application/x-www-form-urlencoded` pairs, in send order
    Form(Vec<(String, String)>),
    /// Pre-serialized JSON (or an AGS JSON media type)
    Json(String),
}

impl Body {
    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Form(pairs) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .finish();
                Bytes::from(encoded)
            }
            Self::Json(json) => Bytes::from(json.clone()),
        }
    }

    /// Serialize `value` into a JSON body
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_string(value)?))
    }
}

/// An outbound request
///
/// Headers live in a `BTreeMap`, so two requests built with the same headers
/// in a different order are identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Header name to value
    pub headers: BTreeMap<String, String>,
    /// Optional body
    pub body: Option<Body>,
}

impl HttpRequest {
    /// GET `url`
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// POST `body` to `url`
    #[must_use]
    pub fn post(url: impl Into<String>, body: Body) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// SHA-256 over headers and body, hex encoded.
    ///
    /// Form pairs are hashed in sorted order.
    #[must_use]
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.headers {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"\n");
        match &self.body {
            None => hasher.update(b"none"),
            Some(Body::Form(pairs)) => {
                let mut sorted: Vec<_> = pairs.iter().collect();
                sorted.sort();
                hasher.update(b"form\n");
                for (k, v) in sorted {
                    hasher.update(k.as_bytes());
                    hasher.update(b"=");
                    hasher.update(v.as_bytes());
                    hasher.update(b"&");
                }
            }
            Some(Body::Json(json)) => {
                hasher.update(b"json\n");
                hasher.update(json.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// A successful (2xx) response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Raw body
    pub body: Bytes,
}

impl HttpResponse {
    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(Into::into)
    }

    /// Body as UTF-8 text (lossy)
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Transport trait for platform communication
///
/// Implementations return `Err(Error::HttpStatus { .. })` for non-2xx
/// responses, so an `Ok` response is always a success.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}
