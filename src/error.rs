//! Error types for the LTI tool

use std::io;

use thiserror::Error;

/// Result type alias for the LTI tool
pub type Result<T> = std::result::Result<T, Error>;

/// LTI tool errors
///
/// The launch-protocol variants are terminal for the request that raised them
/// and map to `401` at the web boundary (see [`Error::http_status`]).
#[derive(Error, Debug)]
pub enum Error {
    /// Login initiation named an issuer absent from the trust store
    #[error("{0} is not a trusted issuer")]
    IssuerNotTrusted(String),

    /// Posted `state` did not match the one stored at login
    #[error("Invalid session state")]
    State,

    /// Launch token `nonce` did not match the one stored at login
    #[error("Invalid jwt nonce")]
    Nonce,

    /// Login initiation without `target_link_uri`
    #[error("Missing target_link_uri parameter")]
    TargetUriMissing,

    /// Launch token failed signature, audience, issuer or temporal checks
    #[error("Invalid jwt token: {0}")]
    InvalidToken(String),

    /// Platform key is not an RSA key, or names an algorithm we cannot verify
    #[error("Algorithm not supported: {0}")]
    UnsupportedAlgorithm(String),

    /// Platform key carries no `alg`
    #[error("Key is not signed")]
    KeyNotSigned,

    /// No key with this `kid` in the platform JWKS
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// HTTP method other than GET or POST
    #[error("Method not supported: {0}")]
    UnsupportedHttpMethod(String),

    /// Required request parameter absent
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    /// Session lacks a value an operation depends on
    #[error("Session has no {0}")]
    MissingSessionValue(&'static str),

    /// No tool registered under this issuer for this audience
    #[error("No tool registered for issuer {issuer} and audience {aud}")]
    ToolNotRegistered {
        /// Issuer URL
        issuer: String,
        /// Audience / client id
        aud: String,
    },

    /// A token-gated platform call was made without scopes
    #[error("Access token requested without scopes")]
    ScopesRequired,

    /// Platform answered with a non-2xx status
    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Request URL
        url: String,
        /// Response body (possibly empty)
        body: String,
    },

    /// Client assertion could not be signed
    #[error("Signing error: {0}")]
    Signing(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error rejects the launch handshake itself.
    #[must_use]
    pub fn is_launch_rejection(&self) -> bool {
        matches!(
            self,
            Self::IssuerNotTrusted(_)
                | Self::State
                | Self::Nonce
                | Self::TargetUriMissing
                | Self::InvalidToken(_)
                | Self::UnsupportedAlgorithm(_)
                | Self::KeyNotSigned
                | Self::KeyNotFound(_)
                | Self::MissingParameter(_)
                | Self::MissingSessionValue(_)
        )
    }

    /// HTTP status the web boundary should answer with
    #[must_use]
    pub fn http_status(&self) -> u16 {
        if self.is_launch_rejection() {
            return 401;
        }
        match self {
            Self::UnsupportedHttpMethod(_) => 405,
            Self::HttpStatus { .. } | Self::Http(_) => 502,
            _ => 500,
        }
    }
}
