//! LTI Advantage tool library
//!
//! Tool-side protocol client for learning platforms (IMS Global / 1EdTech
//! LTI 1.3 + Advantage).
//!
//! # Features
//!
//! - **Login / launch**: OIDC third-party-initiated login with single-use
//!   state and nonce, launch token verification against platform JWKS
//! - **Token manager**: client-credentials grant with a signed client assertion
//! - **Assignment and Grade Services**: line item reconciliation, scores, results
//! - **Caching**: TTL + LRU cache, mounted by URL prefix on the HTTP transport

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ags;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod jwks;
pub mod launch;
pub mod lms;
pub mod roles;
pub mod session;
pub mod token;
pub mod transport;
pub mod trust;

pub use error::{Error, Result};
pub use launch::{LaunchOutcome, LaunchRequest, LoginRequest, LtiTool};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides `level`. `format` is `json`, `compact` or anything
/// else for the default text output.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| Error::Config(format!("invalid log level {level:?}: {e}")))?,
    };
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        Some("compact") => registry.with(fmt::layer().compact()).try_init(),
        _ => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("tracing already initialised: {e}")))
}

