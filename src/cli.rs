//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// LTI Advantage tool - inspect trust configuration and debug platform handshakes
#[derive(Parser, Debug)]
#[command(name = "lti-tool")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "LTI_TOOL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "LTI_TOOL_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LTI_TOOL_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List trusted issuers and their registered tools
    Issuers,

    /// Run login initiation and print the platform redirect URL
    LoginUrl {
        /// Platform issuer
        #[arg(long)]
        iss: String,

        /// Tool client id
        #[arg(long)]
        client_id: String,

        /// Launch URL of the tool
        #[arg(long)]
        target_link_uri: String,

        /// Login hint
        #[arg(long)]
        login_hint: String,

        /// LTI message hint
        #[arg(long)]
        lti_message_hint: Option<String>,

        /// Deployment id
        #[arg(long)]
        deployment_id: Option<String>,
    },

    /// Sign and print a client assertion for a token endpoint
    Assertion {
        /// Platform issuer
        #[arg(long)]
        iss: String,

        /// Tool client id
        #[arg(long)]
        client_id: String,
    },
}
