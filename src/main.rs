//! LTI Advantage tool - command-line entry point

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use lti_tool::{
    LoginRequest, LtiTool,
    cli::{Cli, Command},
    config::Config,
    session::MemorySession,
    setup_tracing,
    trust::TrustRegistry,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Issuers => list_issuers(&config),
        Command::LoginUrl {
            iss,
            client_id,
            target_link_uri,
            login_hint,
            lti_message_hint,
            deployment_id,
        } => {
            let form = LoginRequest {
                iss: Some(iss),
                target_link_uri: Some(target_link_uri),
                login_hint: Some(login_hint),
                lti_message_hint,
                client_id: Some(client_id),
                lti_deployment_id: deployment_id,
            };
            login_url(&config, &form)
        }
        Command::Assertion { iss, client_id } => assertion(&config, &iss, &client_id),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Print trusted issuers and their tools
fn list_issuers(config: &Config) -> lti_tool::Result<()> {
    let registry = TrustRegistry::load(&config.trust_file)?;
    let issuers = registry.issuers();
    if issuers.is_empty() {
        println!("No trusted issuers in {}", config.trust_file.display());
        return Ok(());
    }

    for iss in issuers {
        let Some(trusted) = registry.issuer(&iss) else {
            continue;
        };
        println!("{iss}");
        println!("   Login: {}", trusted.login_url);
        println!("   Token: {}", trusted.token_url);
        if let Some(kid) = registry.kid_for(&iss) {
            println!("   Kid:   {kid}");
        }
        for tool in &trusted.tools {
            println!("   Tool {} -> {}", tool.aud, tool.jwks_endpoint);
        }
    }
    Ok(())
}

/// Run login initiation against a throwaway session
fn login_url(config: &Config, form: &LoginRequest) -> lti_tool::Result<()> {
    let tool = LtiTool::from_config(config)?;
    let mut session = MemorySession::new();
    let redirect = tool.login(form, &mut session, None)?;
    println!("{redirect}");
    Ok(())
}

/// Print a signed client assertion
fn assertion(config: &Config, iss: &str, client_id: &str) -> lti_tool::Result<()> {
    let tool = LtiTool::from_config(config)?;
    println!("{}", tool.tokens().client_assertion(iss, client_id)?);
    Ok(())
}
