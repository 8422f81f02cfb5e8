//! Proxygate CLI entry point

mod cli;

use crate::cli::{Cli, Commands, ConsoleCommand};
use anyhow::{bail, Context, Result};
use clap::Parser;
use proxygate::storage::{CredentialStore, PostgresConfig, PostgresStore};
use proxygate::{Admission, AuthError, Engine, EngineConfig, Role};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Shown for both a refused principal and a rejected token
const ACCESS_REFUSED: &str = "Access denied";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("Invalid engine configuration")?;

    // Database config is optional: without it only static credentials work
    let db_config = match &cli.database_url {
        Some(url) => Some(PostgresConfig::from_url(url).context("Invalid DATABASE_URL")?),
        None => PostgresConfig::from_env(),
    };

    match cli.command {
        Commands::Init => init(db_config).await,
        Commands::Issue {
            role,
            ttl,
            issued_by,
        } => {
            let engine = engine(&config, db_config).await?;
            issue(&engine, role, ttl.map(Into::into), issued_by).await
        }
        Commands::Auth { token, principal } => {
            let engine = engine(&config, db_config).await?;
            authenticate(&engine, &token, principal).await;
            Ok(())
        }
        Commands::Access { principal } => {
            let engine = engine(&config, db_config).await?;
            access(&engine, principal).await;
            Ok(())
        }
        Commands::Status { principal, json } => {
            let engine = engine(&config, db_config).await?;
            status(&engine, principal, json).await
        }
        Commands::Token { token, json } => {
            let engine = engine(&config, db_config).await?;
            show_token(&engine, &token, json).await
        }
        Commands::Console => {
            let engine = engine(&config, db_config).await?;
            console(&engine).await
        }
    }
}

async fn engine(config: &EngineConfig, db_config: Option<PostgresConfig>) -> Result<Engine> {
    let store: Option<Arc<dyn CredentialStore>> = match db_config {
        Some(db) => {
            let store = PostgresStore::new(db)
                .await
                .context("Failed to connect to database")?;
            Some(Arc::new(store) as Arc<dyn CredentialStore>)
        }
        None => {
            info!("No database configured, running with static credentials only");
            None
        }
    };

    Ok(Engine::new(config, store))
}

async fn init(db_config: Option<PostgresConfig>) -> Result<()> {
    let db_config = db_config.context("DATABASE_URL not set")?;
    let _store = PostgresStore::new(db_config).await?;
    println!("Database schema initialized successfully");
    Ok(())
}

async fn issue(
    engine: &Engine,
    role: Role,
    ttl: Option<std::time::Duration>,
    issued_by: i64,
) -> Result<()> {
    let ttl = ttl
        .map(chrono::Duration::from_std)
        .transpose()
        .context("TTL out of range")?;

    let token = match engine.issue(role, ttl, issued_by).await {
        Ok(token) => token,
        Err(AuthError::AccessDenied) => bail!("Principal {} may not issue tokens", issued_by),
        Err(AuthError::StoreUnavailable) => bail!("Token issuance requires a database"),
        Err(e) => return Err(e).context("Failed to create token"),
    };

    println!("{}", token);
    println!("Role: {}", token.role);
    match token.expires_at {
        Some(at) => println!("Expires: {}", at.to_rfc3339()),
        None => println!("Expires: never"),
    }
    Ok(())
}

async fn authenticate(engine: &Engine, token: &str, principal: i64) {
    let outcome = engine.authenticate(token, principal).await;
    println!("{}", auth_message(principal, &outcome));
}

async fn access(engine: &Engine, principal: i64) {
    let admission = engine.request_access(principal).await;
    println!("{}", access_message(principal, admission));
}

fn auth_message(principal: i64, outcome: &Result<Role, AuthError>) -> String {
    match outcome {
        Ok(role) => format!("Authenticated {} as {}", principal, role),
        // Same message for every failure, and for denied access
        Err(_) => ACCESS_REFUSED.to_string(),
    }
}

fn access_message(principal: i64, admission: Admission) -> String {
    match admission {
        Admission::Granted => format!("Access granted for {}", principal),
        Admission::Denied => ACCESS_REFUSED.to_string(),
        Admission::Throttled => "Too many requests, try again later".to_string(),
        Admission::Unavailable => "Service unavailable, try again later".to_string(),
    }
}

async fn status(engine: &Engine, principal: i64, json: bool) -> Result<()> {
    let status = engine.status(principal).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Principal: {}", status.principal);
    println!("Authorized: {}", status.authorized);
    println!("Role: {}", status.role);
    println!("Authenticated: {}", status.is_authenticated);
    Ok(())
}

async fn show_token(engine: &Engine, token: &str, json: bool) -> Result<()> {
    let record = match engine.token(token).await {
        Ok(record) => record,
        Err(AuthError::NotFound) => bail!("Token not found"),
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("Role: {}", record.role);
    println!("Issued by: {}", record.issued_by);
    println!("Created: {}", record.created_at.to_rfc3339());
    match record.expires_at {
        Some(at) => println!("Expires: {}", at.to_rfc3339()),
        None => println!("Expires: never"),
    }
    match (record.consumed_at, record.issued_to) {
        (Some(at), Some(to)) => println!("Consumed: {} by {}", at.to_rfc3339(), to),
        (Some(at), None) => println!("Consumed: {}", at.to_rfc3339()),
        _ => println!("Consumed: no"),
    }
    Ok(())
}

async fn console(engine: &Engine) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Auth { token, principal }) => {
                authenticate(engine, &token, principal).await
            }
            Ok(ConsoleCommand::Access { principal }) => access(engine, principal).await,
            Ok(ConsoleCommand::Status { principal }) => status(engine, principal, false).await?,
            Ok(ConsoleCommand::Issue {
                role,
                issued_by,
                ttl,
            }) => {
                if let Err(e) = issue(engine, role, ttl, issued_by).await {
                    println!("Error: {:#}", e);
                }
            }
            Ok(ConsoleCommand::Quit) => break,
            Err(e) => println!("{}", e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusals_share_one_message() {
        let denied = access_message(3, Admission::Denied);
        for err in [
            AuthError::InvalidCredential,
            AuthError::NotFound,
            AuthError::StoreUnavailable,
        ] {
            assert_eq!(auth_message(3, &Err(err)), denied);
        }
        assert_ne!(access_message(3, Admission::Unavailable), denied);
        assert_eq!(auth_message(3, &Ok(Role::Premium)), "Authenticated 3 as premium");
    }
}
