//! CLI command definitions

use clap::{Parser, Subcommand};
use proxygate::Role;

#[derive(Parser)]
#[command(name = "proxygate")]
#[command(about = "Access control and rate limiting for a gated proxy", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database schema
    Init,

    /// Issue a single-use token
    ///
    /// Examples:
    ///   proxygate issue premium --issued-by 1
    ///   proxygate issue free --ttl 24h --issued-by 1
    Issue {
        /// Role granted on consumption: free, premium or admin
        role: Role,

        /// Lifetime of the token (e.g. 30m, 24h, 7d). Never expires if omitted.
        #[arg(long)]
        ttl: Option<humantime::Duration>,

        /// Principal issuing the token (must be authorized)
        #[arg(long)]
        issued_by: i64,
    },

    /// Authenticate a principal with a token
    Auth {
        token: String,

        #[arg(long)]
        principal: i64,
    },

    /// Request gated access for a principal (authorization + rate limit)
    Access {
        principal: i64,
    },

    /// Show a principal's authorization status
    Status {
        principal: i64,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show an issued token's record
    Token {
        token: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive session reading commands from stdin
    ///
    /// Keeps one engine alive so authentications persist between commands.
    /// Commands: auth <token> <id>, access <id>, status <id>,
    /// issue <role> <issuer-id> [ttl], quit
    Console,
}

/// A console line
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Auth { token: String, principal: i64 },
    Access { principal: i64 },
    Status { principal: i64 },
    Issue { role: Role, issued_by: i64, ttl: Option<std::time::Duration> },
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();

        match parts.as_slice() {
            ["auth", token, id] => Ok(Self::Auth {
                token: token.to_string(),
                principal: parse_id(id)?,
            }),
            ["access", id] => Ok(Self::Access {
                principal: parse_id(id)?,
            }),
            ["status", id] => Ok(Self::Status {
                principal: parse_id(id)?,
            }),
            ["issue", role, issuer, rest @ ..] if rest.len() <= 1 => {
                let role = role.parse::<Role>().map_err(|e| e.to_string())?;
                let ttl = match rest.first() {
                    Some(ttl) => Some(
                        humantime::parse_duration(ttl)
                            .map_err(|e| format!("invalid ttl '{}': {}", ttl, e))?,
                    ),
                    None => None,
                };
                Ok(Self::Issue {
                    role,
                    issued_by: parse_id(issuer)?,
                    ttl,
                })
            }
            ["quit"] | ["exit"] => Ok(Self::Quit),
            _ => Err(format!("unrecognised command: {}", line.trim())),
        }
    }
}

fn parse_id(s: &str) -> Result<i64, String> {
    s.parse().map_err(|_| format!("invalid principal id: {}", s))
}
