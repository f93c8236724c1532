//! Keyline CLI - command-line access to the dashboard API
//!
//! This binary can:
//! - Sign in with email and password, persisting the session
//! - Send authenticated requests, refreshing an expired token on the way
//! - Show and clear the stored session

mod request;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keyline_core::auth::Session;
use keyline_core::client::{self, config};
use keyline_core::storage;
use std::io::BufRead;

#[derive(Parser)]
#[command(name = "keyline")]
#[command(author = "Keyline Team")]
#[command(version)]
#[command(about = "Command-line client for the Keyline dashboard API")]
#[command(long_about = "
Keyline talks to the dashboard API with the same session handling as the web
dashboard: the access token is attached to every request and refreshed
transparently when the server rejects it.

Quick start:
  1. Sign in:           keyline login --email you@example.com
  2. Call the API:      keyline request GET /businesses
  3. Sign out:          keyline logout
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and store the access token
    Login {
        /// Account email
        #[arg(short, long)]
        email: String,

        /// Password (read from KEYLINE_PASSWORD or stdin when omitted)
        #[arg(long, env = "KEYLINE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Sign out and delete the stored session
    Logout,

    /// Show session status
    Status {
        /// Only report what is stored, without contacting the server
        #[arg(long)]
        offline: bool,
    },

    /// Send an authenticated request
    Request(request::RequestArgs),

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keyline={},keyline_core={}", log_level, log_level).into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Login { email, password } => cmd_login(&cli, email, password.clone()).await,
        Commands::Logout => cmd_logout(&cli).await,
        Commands::Status { offline } => cmd_status(&cli, !offline).await,
        Commands::Request(args) => {
            let session = open_session()?;
            request::run(&session, args, cli.format).await
        }
        Commands::Config => cmd_config(&cli).await,
    }
}

fn open_session() -> Result<Session> {
    let config = client::load_client_config();
    let storage = storage::default_storage().context("Failed to open credential storage")?;
    Session::open(config, storage)
}

fn read_password() -> Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn cmd_login(cli: &Cli, email: &str, password: Option<String>) -> Result<()> {
    let session = open_session()?;

    let password = match password {
        Some(p) => p,
        None => read_password()?,
    };

    let outcome = session.login(email, &password).await?;

    match cli.format {
        OutputFormat::Text => {
            println!("Signed in as {}", outcome.email);
            println!();
            println!("You can now call the API with: keyline request GET /businesses");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "signed_in",
                "email": outcome.email,
                "user": outcome.user,
            }));
        }
    }

    Ok(())
}

async fn cmd_logout(cli: &Cli) -> Result<()> {
    let session = open_session()?;

    if !session.is_signed_in() {
        match cli.format {
            OutputFormat::Text => println!("Not signed in."),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({
                    "status": "not_signed_in",
                }));
            }
        }
        return Ok(());
    }

    session.logout().await?;

    match cli.format {
        OutputFormat::Text => println!("Signed out."),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "signed_out",
            }));
        }
    }

    Ok(())
}

async fn cmd_status(cli: &Cli, verify: bool) -> Result<()> {
    let session = open_session()?;
    let status = session.status(verify).await?;

    match cli.format {
        OutputFormat::Text => {
            if status.authenticated {
                println!("Status:  Signed in");
                if let Some(email) = status
                    .profile
                    .as_ref()
                    .and_then(|p| p.get("email"))
                    .and_then(|e| e.as_str())
                {
                    println!("Email:   {}", email);
                }
                match &status.verification {
                    Some(keyline_core::TokenVerifyResult::Unreachable(reason)) => {
                        println!("Server:  unreachable ({})", reason);
                    }
                    Some(_) => println!("Server:  token accepted"),
                    None => println!("Server:  not checked"),
                }
            } else {
                println!("Status:  Not signed in");
                println!();
                println!("Run 'keyline login --email <EMAIL>' to authenticate.");
            }
            println!();
            println!("Storage: {}", status.storage);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(&status)?);
        }
    }

    Ok(())
}

async fn cmd_config(cli: &Cli) -> Result<()> {
    let client_config = client::load_client_config();
    let config_path = config::get_config_file_path_string();

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("API endpoint:     {} (from {})", client_config.api_url, client_config.source);
            println!("Refresh timeout:  {}s", client_config.refresh_timeout.as_secs());
            println!("Request timeout:  {}s", client_config.request_timeout.as_secs());
            println!("Credential store: {}", storage::storage_info());
            println!();
            println!("Environment variables:");
            println!("  {} - Override API endpoint", config::ENV_API_URL);
            println!("  {} - Override refresh timeout (seconds)", config::ENV_REFRESH_TIMEOUT);
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "config_file": config_path,
                "api_url": client_config.api_url,
                "api_source": format!("{}", client_config.source),
                "refresh_timeout_secs": client_config.refresh_timeout.as_secs(),
                "request_timeout_secs": client_config.request_timeout.as_secs(),
                "credential_storage": storage::storage_info(),
            }));
        }
    }

    Ok(())
}
