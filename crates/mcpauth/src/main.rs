//! mcpauth - sign in to OAuth-protected MCP servers.
//!
//! This is the main entry point for the mcpauth CLI.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::LoginOptions;
use config::Settings;
use mcpauth_util::log::{LogConfig, LogLevel};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcpauth")]
#[command(author, version, about = "OAuth sign-in for remote MCP servers", long_about = None)]
struct Cli {
    /// Log to stderr at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the global config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Credential store directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in to an MCP server
    Login {
        /// MCP server URL
        url: String,
        /// Scopes to request
        #[arg(short, long)]
        scope: Option<String>,
        /// Seconds to wait for the browser callback
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Loopback callback port
        #[arg(short, long)]
        port: Option<u16>,
        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },
    /// Show stored credentials for an MCP server
    Status {
        /// MCP server URL
        url: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove stored credentials for an MCP server
    Logout {
        /// MCP server URL
        url: String,
    },
    /// Print the storage identity of an MCP server URL
    Identity {
        /// MCP server URL
        url: String,
        /// Also print the credential file paths
        #[arg(long)]
        paths: bool,
    },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut settings, source) = Settings::load(cli.config.as_deref()).await?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = Some(dir);
    }

    let log_file = init_logging(cli.verbose, &settings);
    if let Some(path) = &source {
        tracing::debug!(path = %path.display(), "Loaded configuration");
    }
    if let Some(path) = &log_file {
        tracing::debug!(path = %path.display(), "Logging to file");
    }

    match cli.command {
        Commands::Login {
            url,
            scope,
            timeout,
            port,
            no_browser,
        } => {
            let options = LoginOptions {
                scope,
                timeout,
                port,
                no_browser,
            };
            commands::login(&settings, &url, options).await
        }
        Commands::Status { url, json } => commands::status(&settings, &url, json).await,
        Commands::Logout { url } => commands::logout(&settings, &url).await,
        Commands::Identity { url, paths } => commands::identity(&settings, &url, paths),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Verbose runs log to stderr; otherwise logs go to the platform log file.
fn init_logging(verbose: bool, settings: &Settings) -> Option<PathBuf> {
    let level = if verbose {
        LogLevel::Debug
    } else {
        settings
            .log_level
            .as_deref()
            .and_then(LogLevel::parse)
            .unwrap_or_default()
    };

    mcpauth_util::log::init(LogConfig {
        level,
        print: verbose,
        include_location: verbose,
        file: mcpauth_util::log::default_log_path(),
    })
}

fn print_version() {
    println!("mcpauth {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("OAuth sign-in for remote MCP servers.");
    println!();
    println!("https://github.com/mcpauth/mcpauth");
}
