//! Logging setup using tracing.
//!
//! Output goes either to a log file (the default for the CLI, so the
//! terminal stays clean while the browser flow runs) or to stderr.

use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// Filter directive scoped to the mcpauth crates.
    fn directive(&self) -> String {
        let level = self.as_str();
        format!("mcpauth={level},mcpauth_oauth={level},mcpauth_store={level},mcpauth_util={level}")
    }
}

/// Logging configuration.
#[derive(Debug, Default)]
pub struct LogConfig {
    /// Log level.
    pub level: LogLevel,
    /// Print to stderr instead of writing to `file`.
    pub print: bool,
    /// Whether to include file/line info in logs.
    pub include_location: bool,
    /// Log file path. Ignored when `print` is set.
    pub file: Option<PathBuf>,
}

/// Initialize logging with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Returns the log
/// file actually in use, if any. Call once at startup.
pub fn init(config: LogConfig) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.directive()));

    if config.print {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
        return None;
    }

    let Some(path) = config.file else {
        // Spans still work, events go nowhere.
        tracing_subscriber::registry().with(filter).init();
        return None;
    };

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Warning: Could not create log directory: {e}");
            tracing_subscriber::registry().with(filter).init();
            return None;
        }
    }

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file: {e}");
            tracing_subscriber::registry().with(filter).init();
            return None;
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .with_file(config.include_location)
                .with_line_number(config.include_location),
        )
        .init();

    Some(path)
}

/// Get the default log file path.
///
/// macOS: `~/Library/Logs/mcpauth/mcpauth.log`, elsewhere the platform's
/// local data directory.
pub fn default_log_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            return Some(home.join("Library/Logs/mcpauth/mcpauth.log"));
        }
    }

    dirs::data_local_dir().map(|p| p.join("mcpauth").join("logs").join("mcpauth.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_directive_covers_workspace_crates() {
        let directive = LogLevel::Debug.directive();
        assert!(directive.contains("mcpauth=debug"));
        assert!(directive.contains("mcpauth_oauth=debug"));
        assert!(directive.contains("mcpauth_store=debug"));
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(!config.print);
        assert_eq!(config.level, LogLevel::Info);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_default_log_path_ends_with_file_name() {
        if let Some(path) = default_log_path() {
            assert!(path.ends_with("mcpauth.log"));
        }
    }
}
