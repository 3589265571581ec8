use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default API the session client talks to
pub const DEFAULT_API_URL: &str = "http://localhost:3333";

/// Session Keeper - authenticated API client with single-flight token renewal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Base URL of the application API
    #[arg(short = 'u', long, env = "API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Path to the SQLite cookie jar
    #[arg(short = 'd', long, env = "COOKIE_DB_FILE")]
    pub db_file: Option<String>,

    /// Days the token cookies are kept
    #[arg(long, env = "TOKEN_TTL_DAYS", default_value = "30")]
    pub token_ttl_days: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Server host address (serve)
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port (serve)
    #[arg(short, long, env = "SERVER_PORT", default_value = "3000")]
    pub port: u16,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sign in and persist the session
    Login {
        /// Account email (prompted when omitted)
        #[arg(short, long)]
        email: Option<String>,
    },
    /// Drop the persisted session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Send an authenticated request and print the response body
    Request {
        /// HTTP method
        method: String,
        /// Path relative to the API URL
        path: String,
        /// JSON body
        #[arg(long)]
        data: Option<String>,
    },
    /// Run the server-rendered pages
    Serve,
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_url: String,

    // Cookie jar
    pub cookie_db_file: PathBuf,
    pub token_ttl_days: i64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Server settings
    pub server_host: String,
    pub server_port: u16,

    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args), command))
    }

    pub fn from_args(args: CliArgs) -> Self {
        Config {
            api_url: args.api_url.trim_end_matches('/').to_string(),
            cookie_db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_cookie_db_file),
            token_ttl_days: args.token_ttl_days,
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,
            server_host: args.host,
            server_port: args.port,
            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_url)
            .with_context(|| format!("API_URL is not a valid URL: {}", self.api_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("API_URL must use http or https: {}", self.api_url);
        }

        if self.token_ttl_days <= 0 {
            anyhow::bail!("TOKEN_TTL_DAYS must be positive, got {}", self.token_ttl_days);
        }

        if self.http_connect_timeout == 0 || self.http_request_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be at least one second");
        }

        Ok(())
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.token_ttl_days)
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Cookie jar location under the platform data directory
fn default_cookie_db_file() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("session-keeper").join("cookies.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("cookies.sqlite3"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(argv: &[&str]) -> Config {
        Config::from_args(CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        assert_eq!(expand_tilde("~"), PathBuf::from("~"));
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json"), LogFormat::Json);
        assert_eq!(parse_log_format("JSON"), LogFormat::Json);
        assert_eq!(parse_log_format("text"), LogFormat::Text);
        assert_eq!(parse_log_format("bogus"), LogFormat::Text);
    }

    #[test]
    fn test_subcommands() {
        let args = CliArgs::try_parse_from([
            "session-keeper",
            "request",
            "PUT",
            "/users/1",
            "--data",
            r#"{"name":"x"}"#,
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Request {
                method: "PUT".to_string(),
                path: "/users/1".to_string(),
                data: Some(r#"{"name":"x"}"#.to_string()),
            }
        );

        let args = CliArgs::try_parse_from(["session-keeper", "login", "-e", "a@b.c"]).unwrap();
        assert_eq!(
            args.command,
            Command::Login {
                email: Some("a@b.c".to_string())
            }
        );

        assert!(CliArgs::try_parse_from(["session-keeper"]).is_err());
    }

    #[test]
    fn test_explicit_flags() {
        let config = config_from(&[
            "session-keeper",
            "--api-url",
            "https://api.example.com/",
            "--db-file",
            "/tmp/jar.sqlite3",
            "--token-ttl-days",
            "7",
            "whoami",
        ]);

        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.cookie_db_file, PathBuf::from("/tmp/jar.sqlite3"));
        assert_eq!(config.token_ttl(), chrono::Duration::days(7));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = config_from(&["session-keeper", "--api-url", "http://localhost:3333", "logout"]);
        assert!(config.validate().is_ok());

        config.api_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        config.api_url = "not a url".to_string();
        assert!(config.validate().is_err());

        config.api_url = DEFAULT_API_URL.to_string();
        config.token_ttl_days = 0;
        assert!(config.validate().is_err());

        config.token_ttl_days = 30;
        config.http_request_timeout = 0;
        assert!(config.validate().is_err());
    }
}
