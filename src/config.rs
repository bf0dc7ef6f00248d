//! CLI arguments and server configuration defaults.

use axum::http::Uri;
use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;
use std::fmt;
use std::time::Duration;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const PAYLOAD_FIELD: &str = "data";
pub const FIELD_SIZE_LIMIT: u64 = 16 * 1024 * 1024;
pub const ID_RANDOM_BYTES: usize = 32;
pub const ID_MIN_LEN: usize = 6;
pub const DEFAULT_STORAGE_DIR: &str = "stash_cache";
pub const DEFAULT_MAX_WRITE_BYTES: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 360 * 60;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;
pub const FORWARDED_PATH_HEADER: &str = "x-forwarded-original-path";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SweepBackend {
    /// Native recursive walk in a blocking task.
    Walk,
    /// `find -type f -mmin +N -delete` child process.
    Find,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "stash-drop", version = VERSION_INFO, about = "Ephemeral anonymous file drop")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "STASH_STORAGE_DIR",
        default_value = DEFAULT_STORAGE_DIR,
        help = "Storage directory for uploaded files"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "STASH_MAX_WRITE_BYTES",
        default_value_t = DEFAULT_MAX_WRITE_BYTES,
        help = "Bytes accepted across all uploads between two sweeps"
    )]
    pub max_write_bytes: u64,
    #[arg(
        long,
        env = "STASH_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between the end of one sweep and the start of the next"
    )]
    pub sweep_interval_secs: u64,
    #[arg(
        long,
        env = "STASH_MAX_AGE_SECS",
        help = "Delete files older than this many seconds (defaults to the sweep interval)"
    )]
    pub max_age_secs: Option<u64>,
    #[arg(
        long,
        env = "STASH_SWEEP_BACKEND",
        value_enum,
        default_value_t = SweepBackend::Walk,
        help = "How the sweeper finds and deletes aged files"
    )]
    pub sweep_backend: SweepBackend,
    #[arg(
        long,
        env = "STASH_INDEX_FILE",
        help = "Landing page template to use instead of the built-in one"
    )]
    pub index_file: Option<String>,
    #[arg(long, env = "STASH_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        num_args = 0..=2,
        value_name = "LISTEN",
        help = "URL, bare port, or HOST [PORT] to listen on"
    )]
    pub listen: Vec<String>,
}

impl Args {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs.unwrap_or(self.sweep_interval_secs))
    }

    pub fn listen_addr(&self) -> Result<ListenAddr, ConfigError> {
        ListenAddr::parse(&self.listen)
    }
}

/// Host and port the server binds to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl ListenAddr {
    /// Accepts `[]`, `[URL]`, `[PORT]`, `[HOST]` or `[HOST, PORT]`.
    pub fn parse(args: &[String]) -> Result<Self, ConfigError> {
        let Some(first) = args.first() else {
            return Ok(Self {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
            });
        };

        if first.contains("://") {
            let uri = first
                .parse::<Uri>()
                .map_err(|err| ConfigError::InvalidListen(format!("{first}: {err}")))?;
            let host = uri
                .host()
                .filter(|host| !host.is_empty())
                .ok_or_else(|| ConfigError::InvalidListen(format!("{first}: missing host")))?;
            return Ok(Self {
                host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                port: uri.port_u16().unwrap_or(DEFAULT_PORT),
            });
        }

        if !first.is_empty() && first.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self {
                host: DEFAULT_HOST.to_string(),
                port: parse_port(first),
            });
        }

        Ok(Self {
            host: first.clone(),
            port: args.get(1).map(|port| parse_port(port)).unwrap_or(DEFAULT_PORT),
        })
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(value: &str) -> u16 {
    value
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .unwrap_or(DEFAULT_PORT)
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidListen(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidListen(msg) => write!(f, "invalid listen address: {msg}"),
        }
    }
}

impl From<ConfigError> for std::io::Error {
    fn from(err: ConfigError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen(args: &[&str]) -> ListenAddr {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        ListenAddr::parse(&args).expect("parse listen")
    }

    #[test]
    fn listen_defaults() {
        assert_eq!(
            listen(&[]),
            ListenAddr {
                host: DEFAULT_HOST.into(),
                port: DEFAULT_PORT
            }
        );
    }

    #[test]
    fn listen_accepts_url() {
        assert_eq!(
            listen(&["http://0.0.0.0:9000"]),
            ListenAddr {
                host: "0.0.0.0".into(),
                port: 9000
            }
        );
        assert_eq!(listen(&["http://example.org"]).port, DEFAULT_PORT);
        assert_eq!(listen(&["http://[::1]:81"]).host, "::1");
    }

    #[test]
    fn listen_accepts_bare_port() {
        assert_eq!(
            listen(&["9000"]),
            ListenAddr {
                host: DEFAULT_HOST.into(),
                port: 9000
            }
        );
    }

    #[test]
    fn listen_accepts_host_and_port() {
        assert_eq!(
            listen(&["0.0.0.0", "8081"]),
            ListenAddr {
                host: "0.0.0.0".into(),
                port: 8081
            }
        );
        assert_eq!(listen(&["localhost", "not-a-port"]).port, DEFAULT_PORT);
        assert_eq!(listen(&["localhost"]).port, DEFAULT_PORT);
    }

    #[test]
    fn listen_rejects_url_without_host() {
        assert!(ListenAddr::parse(&["http://".to_string()]).is_err());
    }

    #[test]
    fn max_age_follows_interval_unless_set() {
        let args = Args::parse_from(["stash-drop", "--sweep-interval-secs", "60"]);
        assert_eq!(args.max_age(), Duration::from_secs(60));
        let args = Args::parse_from(["stash-drop", "--max-age-secs", "5", "9000"]);
        assert_eq!(args.max_age(), Duration::from_secs(5));
        assert_eq!(args.listen, vec!["9000".to_string()]);
    }
}
