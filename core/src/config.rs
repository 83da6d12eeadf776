/// Configuration management
use crate::error::{MeshmsError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LISTEN_PORT: u16 = 4110;

/// Upper bound for both newsince durations.
pub const MAX_NEWSINCE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest message body accepted by `sendmessage`, in bytes.
pub const MESSAGE_MAX_LEN: usize = 4095;

/// RESTful MeshMS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listening address
    pub listen_addr: SocketAddr,

    /// Persistent store directory; in-memory store when absent
    pub data_dir: Option<PathBuf>,

    /// Serve the RESTful MeshMS paths at all
    pub restful_enabled: bool,

    /// How long a newsince request may wait for new messages
    pub newsince_timeout: Duration,

    /// Re-check interval while a newsince request is waiting
    pub newsince_poll_interval: Duration,

    /// Maximum message size for sendmessage
    pub message_max_len: usize,

    /// Initial capacity of each generated body chunk
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_LISTEN_PORT)),
            data_dir: None,
            restful_enabled: true,
            newsince_timeout: Duration::from_secs(60),
            newsince_poll_interval: Duration::from_secs(30),
            message_max_len: MESSAGE_MAX_LEN,
            chunk_size: 4096,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();
        let usage = || {
            MeshmsError::Config(format!(
                "Usage: {} [--listen <addr>] [--data-dir <path>] [--newsince-timeout <secs>] [--newsince-poll-ms <ms>] [--disable-restful]",
                args.first().map(String::as_str).unwrap_or("meshms")
            ))
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--listen" => {
                    let addr = args.get(i + 1).ok_or_else(|| {
                        MeshmsError::Config("--listen requires an address argument".to_string())
                    })?;
                    config.listen_addr = parse_addr(addr)?;
                    i += 2;
                }
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        MeshmsError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--newsince-timeout" => {
                    let secs = args.get(i + 1).ok_or_else(|| {
                        MeshmsError::Config(
                            "--newsince-timeout requires a seconds argument".to_string(),
                        )
                    })?;
                    config.newsince_timeout = Duration::from_secs(parse_number(
                        secs,
                        "--newsince-timeout",
                    )?);
                    i += 2;
                }
                "--newsince-poll-ms" => {
                    let ms = args.get(i + 1).ok_or_else(|| {
                        MeshmsError::Config(
                            "--newsince-poll-ms requires a milliseconds argument".to_string(),
                        )
                    })?;
                    config.newsince_poll_interval =
                        Duration::from_millis(parse_number(ms, "--newsince-poll-ms")?);
                    i += 2;
                }
                "--disable-restful" => {
                    config.restful_enabled = false;
                    i += 1;
                }
                _ => return Err(usage()),
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(addr) = std::env::var("MESHMS_LISTEN") {
            config.listen_addr = parse_addr(&addr)?;
        }
        if let Some(secs) = std::env::var("MESHMS_NEWSINCE_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.newsince_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = std::env::var("MESHMS_NEWSINCE_POLL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.newsince_poll_interval = Duration::from_millis(ms);
        }

        if config.newsince_poll_interval.is_zero() {
            return Err(MeshmsError::Config(
                "newsince poll interval must be positive".to_string(),
            ));
        }
        if config.newsince_timeout > MAX_NEWSINCE_DURATION
            || config.newsince_poll_interval > MAX_NEWSINCE_DURATION
        {
            return Err(MeshmsError::Config(format!(
                "newsince timeout and poll interval must not exceed {:?}",
                MAX_NEWSINCE_DURATION
            )));
        }

        Ok(config)
    }
}

fn parse_addr(s: &str) -> Result<SocketAddr> {
    s.parse()
        .map_err(|_| MeshmsError::Config(format!("Invalid listen address: {}", s)))
}

fn parse_number(s: &str, flag: &str) -> Result<u64> {
    s.parse::<u64>()
        .map_err(|_| MeshmsError::Config(format!("{} must be a non-negative number", flag)))
}
