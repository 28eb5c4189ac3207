//! Configuration loading and parsing.
//!
//! Defines the server config schema and resolves defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const PROXY_ENV: &str = "YTDLP_PROXY";

/// Top-level server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (host:port).
    pub bind: Option<String>,
    pub playback: PlaybackConfig,
    pub resolver: ResolverConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Failed tracks in a row before a session is abandoned.
    pub max_consecutive_failures: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
        }
    }
}

/// yt-dlp invocation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub program: String,
    /// Search prefix applied to plain-text queries.
    pub default_search: String,
    pub format: String,
    pub socket_timeout_sec: u32,
    pub retries: u32,
    /// Overridden by `YTDLP_PROXY`.
    pub proxy: Option<String>,
    pub cookie_file: PathBuf,
    /// Env var holding base64 cookie material written to `cookie_file`.
    pub cookies_env: String,
    pub entry_concurrency: usize,
    pub user_agent: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            default_search: "ytsearch1".to_string(),
            format: "bestaudio/best".to_string(),
            socket_timeout_sec: 15,
            retries: 5,
            proxy: None,
            cookie_file: PathBuf::from("cookies.txt"),
            cookies_env: "YTDLP_COOKIES".to_string(),
            entry_concurrency: 4,
            user_agent: None,
        }
    }
}

impl ResolverConfig {
    /// Proxy from the environment, falling back to the config value.
    pub fn effective_proxy(&self) -> Option<String> {
        std::env::var(PROXY_ENV)
            .ok()
            .or_else(|| self.proxy.clone())
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
    }
}

/// Process templates used by the transport sink.
///
/// Each argument may contain `{stream}`, `{channel}` or `{session}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub decoder: Vec<String>,
    pub output: Vec<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        let argv = |args: &[&str]| args.iter().map(|a| a.to_string()).collect();
        Self {
            decoder: argv(&[
                "ffmpeg",
                "-nostdin",
                "-loglevel",
                "error",
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_delay_max",
                "5",
                "-re",
                "-i",
                "{stream}",
                "-vn",
                "-f",
                "s16le",
                "-ar",
                "48000",
                "-ac",
                "2",
                "pipe:1",
            ]),
            output: argv(&[
                "ffmpeg",
                "-loglevel",
                "error",
                "-f",
                "s16le",
                "-ar",
                "48000",
                "-ac",
                "2",
                "-i",
                "pipe:0",
                "-c:a",
                "libopus",
                "-f",
                "rtp",
                "{channel}",
            ]),
        }
    }
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<ServerConfig>(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.playback.max_consecutive_failures == 0 {
            return Err(anyhow::anyhow!(
                "playback.max_consecutive_failures must be at least 1"
            ));
        }
        if self.resolver.program.trim().is_empty() {
            return Err(anyhow::anyhow!("resolver.program is required"));
        }
        if self.sink.decoder.is_empty() || self.sink.output.is_empty() {
            return Err(anyhow::anyhow!("sink.decoder and sink.output must not be empty"));
        }
        Ok(())
    }

    /// Load from `explicit`, else `config.toml` beside the executable, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let auto_path = std::env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(|dir| dir.join("config.toml")));
        match auto_path {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                tracing::warn!("no config file found; using defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Parse the bind address from config, defaulting to all interfaces on 8080.
pub fn bind_from_config(cfg: &ServerConfig) -> Result<SocketAddr> {
    let bind = cfg.bind.as_deref().unwrap_or(DEFAULT_BIND);
    bind.parse().with_context(|| format!("parse bind {bind}"))
}
