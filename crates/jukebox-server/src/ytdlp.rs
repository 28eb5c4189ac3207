//! yt-dlp lookup backend.
//!
//! Runs the `yt-dlp` executable and maps its JSON info records onto
//! [`Lookup`] entries for the core resolver.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use jukebox_core::{Lookup, LookupEntry, ResolveBackend, ResolveError};
use serde::Deserialize;
use tokio::process::Command;

use crate::config::ResolverConfig;

const STDERR_TAIL_CHARS: usize = 300;

/// Subset of a yt-dlp info record.
#[derive(Debug, Default, Deserialize)]
struct InfoRecord {
    #[serde(rename = "_type")]
    kind: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    entries: Option<Vec<Option<InfoRecord>>>,
}

impl InfoRecord {
    fn into_lookup(self) -> Lookup {
        match self.entries {
            Some(entries) => Lookup::Collection(
                entries
                    .into_iter()
                    .flatten()
                    .map(InfoRecord::into_entry)
                    .collect(),
            ),
            None => Lookup::Single(self.into_entry()),
        }
    }

    fn into_entry(self) -> LookupEntry {
        let flat = self.kind.as_deref() == Some("url") || self.url.is_none();
        let duration_secs = self
            .duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d as u64);
        let (stream_ref, page_ref) = if flat {
            (None, self.url.or(self.webpage_url).or(self.id))
        } else {
            (self.url, self.webpage_url.or(self.id))
        };
        LookupEntry {
            stream_ref,
            page_ref,
            title: self.title,
            duration_secs,
            flat,
        }
    }
}

/// [`ResolveBackend`] backed by the yt-dlp command line.
pub struct YtDlpBackend {
    config: ResolverConfig,
    proxy: Option<String>,
}

impl YtDlpBackend {
    pub fn new(config: ResolverConfig) -> Self {
        let proxy = config.effective_proxy();
        if proxy.is_none() {
            tracing::warn!("no proxy configured for yt-dlp; using direct connection");
        }
        Self { config, proxy }
    }

    /// Refresh the cookie file from the environment; `None` when no cookies are available.
    async fn prepare_cookies(&self) -> Option<PathBuf> {
        let path = &self.config.cookie_file;
        if let Ok(encoded) = std::env::var(&self.config.cookies_env) {
            match general_purpose::STANDARD.decode(encoded.trim()) {
                Ok(bytes) => {
                    if let Err(err) = tokio::fs::write(path, bytes).await {
                        tracing::warn!(path = %path.display(), error = %err, "failed to write cookie file");
                    }
                }
                Err(err) => {
                    tracing::warn!(env = %self.config.cookies_env, error = %err, "cookie material is not valid base64");
                }
            }
        }
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            Some(path.clone())
        } else {
            tracing::warn!(
                path = %path.display(),
                env = %self.config.cookies_env,
                "cookie file not found; lookups may be rate limited"
            );
            None
        }
    }

    fn base_args(&self, cookies: Option<&PathBuf>) -> Vec<String> {
        let cfg = &self.config;
        let mut args = vec![
            "--dump-single-json".to_string(),
            "-f".to_string(),
            cfg.format.clone(),
            "--default-search".to_string(),
            cfg.default_search.clone(),
            "--socket-timeout".to_string(),
            cfg.socket_timeout_sec.to_string(),
            "--retries".to_string(),
            cfg.retries.to_string(),
            "--force-ipv4".to_string(),
            "--no-warnings".to_string(),
        ];
        if let Some(proxy) = self.proxy.as_ref() {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(path) = cookies {
            args.push("--cookies".to_string());
            args.push(path.display().to_string());
        }
        if let Some(agent) = cfg.user_agent.as_ref() {
            args.push("--user-agent".to_string());
            args.push(agent.clone());
        }
        args
    }

    async fn run(&self, mut args: Vec<String>, target: &str) -> Result<InfoRecord, ResolveError> {
        let cookies = self.prepare_cookies().await;
        let mut full = self.base_args(cookies.as_ref());
        full.append(&mut args);
        full.push("--".to_string());
        full.push(target.to_string());

        let output = Command::new(&self.config.program)
            .args(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ResolveError::Backend(format!("failed to run {}: {e}", self.config.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolveError::Backend(stderr_tail(&stderr)));
        }
        serde_json::from_slice::<InfoRecord>(&output.stdout)
            .map_err(|e| ResolveError::Backend(format!("unreadable lookup output: {e}")))
    }
}

#[async_trait]
impl ResolveBackend for YtDlpBackend {
    async fn lookup(&self, query: &str) -> Result<Lookup, ResolveError> {
        let record = self
            .run(vec!["--flat-playlist".to_string()], query)
            .await?;
        Ok(record.into_lookup())
    }

    async fn lookup_entry(&self, entry: &LookupEntry) -> Result<LookupEntry, ResolveError> {
        let target = entry
            .page_ref
            .as_deref()
            .or(entry.stream_ref.as_deref())
            .ok_or(ResolveError::NoResults)?;
        let record = self.run(vec!["--no-playlist".to_string()], target).await?;
        Ok(record.into_entry())
    }
}

/// Last meaningful stderr line, bounded in length.
fn stderr_tail(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("lookup failed");
    let chars: Vec<char> = line.chars().collect();
    if chars.len() > STDERR_TAIL_CHARS {
        chars[chars.len() - STDERR_TAIL_CHARS..].iter().collect()
    } else {
        line.to_string()
    }
}
