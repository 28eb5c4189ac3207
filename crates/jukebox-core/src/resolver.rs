//! Query resolution policy.
//!
//! Turns a free-text query or URL into playable [`TrackRequest`]s. Collections
//! returned in flat (metadata-only) form are resolved again entry by entry.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use jukebox_types::TrackRequest;

const DEFAULT_ENTRY_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no results found")]
    NoResults,
    #[error("failed to fetch track: {0}")]
    Backend(String),
}

/// One item as reported by the lookup service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupEntry {
    /// Directly playable locator, when the service returned one.
    pub stream_ref: Option<String>,
    /// Page URL or id usable for a second lookup.
    pub page_ref: Option<String>,
    pub title: Option<String>,
    pub duration_secs: Option<u64>,
    /// Lightweight entry that needs a second lookup before playback.
    pub flat: bool,
}

impl LookupEntry {
    fn needs_second_pass(&self) -> bool {
        self.flat || self.stream_ref.is_none()
    }

    fn into_track(self, requested_by: &str) -> Option<TrackRequest> {
        let stream_ref = self.stream_ref.or(self.page_ref)?;
        TrackRequest::new(
            stream_ref,
            self.title.unwrap_or_default(),
            self.duration_secs.unwrap_or(0),
            requested_by,
        )
    }
}

/// Shape of a first-stage lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Single(LookupEntry),
    /// Playlist or channel.
    Collection(Vec<LookupEntry>),
}

/// Remote lookup service.
#[async_trait]
pub trait ResolveBackend: Send + Sync {
    /// First-stage search or URL lookup.
    async fn lookup(&self, query: &str) -> Result<Lookup, ResolveError>;
    /// Second-stage lookup of one flat collection entry.
    async fn lookup_entry(&self, entry: &LookupEntry) -> Result<LookupEntry, ResolveError>;
}

/// Applies the two-stage resolve policy on top of a [`ResolveBackend`].
#[derive(Clone)]
pub struct Resolver {
    backend: Arc<dyn ResolveBackend>,
    entry_concurrency: usize,
}

impl Resolver {
    pub fn new(backend: Arc<dyn ResolveBackend>) -> Self {
        Self {
            backend,
            entry_concurrency: DEFAULT_ENTRY_CONCURRENCY,
        }
    }

    /// Limit on concurrent second-stage lookups. Output order is unaffected.
    pub fn with_entry_concurrency(mut self, entry_concurrency: usize) -> Self {
        self.entry_concurrency = entry_concurrency.max(1);
        self
    }

    /// Resolve `query` into tracks attributed to `requested_by`.
    ///
    /// Collection entries whose second lookup fails are dropped and logged.
    /// Zero playable entries is [`ResolveError::NoResults`].
    pub async fn resolve(
        &self,
        query: &str,
        requested_by: &str,
    ) -> Result<Vec<TrackRequest>, ResolveError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResolveError::NoResults);
        }
        let started = std::time::Instant::now();
        let lookup = self.backend.lookup(query).await?;
        tracing::info!(
            query,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "lookup finished"
        );

        let tracks: Vec<TrackRequest> = match lookup {
            Lookup::Single(entry) => entry.into_track(requested_by).into_iter().collect(),
            Lookup::Collection(entries) => self
                .resolve_entries(entries)
                .await
                .into_iter()
                .filter_map(|entry| {
                    let title = entry.title.clone();
                    let track = entry.into_track(requested_by);
                    if track.is_none() {
                        tracing::warn!(
                            title = title.as_deref().unwrap_or("Unknown"),
                            "dropping entry without a stream reference"
                        );
                    }
                    track
                })
                .collect(),
        };

        if tracks.is_empty() {
            return Err(ResolveError::NoResults);
        }
        Ok(tracks)
    }

    async fn resolve_entries(&self, entries: Vec<LookupEntry>) -> Vec<LookupEntry> {
        let backend = &self.backend;
        stream::iter(entries)
            .map(|entry| async move {
                if !entry.needs_second_pass() {
                    return Some(entry);
                }
                match backend.lookup_entry(&entry).await {
                    Ok(mut resolved) => {
                        if resolved.title.is_none() {
                            resolved.title = entry.title;
                        }
                        if resolved.duration_secs.is_none() {
                            resolved.duration_secs = entry.duration_secs;
                        }
                        if resolved.page_ref.is_none() {
                            resolved.page_ref = entry.page_ref;
                        }
                        Some(resolved)
                    }
                    Err(err) => {
                        tracing::warn!(
                            title = entry.title.as_deref().unwrap_or("Unknown"),
                            page_ref = entry.page_ref.as_deref().unwrap_or(""),
                            error = %err,
                            "dropping playlist entry that failed to resolve"
                        );
                        None
                    }
                }
            })
            .buffered(self.entry_concurrency)
            .filter_map(|entry| async move { entry })
            .collect()
            .await
    }
}
