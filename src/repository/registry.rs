//! Configured repositories and their latest fetched state.
//!
//! The set of repositories is fixed at startup. Per-repository state is
//! written by that repository's poll loop only and read by request handlers,
//! so each entry carries its own lock and a failing repository never blocks
//! readers of another one.

use super::source::{normalize_path, Snapshot};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Mutable part of a repository, replaced as a unit after each fetch
#[derive(Debug, Clone, Default)]
pub struct RepositoryState {
    pub snapshot: Option<Arc<Snapshot>>,
    /// Bumped on every successful fetch
    pub revision: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// What a single fetch attempt produced
#[derive(Debug)]
pub enum FetchOutcome {
    Success(Snapshot),
    Failure(String),
}

/// A configured repository
#[derive(Debug)]
pub struct RepositoryEntry {
    name: String,
    locator: String,
    interval: Duration,
    state: RwLock<RepositoryState>,
    hits: AtomicU64,
}

impl RepositoryEntry {
    pub fn new(name: impl Into<String>, locator: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
            interval,
            state: RwLock::new(RepositoryState::default()),
            hits: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn state(&self) -> RepositoryState {
        self.state.read().await.clone()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Count one served request. Returns the new total.
    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Apply the result of a fetch attempt.
    ///
    /// A failure keeps the previous snapshot; only the error text and the
    /// schedule change. Returns the number of consecutive failures.
    pub async fn record_fetch(&self, outcome: FetchOutcome, next_update: DateTime<Utc>) -> u32 {
        let mut state = self.state.write().await;
        match outcome {
            FetchOutcome::Success(snapshot) => {
                state.last_update = Some(snapshot.fetched_at());
                state.snapshot = Some(Arc::new(snapshot));
                state.revision += 1;
                state.last_error = None;
                state.consecutive_failures = 0;
            }
            FetchOutcome::Failure(error) => {
                state.last_error = Some(error);
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
        }
        state.next_update = Some(next_update);
        state.consecutive_failures
    }
}

/// File content together with the revision of the snapshot it came from
#[derive(Debug, Clone)]
pub struct FileContent {
    pub content: Bytes,
    pub revision: u64,
}

/// All configured repositories, in configuration order
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<Arc<RepositoryEntry>>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn new(entries: impl IntoIterator<Item = RepositoryEntry>) -> Self {
        let mut registry = Self::default();
        for entry in entries {
            if registry.index.contains_key(entry.name()) {
                continue;
            }
            registry
                .index
                .insert(entry.name().to_string(), registry.entries.len());
            registry.entries.push(Arc::new(entry));
        }
        registry
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.repositories.iter().map(|repository| {
            RepositoryEntry::new(
                repository.name.trim(),
                repository.url.clone(),
                repository.interval(&config.scheduler),
            )
        }))
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<RepositoryEntry>> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RepositoryEntry>> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of every configured repository, fetched or not.
    pub fn list_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Trim, dedupe and check a requested repository list.
    ///
    /// Order of first occurrence is kept. Every unknown name is reported at
    /// once so the caller can fix the request in one go.
    pub fn validate(&self, requested: &[String]) -> AppResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        let mut unknown = Vec::new();
        for name in requested {
            let name = name.trim();
            if name.is_empty() || !seen.insert(name) {
                continue;
            }
            if self.contains(name) {
                accepted.push(name.to_string());
            } else {
                unknown.push(name.to_string());
            }
        }
        if !unknown.is_empty() {
            return Err(AppError::UnknownRepository(unknown));
        }
        if accepted.is_empty() {
            return Err(AppError::validation("at least one repository is required"));
        }
        Ok(accepted)
    }

    fn entry(&self, name: &str) -> AppResult<&Arc<RepositoryEntry>> {
        self.get(name)
            .ok_or_else(|| AppError::RepositoryNotFound(name.to_string()))
    }

    /// Latest successfully fetched snapshot and its revision.
    pub async fn get_snapshot(&self, name: &str) -> AppResult<(Arc<Snapshot>, u64)> {
        let state = self.entry(name)?.state.read().await;
        match &state.snapshot {
            Some(snapshot) => Ok((snapshot.clone(), state.revision)),
            None => Err(AppError::RepositoryUnavailable(name.to_string())),
        }
    }

    /// Raw content of one file from the latest snapshot.
    pub async fn get_file(&self, name: &str, path: &str) -> AppResult<FileContent> {
        let normalized =
            normalize_path(path).ok_or_else(|| AppError::InvalidPath(path.to_string()))?;
        let (snapshot, revision) = self.get_snapshot(name).await?;
        let content = snapshot
            .file(&normalized)
            .cloned()
            .ok_or(AppError::FileNotFound(normalized))?;
        Ok(FileContent { content, revision })
    }

    pub async fn record_fetch_result(
        &self,
        name: &str,
        outcome: FetchOutcome,
        next_update: DateTime<Utc>,
    ) -> AppResult<u32> {
        Ok(self.entry(name)?.record_fetch(outcome, next_update).await)
    }
}
