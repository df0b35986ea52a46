//! External configuration sources polled by the scheduler.

use crate::config::{RepositoryConfig, SchedulerConfig, SourceKind};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

/// Why a fetch did not produce a snapshot
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source responded with status {0}")]
    Status(reqwest::StatusCode),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("Fetch timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Source '{0}' contains no files")]
    Empty(String),

    #[error("Invalid source locator '{0}'")]
    InvalidLocator(String),
}

/// Content of a repository at one point in time, keyed by normalized path.
#[derive(Debug, Clone)]
pub struct Snapshot {
    files: BTreeMap<String, Bytes>,
    fetched_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(files: BTreeMap<String, Bytes>) -> Self {
        Self {
            files,
            fetched_at: Utc::now(),
        }
    }

    /// Look up a file by request path.
    pub fn file(&self, path: &str) -> Option<&Bytes> {
        self.files.get(&normalize_path(path)?)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// Normalize a relative path to `a/b/c` form.
///
/// Returns `None` for anything escaping the repository root (`..`, absolute
/// paths) or naming nothing at all.
pub fn normalize_path(path: &str) -> Option<String> {
    if path.starts_with('/') || path.starts_with('\\') {
        return None;
    }
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            p if p.contains(':') => return None,
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// A place configuration can be pulled from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Pull the current content. Called sequentially for a given repository.
    async fn fetch(&self) -> Result<Snapshot, FetchError>;

    /// Human readable locator for logs.
    fn describe(&self) -> String;
}

/// Read a directory tree into a snapshot, skipping `.git`.
fn read_tree(root: &Path) -> Result<BTreeMap<String, Bytes>, FetchError> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let Some(key) = relative.to_str().and_then(normalize_path) else {
            debug!(path = %entry.path().display(), "Skipping file with unsupported name");
            continue;
        };
        files.insert(key, Bytes::from(std::fs::read(entry.path())?));
    }
    Ok(files)
}

async fn read_tree_blocking(root: PathBuf) -> Result<Snapshot, FetchError> {
    let display = root.display().to_string();
    let files = tokio::task::spawn_blocking(move || read_tree(&root))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
    if files.is_empty() {
        return Err(FetchError::Empty(display));
    }
    Ok(Snapshot::new(files))
}

/// Local directory source
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ConfigSource for DirectorySource {
    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        if !self.root.is_dir() {
            return Err(FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("'{}' is not a directory", self.root.display()),
            )));
        }
        read_tree_blocking(self.root.clone()).await
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Single document served over HTTP, stored under the last URL segment
#[derive(Debug, Clone)]
pub struct HttpSource {
    http: Client,
    url: Url,
    file_name: String,
}

impl HttpSource {
    pub fn new(http: Client, url: &str) -> Result<Self, FetchError> {
        let url = Url::parse(url).map_err(|_| FetchError::InvalidLocator(url.to_string()))?;
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("index")
            .to_string();
        Ok(Self {
            http,
            url,
            file_name,
        })
    }
}

#[async_trait]
impl ConfigSource for HttpSource {
    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        let response = self.http.get(self.url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }
        let body = response.bytes().await?;
        let mut files = BTreeMap::new();
        files.insert(self.file_name.clone(), body);
        Ok(Snapshot::new(files))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Directory name for a repository checkout.
///
/// Always a single path segment: the name with anything outside
/// `[A-Za-z0-9_-]` replaced, plus a digest of the raw name so distinct names
/// never share (or nest inside) a checkout.
pub fn checkout_dir_name(repository: &str) -> String {
    let sanitized: String = repository
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let digest = Sha256::digest(repository.as_bytes());
    let suffix: String = digest[..6].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", sanitized, suffix)
}

/// Git repository kept up to date through the system `git` binary
#[derive(Debug, Clone)]
pub struct GitSource {
    url: String,
    branch: Option<String>,
    root: PathBuf,
    checkout: PathBuf,
}

impl GitSource {
    /// Check `url` out under `root`, in a directory derived from `repository`.
    pub fn new(
        url: impl Into<String>,
        branch: Option<String>,
        root: impl Into<PathBuf>,
        repository: &str,
    ) -> Self {
        let root = root.into();
        let checkout = root.join(checkout_dir_name(repository));
        Self {
            url: url.into(),
            branch,
            root,
            checkout,
        }
    }

    pub fn checkout(&self) -> &Path {
        &self.checkout
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<(), FetchError> {
        let mut command = Command::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command.output().await?;
        if output.status.success() {
            return Ok(());
        }
        Err(FetchError::Git {
            command: args.first().copied().unwrap_or_default().to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn clone_fresh(&self) -> Result<(), FetchError> {
        // Only ever remove a direct child of the checkout root
        if self.checkout.parent() != Some(self.root.as_path()) {
            return Err(FetchError::InvalidLocator(self.checkout.display().to_string()));
        }
        tokio::fs::create_dir_all(&self.root).await?;
        if self.checkout.exists() {
            tokio::fs::remove_dir_all(&self.checkout).await?;
        }
        let checkout = self.checkout.to_string_lossy().to_string();
        let mut args = vec!["clone", "--depth", "1"];
        if let Some(branch) = &self.branch {
            args.extend(["--branch", branch.as_str()]);
        }
        args.extend([self.url.as_str(), checkout.as_str()]);
        self.git(&args, None).await
    }

    async fn update(&self) -> Result<(), FetchError> {
        let reference = self.branch.as_deref().unwrap_or("HEAD");
        self.git(&["fetch", "--depth", "1", "origin", reference], Some(&self.checkout))
            .await?;
        self.git(&["reset", "--hard", "FETCH_HEAD"], Some(&self.checkout))
            .await?;
        self.git(&["clean", "-fd"], Some(&self.checkout)).await
    }
}

#[async_trait]
impl ConfigSource for GitSource {
    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        if self.checkout.join(".git").is_dir() {
            debug!(url = %self.url, "Updating existing checkout");
            self.update().await?;
        } else {
            debug!(url = %self.url, checkout = %self.checkout.display(), "No local copy found, cloning");
            self.clone_fresh().await?;
        }
        read_tree_blocking(self.checkout.clone()).await
    }

    fn describe(&self) -> String {
        match &self.branch {
            Some(branch) => format!("{}#{}", self.url, branch),
            None => self.url.clone(),
        }
    }
}

/// Build the source for a configured repository.
pub fn build_source(
    repository: &RepositoryConfig,
    scheduler: &SchedulerConfig,
    http: &Client,
) -> Result<Arc<dyn ConfigSource>, FetchError> {
    let source: Arc<dyn ConfigSource> = match repository.source_kind() {
        SourceKind::Git => Arc::new(GitSource::new(
            repository.url.clone(),
            repository.branch.clone(),
            &scheduler.checkout_location,
            &repository.name,
        )),
        SourceKind::Http => Arc::new(HttpSource::new(http.clone(), &repository.url)?),
        SourceKind::Directory => {
            let path = repository
                .url
                .strip_prefix("file://")
                .unwrap_or(&repository.url);
            Arc::new(DirectorySource::new(path))
        }
    };
    Ok(source)
}
