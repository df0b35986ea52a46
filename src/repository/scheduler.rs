//! Periodic polling of configured repositories.
//!
//! Every repository gets its own task: fetch, record the outcome, sleep,
//! repeat. Attempts for one repository never overlap and a slow or failing
//! source only delays itself. A failed attempt stretches the wait with a
//! bounded exponential backoff but the loop never stops on its own.

use super::registry::{FetchOutcome, Registry, RepositoryEntry};
use super::source::{build_source, ConfigSource, FetchError};
use crate::cache::ContentCache;
use crate::config::AppConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wait time between attempts for one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    interval: Duration,
    ceiling: Duration,
}

impl Backoff {
    /// The ceiling never drops below the regular interval.
    pub fn new(interval: Duration, max_backoff: Duration) -> Self {
        Self {
            interval,
            ceiling: max_backoff.max(interval),
        }
    }

    /// `interval * 2^failures`, capped at the ceiling.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.interval;
        }
        2u32.checked_pow(consecutive_failures)
            .and_then(|factor| self.interval.checked_mul(factor))
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Builds and starts the per-repository poll loops
pub struct Scheduler {
    registry: Arc<Registry>,
    sources: HashMap<String, Arc<dyn ConfigSource>>,
    fetch_timeout: Duration,
    max_backoff: Duration,
    cache: Option<Arc<ContentCache>>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, fetch_timeout: Duration, max_backoff: Duration) -> Self {
        Self {
            registry,
            sources: HashMap::new(),
            fetch_timeout,
            max_backoff,
            cache: None,
        }
    }

    /// Scheduler with one source per configured repository.
    pub fn from_config(registry: Arc<Registry>, config: &AppConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(config.scheduler.fetch_timeout())
            .user_agent(concat!("configserver/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut scheduler = Self::new(
            registry,
            config.scheduler.fetch_timeout(),
            config.scheduler.max_backoff(),
        );
        for repository in &config.repositories {
            let source = build_source(repository, &config.scheduler, &http)?;
            scheduler = scheduler.with_source(repository.name.trim(), source);
        }
        Ok(scheduler)
    }

    pub fn with_source(mut self, name: impl Into<String>, source: Arc<dyn ConfigSource>) -> Self {
        self.sources.insert(name.into(), source);
        self
    }

    /// Drop cached renderings of a repository whenever it gets a new snapshot.
    pub fn with_cache(mut self, cache: Arc<ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Spawn one poll loop per repository. The first fetch starts immediately.
    pub fn start(mut self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.registry.len());

        for entry in self.registry.entries() {
            let Some(source) = self.sources.remove(entry.name()) else {
                warn!(repository = %entry.name(), "No source configured, repository will never be fetched");
                continue;
            };
            let poller = Poller {
                entry: entry.clone(),
                source,
                backoff: Backoff::new(entry.interval(), self.max_backoff),
                fetch_timeout: self.fetch_timeout,
                cache: self.cache.clone(),
            };
            tasks.push(tokio::spawn(poller.run(shutdown_rx.clone())));
        }

        info!("Scheduler started with {} repositories", tasks.len());
        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Running poll loops
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every loop to stop and wait until they have.
    ///
    /// Loops exit at their next await point; in-flight fetches are dropped.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in futures::future::join_all(self.tasks).await {
            if let Err(e) = task {
                warn!("Poll task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

struct Poller {
    entry: Arc<RepositoryEntry>,
    source: Arc<dyn ConfigSource>,
    backoff: Backoff,
    fetch_timeout: Duration,
    cache: Option<Arc<ContentCache>>,
}

impl Poller {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.entry.name().to_string();
        let mut attempt: u64 = 0;
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            attempt += 1;
            debug!(repository = %name, attempt, source = %self.source.describe(), "Fetching repository");

            let outcome = tokio::select! {
                result = tokio::time::timeout(self.fetch_timeout, self.source.fetch()) => {
                    match result {
                        Ok(Ok(snapshot)) => FetchOutcome::Success(snapshot),
                        Ok(Err(e)) => FetchOutcome::Failure(e.to_string()),
                        Err(_) => FetchOutcome::Failure(FetchError::Timeout(self.fetch_timeout).to_string()),
                    }
                }
                _ = shutdown.changed() => break,
            };

            let error = match &outcome {
                FetchOutcome::Failure(error) => Some(error.clone()),
                FetchOutcome::Success(_) => None,
            };
            failures = if error.is_some() {
                failures.saturating_add(1)
            } else {
                0
            };
            let delay = self.backoff.delay(failures);
            let next_update = after(Utc::now(), delay);

            self.entry.record_fetch(outcome, next_update).await;

            match error {
                None => {
                    if let Some(cache) = &self.cache {
                        cache.invalidate_repository(&name);
                    }
                    info!(repository = %name, attempt, next_update = %next_update, "Repository updated");
                }
                Some(error) => {
                    warn!(repository = %name, attempt, failures, next_update = %next_update, error = %error, "Repository fetch failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!(repository = %name, "Poll loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::source::Snapshot;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::future::{BoxFuture, FutureExt};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConfigSource for FailingSource {
        async fn fetch(&self) -> Result<Snapshot, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Empty("mock".to_string()))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    struct StaticSource;

    #[async_trait]
    impl ConfigSource for StaticSource {
        async fn fetch(&self) -> Result<Snapshot, FetchError> {
            let mut files = BTreeMap::new();
            files.insert("app.yaml".to_string(), Bytes::from_static(b"a: 1"));
            Ok(Snapshot::new(files))
        }

        fn describe(&self) -> String {
            "static".to_string()
        }
    }

    struct HangingSource;

    #[async_trait]
    impl ConfigSource for HangingSource {
        async fn fetch(&self) -> Result<Snapshot, FetchError> {
            futures::future::pending().await
        }

        fn describe(&self) -> String {
            "hanging".to_string()
        }
    }

    fn registry(names: &[&str], interval: Duration) -> Arc<Registry> {
        Arc::new(Registry::new(
            names
                .iter()
                .map(|name| RepositoryEntry::new(*name, "mock", interval)),
        ))
    }

    async fn wait_for<F>(mut condition: F)
    where
        F: FnMut() -> BoxFuture<'static, bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_backoff_bounds() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::from_secs(10));
        assert_eq!(backoff.delay(1), Duration::from_secs(20));
        assert_eq!(backoff.delay(2), Duration::from_secs(40));
        assert_eq!(backoff.delay(3), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_ceiling_not_below_interval() {
        let backoff = Backoff::new(Duration::from_secs(120), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::from_secs(120));
        assert_eq!(backoff.delay(5), Duration::from_secs(120));
    }

    #[test]
    fn test_after_saturates() {
        let now = Utc::now();
        assert!(after(now, Duration::from_secs(5)) > now);
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_failing_source_keeps_being_polled() {
        let registry = registry(&["docs"], Duration::from_millis(20));
        let source = Arc::new(FailingSource {
            calls: AtomicUsize::new(0),
        });
        let handle = Scheduler::new(
            registry.clone(),
            Duration::from_secs(1),
            Duration::from_millis(40),
        )
        .with_source("docs", source.clone())
        .start();

        let watched = source.clone();
        wait_for(move || {
            let watched = watched.clone();
            async move { watched.calls.load(Ordering::SeqCst) >= 3 }.boxed()
        })
        .await;

        let state = registry.get("docs").unwrap().state().await;
        assert!(state.last_error.as_deref().is_some_and(|e| !e.is_empty()));
        assert!(state.snapshot.is_none());
        assert!(state.next_update.is_some_and(|next| next > Utc::now() - chrono::Duration::seconds(1)));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_next_update_advances_on_failure() {
        let registry = registry(&["docs"], Duration::from_millis(20));
        let source = Arc::new(FailingSource {
            calls: AtomicUsize::new(0),
        });
        let handle = Scheduler::new(registry.clone(), Duration::from_secs(1), Duration::from_millis(40))
            .with_source("docs", source.clone())
            .start();

        let entry = registry.get("docs").unwrap().clone();
        let watched = entry.clone();
        wait_for(move || {
            let watched = watched.clone();
            async move { watched.state().await.next_update.is_some() }.boxed()
        })
        .await;
        let first = entry.state().await.next_update;

        let watched = entry.clone();
        wait_for(move || {
            let watched = watched.clone();
            async move { watched.state().await.next_update != first }.boxed()
        })
        .await;
        assert!(entry.state().await.next_update > first);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_success_populates_registry_and_invalidates_cache() {
        use crate::cache::CacheKey;

        let registry = registry(&["docs"], Duration::from_secs(3600));
        let cache = Arc::new(ContentCache::new(3600, 100));
        cache.insert(
            CacheKey {
                repository: "docs".to_string(),
                path: "stale.yaml".to_string(),
                revision: 0,
            },
            Bytes::from_static(b"old"),
        );

        let handle = Scheduler::new(registry.clone(), Duration::from_secs(1), Duration::from_secs(60))
            .with_source("docs", Arc::new(StaticSource))
            .with_cache(cache.clone())
            .start();

        let watched = registry.clone();
        wait_for(move || {
            let watched = watched.clone();
            async move { watched.get_snapshot("docs").await.is_ok() }.boxed()
        })
        .await;

        let file = registry.get_file("docs", "app.yaml").await.unwrap();
        assert_eq!(file.content.as_ref(), b"a: 1");
        assert!(cache.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_failing_repository_does_not_block_another() {
        let registry = registry(&["broken", "docs"], Duration::from_secs(3600));
        let handle = Scheduler::new(registry.clone(), Duration::from_secs(30), Duration::from_secs(60))
            .with_source("broken", Arc::new(HangingSource))
            .with_source("docs", Arc::new(StaticSource))
            .start();

        let watched = registry.clone();
        wait_for(move || {
            let watched = watched.clone();
            async move { watched.get_snapshot("docs").await.is_ok() }.boxed()
        })
        .await;
        assert!(registry.get_snapshot("broken").await.is_err());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_recorded() {
        let registry = registry(&["slow"], Duration::from_secs(3600));
        let handle = Scheduler::new(registry.clone(), Duration::from_millis(20), Duration::from_secs(60))
            .with_source("slow", Arc::new(HangingSource))
            .start();

        let entry = registry.get("slow").unwrap().clone();
        let watched = entry.clone();
        wait_for(move || {
            let watched = watched.clone();
            async move { watched.state().await.last_error.is_some() }.boxed()
        })
        .await;
        assert!(entry.state().await.last_error.unwrap().contains("timed out"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt_with_hanging_fetch() {
        let registry = registry(&["slow"], Duration::from_secs(3600));
        let handle = Scheduler::new(registry, Duration::from_secs(3600), Duration::from_secs(3600))
            .with_source("slow", Arc::new(HangingSource))
            .start();
        assert_eq!(handle.task_count(), 1);

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("scheduler did not stop");
    }

    #[tokio::test]
    async fn test_repository_without_source_is_skipped() {
        let registry = registry(&["docs", "orphan"], Duration::from_secs(3600));
        let handle = Scheduler::new(registry, Duration::from_secs(1), Duration::from_secs(60))
            .with_source("docs", Arc::new(StaticSource))
            .start();
        assert_eq!(handle.task_count(), 1);
        handle.shutdown().await;
    }
}
