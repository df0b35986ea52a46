//! Per-repository serve counts and the statistics view built from registry state.

use super::registry::Registry;
use crate::error::{AppError, AppResult};
use configserver_types::RepositoryStats;
use std::sync::Arc;

/// Per-repository usage and freshness report
#[derive(Clone)]
pub struct StatsAggregator {
    registry: Arc<Registry>,
}

impl StatsAggregator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Count one served request against a repository.
    pub fn increment_hit(&self, repository: &str) -> AppResult<u64> {
        self.registry
            .get(repository)
            .map(|entry| entry.record_hit())
            .ok_or_else(|| AppError::RepositoryNotFound(repository.to_string()))
    }

    /// One record per configured repository, in configuration order.
    ///
    /// A repository that was never fetched successfully has no `lastUpdate`.
    pub async fn snapshot(&self) -> Vec<RepositoryStats> {
        let mut stats = Vec::with_capacity(self.registry.len());
        for entry in self.registry.entries() {
            let state = entry.state().await;
            stats.push(RepositoryStats {
                name: entry.name().to_string(),
                hit_count: entry.hit_count(),
                last_update: state.last_update,
                next_update: state.next_update,
                last_error: state.last_error.unwrap_or_default(),
            });
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::registry::{FetchOutcome, RepositoryEntry};
    use chrono::Utc;
    use std::time::Duration;

    fn aggregator() -> (Arc<Registry>, StatsAggregator) {
        let registry = Arc::new(Registry::new([
            RepositoryEntry::new("docs", "/srv/docs", Duration::from_secs(60)),
            RepositoryEntry::new("infra", "/srv/infra", Duration::from_secs(60)),
        ]));
        (registry.clone(), StatsAggregator::new(registry))
    }

    #[tokio::test]
    async fn test_snapshot_lists_every_repository() {
        let (_, stats) = aggregator();
        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "docs");
        assert_eq!(snapshot[1].name, "infra");
        assert!(snapshot.iter().all(|s| s.hit_count == 0));
        assert!(snapshot.iter().all(|s| s.last_update.is_none()));
        assert!(snapshot.iter().all(|s| s.last_error.is_empty()));
    }

    #[tokio::test]
    async fn test_snapshot_reports_errors() {
        let (registry, stats) = aggregator();
        let next = Utc::now() + chrono::Duration::seconds(60);
        registry
            .record_fetch_result("infra", FetchOutcome::Failure("connection refused".into()), next)
            .await
            .unwrap();

        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot[1].last_error, "connection refused");
        assert_eq!(snapshot[1].next_update, Some(next));
        assert!(snapshot[1].last_update.is_none());
    }

    #[test]
    fn test_increment_unknown_repository() {
        let (_, stats) = aggregator();
        assert!(matches!(
            stats.increment_hit("nope"),
            Err(AppError::RepositoryNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_exact() {
        let (_, stats) = aggregator();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                tokio::spawn(async move {
                    for _ in 0..250 {
                        stats.increment_hit("docs").unwrap();
                    }
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot[0].hit_count, 2000);
        assert_eq!(snapshot[1].hit_count, 0);
    }
}
