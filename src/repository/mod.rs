//! Configuration repositories: where they come from, what was last fetched,
//! and how often they are served.

pub mod registry;
pub mod scheduler;
pub mod source;
pub mod stats;

pub use registry::{FetchOutcome, FileContent, Registry, RepositoryEntry, RepositoryState};
pub use scheduler::{Backoff, Scheduler, SchedulerHandle};
pub use source::{
    build_source, normalize_path, ConfigSource, DirectorySource, FetchError, GitSource,
    HttpSource, Snapshot,
};
pub use stats::StatsAggregator;
