pub mod controller;
pub mod extract;
pub mod fetcher;
pub mod generator;
pub mod page;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use controller::{CrawlerController, RunSummary};
pub use fetcher::{HttpPageSource, PageSource, RateLimitedFetcher};
pub use scheduler::Scheduler;
pub use task::{FetchResult, FetchStatus, Target, TargetKind};
