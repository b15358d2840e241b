//! Cross-cutting services module
//!
//! Identity health, admission control, retries, caching, metrics, events and
//! humanizing timing used by the fetch orchestrator.

pub mod cache;
pub mod events;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod proxy;
pub mod retry;
pub mod timing;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheError, CacheStore, MemoryCache, RedbCache, cache_key, normalize_url};
pub use events::{
    AttemptEvent, BlockedEvent, CacheHitEvent, CompletedEvent, ErrorEvent, EventDispatcher,
    EventHandler, LoggingHandler, RetryEvent, ScraperEvent,
};
pub use identity::{DescriptorSource, IdentityDescriptor, RotatingDescriptors, UserAgentClass, Viewport};
pub use limiter::{AdmissionError, AdmissionLimiter, AdmissionSnapshot, LimiterConfig};
pub use metrics::{ErrorCount, LatencyPercentiles, MetricsConfig, MetricsEntry, MetricsSink, MetricsSummary};
pub use proxy::{
    Credentials, FailureSeverity, Identity, IdentityHealth, IdentityParseError, IdentityRegistry,
    ProxyConfig, ProxyHealthReport,
};
pub use retry::{AttemptContext, RetryController, RetryPolicy};
pub use timing::{DelayRange, exponential_backoff};
