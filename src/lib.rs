//! # product-scraper-rs
//!
//! Blocking-aware product data fetching for a single hostile storefront.
//!
//! A browser session (supplied by the caller through [`SessionEngine`]) loads
//! the product page while the crate watches the responses it makes. The two
//! internal API responses carrying product detail and benefits are captured,
//! and any rate-limit, challenge or access-denied signal ends the attempt as
//! blocked.
//!
//! ## Features
//!
//! - Result cache with URL normalisation (in-memory or redb-backed)
//! - FIFO admission control: concurrency cap plus a tick-refilled reservoir
//! - Proxy health registry with escalating penalties and timed cooldown
//! - Retries that treat blocking and transient failures differently
//! - Ring-buffer metrics with latency percentiles and error rankings
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use product_scraper_rs::{ProductScraper, ScraperConfig, SessionEngine};
//!
//! async fn run(engine: Arc<dyn SessionEngine>) -> Result<(), Box<dyn std::error::Error>> {
//!     let scraper = ProductScraper::builder()
//!         .with_config(ScraperConfig::from_env()?)
//!         .with_engine(engine)
//!         .build()?;
//!     let product = scraper.fetch("https://shop.example/product/7/42").await?;
//!     println!("{}", product.product_detail);
//!     Ok(())
//! }
//! ```

mod scraper;

pub mod blocking;
pub mod config;
pub mod modules;
pub mod session;

pub use crate::scraper::{
    BuildError,
    ProductResult,
    ProductScraper,
    ProductScraperBuilder,
    ResultMetadata,
    ScrapeError,
    ScrapeResult,
};

pub use crate::blocking::{
    AttemptOutcome,
    BlockDetector,
    BlockReason,
    FailureClass,
    ProductPayload,
    TransientCause,
    TransientFailure,
};

pub use crate::config::{
    ConfigError,
    EndpointConfig,
    ScraperConfig,
    ScrollConfig,
    SessionConfig,
};

pub use crate::session::{
    ListenerId,
    NavigateOptions,
    ObservedResponse,
    ResponseListener,
    Session,
    SessionEngine,
    SessionError,
    SessionRunner,
    WaitUntil,
};

pub use crate::modules::{
    AdmissionError,
    AdmissionLimiter,
    AdmissionSnapshot,
    CacheConfig,
    CacheError,
    CacheStore,
    DelayRange,
    DescriptorSource,
    ErrorCount,
    EventDispatcher,
    EventHandler,
    Identity,
    IdentityDescriptor,
    IdentityRegistry,
    LimiterConfig,
    LoggingHandler,
    MemoryCache,
    MetricsSink,
    MetricsSummary,
    ProxyConfig,
    ProxyHealthReport,
    RedbCache,
    RetryController,
    RetryPolicy,
    RotatingDescriptors,
    ScraperEvent,
    Viewport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
