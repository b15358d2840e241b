//! High level fetch orchestration.
//!
//! Wires the cache, admission limiter, retry controller, identity registry
//! and session runner together behind a single `fetch(url)` call, and exposes
//! read-only views over metrics, proxy health and admission state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::blocking::{BlockReason, FailureClass, ProductPayload, TransientCause};
use crate::config::{ConfigError, ScraperConfig};
use crate::modules::cache::{CacheError, CacheStore, MemoryCache, RedbCache, cache_key};
use crate::modules::events::{
	CacheHitEvent, CompletedEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler,
	ScraperEvent,
};
use crate::modules::identity::{DescriptorSource, RotatingDescriptors};
use crate::modules::limiter::{AdmissionError, AdmissionLimiter, AdmissionSnapshot};
use crate::modules::metrics::{ErrorCount, MetricsSink, MetricsSummary};
use crate::modules::proxy::{IdentityRegistry, ProxyHealthReport};
use crate::modules::retry::RetryController;
use crate::session::{SessionEngine, SessionRunner};

/// Result alias used across the orchestration layer.
pub type ScrapeResult<T> = Result<T, ScrapeError>;

/// Error surfaced to callers of [`ProductScraper::fetch`]. The variant keeps
/// the classification of the last attempt.
#[derive(Debug, Error)]
pub enum ScrapeError {
	#[error("blocked by target site ({reason}) after {attempts} attempt(s)")]
	Blocked { reason: BlockReason, attempts: u32 },
	#[error("fetch failed ({cause}) after {attempts} attempt(s): {message}")]
	Transient {
		cause: TransientCause,
		message: String,
		attempts: u32,
	},
	#[error("invalid product url: {0}")]
	InvalidUrl(#[from] url::ParseError),
	#[error("scraper is shutting down")]
	Shutdown,
}

impl ScrapeError {
	pub fn classification(&self) -> FailureClass {
		match self {
			ScrapeError::Blocked { reason, .. } => FailureClass::Blocked(*reason),
			ScrapeError::Transient { cause, .. } => FailureClass::Transient(*cause),
			ScrapeError::InvalidUrl(_) => FailureClass::InvalidInput,
			ScrapeError::Shutdown => FailureClass::Shutdown,
		}
	}

	/// Stable tag recorded in metrics.
	pub fn error_tag(&self) -> &'static str {
		match self {
			ScrapeError::Blocked { reason, .. } => reason.as_str(),
			ScrapeError::Transient { cause, .. } => cause.as_str(),
			ScrapeError::InvalidUrl(_) => "invalid_url",
			ScrapeError::Shutdown => "shutdown",
		}
	}

	pub fn attempts(&self) -> u32 {
		match self {
			ScrapeError::Blocked { attempts, .. } | ScrapeError::Transient { attempts, .. } => {
				*attempts
			}
			ScrapeError::InvalidUrl(_) | ScrapeError::Shutdown => 0,
		}
	}
}

impl From<AdmissionError> for ScrapeError {
	fn from(_: AdmissionError) -> Self {
		ScrapeError::Shutdown
	}
}

/// Failures while assembling a [`ProductScraper`].
#[derive(Debug, Error)]
pub enum BuildError {
	#[error("no session engine configured")]
	MissingEngine,
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("invalid challenge pattern: {0}")]
	Pattern(#[from] regex::Error),
	#[error("cache initialisation failed: {0}")]
	Cache(#[from] CacheError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
	pub scraped_at: DateTime<Utc>,
	pub latency_ms: u64,
	/// Only ever `true` on values served from the cache.
	pub cached: bool,
}

/// Product data returned by [`ProductScraper::fetch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductResult {
	pub product_detail: Value,
	pub benefits: Value,
	pub metadata: ResultMetadata,
}

/// Fluent builder for [`ProductScraper`].
pub struct ProductScraperBuilder {
	config: ScraperConfig,
	engine: Option<Arc<dyn SessionEngine>>,
	cache: Option<Arc<dyn CacheStore>>,
	descriptors: Option<Arc<dyn DescriptorSource>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl ProductScraperBuilder {
	pub fn new() -> Self {
		Self {
			config: ScraperConfig::default(),
			engine: None,
			cache: None,
			descriptors: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: ScraperConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.proxies = proxies.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_engine(mut self, engine: Arc<dyn SessionEngine>) -> Self {
		self.engine = Some(engine);
		self
	}

	pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
		self.cache = Some(cache);
		self
	}

	pub fn with_descriptors(mut self, descriptors: Arc<dyn DescriptorSource>) -> Self {
		self.descriptors = Some(descriptors);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> Result<ProductScraper, BuildError> {
		ProductScraper::from_builder(self)
	}
}

impl Default for ProductScraperBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main fetch orchestrator.
pub struct ProductScraper {
	config: ScraperConfig,
	cache: Arc<dyn CacheStore>,
	limiter: AdmissionLimiter,
	registry: Arc<IdentityRegistry>,
	retry: RetryController,
	runner: SessionRunner,
	metrics: MetricsSink,
	events: Arc<EventDispatcher>,
}

impl ProductScraper {
	/// Obtain a builder to customise the scraper instance.
	pub fn builder() -> ProductScraperBuilder {
		ProductScraperBuilder::new()
	}

	fn from_builder(builder: ProductScraperBuilder) -> Result<Self, BuildError> {
		let ProductScraperBuilder {
			config,
			engine,
			cache,
			descriptors,
			handlers,
		} = builder;

		config.validate()?;
		let engine = engine.ok_or(BuildError::MissingEngine)?;

		let cache: Arc<dyn CacheStore> = match (cache, &config.cache.path) {
			(Some(cache), _) => cache,
			(None, Some(path)) => Arc::new(RedbCache::open(path)?),
			(None, None) => Arc::new(MemoryCache::new()),
		};
		let descriptors = descriptors.unwrap_or_else(|| Arc::new(RotatingDescriptors::new()));

		let registry = Arc::new(IdentityRegistry::from_urls(
			config.proxy.clone(),
			&config.proxies,
		));
		if registry.is_empty() {
			log::info!("no usable proxies configured, fetching over a direct connection");
		} else {
			log::info!("loaded {} proxies", registry.len());
		}

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		for handler in handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let runner = SessionRunner::new(engine, descriptors, config.session.clone())?;
		let retry = RetryController::new(config.retry.clone(), registry.clone(), events.clone());

		Ok(Self {
			limiter: AdmissionLimiter::new(&config.limiter),
			metrics: MetricsSink::with_capacity(config.metrics.capacity),
			config,
			cache,
			registry,
			retry,
			runner,
			events,
		})
	}

	/// Fetch product data for `url`, serving from cache when possible.
	pub async fn fetch(&self, url: &str) -> ScrapeResult<ProductResult> {
		let started = Instant::now();
		let target = Url::parse(url)?;
		let key = cache_key(&self.config.cache.key_prefix, &target);

		if let Some(mut hit) = self.lookup(&key).await {
			let latency = started.elapsed();
			hit.metadata.cached = true;
			hit.metadata.latency_ms = millis(latency);
			self.metrics.record(latency, true, true, None);
			self.events.dispatch(ScraperEvent::CacheHit(CacheHitEvent {
				key,
				timestamp: Utc::now(),
			}));
			self.completed(&target, latency, true);
			return Ok(hit);
		}

		let outcome = self
			.limiter
			.schedule(|| self.fetch_uncached(&target))
			.await
			.map_err(ScrapeError::from)
			.and_then(|result| result);
		let latency = started.elapsed();

		match outcome {
			Ok(payload) => {
				let result = ProductResult {
					product_detail: payload.product_detail,
					benefits: payload.benefits,
					metadata: ResultMetadata {
						scraped_at: Utc::now(),
						latency_ms: millis(latency),
						cached: false,
					},
				};
				self.store(&key, &result).await;
				self.metrics.record(latency, true, false, None);
				self.completed(&target, latency, false);
				Ok(result)
			}
			Err(err) => {
				self.metrics.record(latency, false, false, Some(err.error_tag()));
				self.events.dispatch(ScraperEvent::Error(ErrorEvent {
					target: target.to_string(),
					error: err.to_string(),
					timestamp: Utc::now(),
				}));
				Err(err)
			}
		}
	}

	/// Summary over entries recorded in the last `window_minutes`.
	pub fn metrics_summary(&self, window_minutes: u64) -> MetricsSummary {
		self.metrics.summary(window_minutes)
	}

	pub fn top_errors(&self, limit: usize) -> Vec<ErrorCount> {
		self.metrics.top_errors(limit)
	}

	pub fn proxy_health(&self) -> ProxyHealthReport {
		self.registry.health_report()
	}

	pub fn admission_snapshot(&self) -> AdmissionSnapshot {
		self.limiter.snapshot()
	}

	pub fn config(&self) -> &ScraperConfig {
		&self.config
	}

	/// Rejects queued and future fetches. Fetches already running finish.
	pub fn shutdown(&self) {
		self.limiter.close();
	}

	async fn fetch_uncached(&self, target: &Url) -> ScrapeResult<ProductPayload> {
		let waited = self.config.pre_request_delay.pause().await;
		log::debug!("starting {target} after {:.2}s pre-request delay", waited.as_secs_f64());

		let runner = &self.runner;
		self.retry
			.execute(target.as_str(), self.config.retry.max_attempts, |ctx| async move {
				runner.run(target, ctx.identity.as_ref()).await
			})
			.await
	}

	async fn lookup(&self, key: &str) -> Option<ProductResult> {
		let raw = match self.cache.get(key).await {
			Ok(raw) => raw?,
			Err(err) => {
				log::warn!("cache read failed for {key}: {err}");
				return None;
			}
		};
		match serde_json::from_slice(&raw) {
			Ok(result) => Some(result),
			Err(err) => {
				log::warn!("ignoring corrupt cache entry {key}: {err}");
				None
			}
		}
	}

	async fn store(&self, key: &str, result: &ProductResult) {
		let encoded = match serde_json::to_vec(result) {
			Ok(encoded) => Bytes::from(encoded),
			Err(err) => {
				log::warn!("could not encode result for cache key {key}: {err}");
				return;
			}
		};
		if let Err(err) = self.cache.set_with_ttl(key, encoded, self.config.cache.ttl).await {
			log::warn!("cache write failed for {key}: {err}");
		}
	}

	fn completed(&self, target: &Url, latency: Duration, cached: bool) {
		self.events.dispatch(ScraperEvent::Completed(CompletedEvent {
			target: target.to_string(),
			latency,
			cached,
			timestamp: Utc::now(),
		}));
	}
}

fn millis(duration: Duration) -> u64 {
	duration.as_millis().min(u128::from(u64::MAX)) as u64
}
