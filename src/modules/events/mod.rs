//! Event system for the fetch pipeline.
//!
//! Provides hooks for logging and custom reactions around cache lookups,
//! attempts, blocking signals, retries, and final results.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::blocking::BlockReason;

#[derive(Debug, Clone)]
pub struct CacheHitEvent {
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub target: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BlockedEvent {
    pub target: String,
    pub reason: BlockReason,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub target: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompletedEvent {
    pub target: String,
    pub latency: Duration,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub target: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ScraperEvent {
    CacheHit(CacheHitEvent),
    Attempt(AttemptEvent),
    Blocked(BlockedEvent),
    Retry(RetryEvent),
    Completed(CompletedEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ScraperEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: ScraperEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ScraperEvent) {
        match event {
            ScraperEvent::CacheHit(hit) => {
                log::debug!("cache hit key={}", hit.key);
            }
            ScraperEvent::Attempt(attempt) => {
                log::info!(
                    "attempt {}/{} target={} proxy={}",
                    attempt.attempt,
                    attempt.max_attempts,
                    attempt.target,
                    attempt.proxy.as_deref().unwrap_or("none")
                );
            }
            ScraperEvent::Blocked(blocked) => {
                log::warn!(
                    "blocked target={} reason={} proxy={}",
                    blocked.target,
                    blocked.reason,
                    blocked.proxy.as_deref().unwrap_or("none")
                );
            }
            ScraperEvent::Retry(retry) => {
                log::info!(
                    "retry target={} attempt={} reason={} after {:.2}s",
                    retry.target,
                    retry.attempt,
                    retry.reason,
                    retry.scheduled_after.as_secs_f64()
                );
            }
            ScraperEvent::Completed(done) => {
                log::info!(
                    "fetched target={} cached={} ({:.2}s)",
                    done.target,
                    done.cached,
                    done.latency.as_secs_f64()
                );
            }
            ScraperEvent::Error(error) => {
                log::error!("failed target={} -> {}", error.target, error.error);
            }
        }
    }
}
