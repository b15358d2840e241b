//! Browser session seam.
//!
//! The browser engine itself (navigation, rendering, stealth patches) lives
//! outside this crate. It is consumed through [`SessionEngine`] and
//! [`Session`]: open a page, observe the responses it loads, nudge it like a
//! human would, take a screenshot, close it.

pub mod humanize;
mod race;
pub mod runner;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::modules::identity::IdentityDescriptor;
use crate::modules::proxy::Identity;

pub use runner::SessionRunner;

/// Handle returned by [`Session::on_response`] used to detach the listener.
pub type ListenerId = u64;

/// Callback invoked for every response the page loads.
pub type ResponseListener = Arc<dyn Fn(&ObservedResponse) + Send + Sync>;

/// A network response observed by the page.
#[derive(Debug, Clone)]
pub struct ObservedResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Lifecycle milestone navigation waits for before resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUntil {
    DomContentLoaded,
    Load,
    NetworkIdle,
}

#[derive(Debug, Clone)]
pub struct NavigateOptions {
    pub timeout: Duration,
    pub wait_until: WaitUntil,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("navigation timed out after {0:?}")]
    Timeout(Duration),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("session engine unavailable: {0}")]
    Unavailable(String),
    #[error("session error: {0}")]
    Other(String),
}

/// Factory for browser sessions. One session per attempt.
#[async_trait]
pub trait SessionEngine: Send + Sync {
    async fn create_session(
        &self,
        identity: Option<&Identity>,
        descriptor: &IdentityDescriptor,
    ) -> Result<Box<dyn Session>, SessionError>;
}

/// A single page lifecycle, from creation to close.
#[async_trait]
pub trait Session: Send + Sync {
    async fn navigate(&self, url: &Url, options: &NavigateOptions) -> Result<(), SessionError>;

    fn on_response(&self, listener: ResponseListener) -> ListenerId;

    fn off_response(&self, id: ListenerId);

    async fn move_pointer(&self, x: f64, y: f64) -> Result<(), SessionError>;

    /// Current scrollable height of the document in pixels.
    async fn scroll_height(&self) -> Result<u64, SessionError>;

    async fn scroll_by(&self, pixels: u64) -> Result<(), SessionError>;

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), SessionError>;

    async fn screenshot(&self, path: &Path) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}
