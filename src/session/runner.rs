//! Blocking-aware session runner.
//!
//! Owns one browser session per attempt. Navigation is raced against the
//! blocking observer; a captured pair of data responses is re-checked,
//! followed by a humanizing pause and a full-page scroll, then parsed. Failed
//! attempts leave a best-effort screenshot behind, and the page is closed on
//! every path.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use http::StatusCode;
use serde_json::Value;
use tokio::time::timeout;
use url::Url;

use crate::blocking::{AttemptOutcome, BlockDetector, ProductPayload, TransientCause};
use crate::config::SessionConfig;
use crate::modules::identity::{DescriptorSource, Viewport};
use crate::modules::proxy::Identity;

use super::humanize::{auto_scroll, wander_pointer};
use super::race::{CapturedResponses, ResponseRace};
use super::{NavigateOptions, ObservedResponse, Session, SessionEngine, SessionError};

pub struct SessionRunner {
    engine: Arc<dyn SessionEngine>,
    descriptors: Arc<dyn DescriptorSource>,
    detector: Arc<BlockDetector>,
    config: SessionConfig,
}

impl SessionRunner {
    pub fn new(
        engine: Arc<dyn SessionEngine>,
        descriptors: Arc<dyn DescriptorSource>,
        config: SessionConfig,
    ) -> Result<Self, regex::Error> {
        let detector = Arc::new(BlockDetector::new(&config.endpoints)?);
        Ok(Self {
            engine,
            descriptors,
            detector,
            config,
        })
    }

    /// Runs one attempt against `url` through `identity` (proxyless when `None`).
    pub async fn run(&self, url: &Url, identity: Option<&Identity>) -> AttemptOutcome {
        let descriptor = self.descriptors.next_descriptor();
        let session = match self.engine.create_session(identity, &descriptor).await {
            Ok(session) => session,
            Err(err) => {
                log::error!("could not open session via {}: {err}", proxy_label(identity));
                return AttemptOutcome::transient(TransientCause::SessionUnavailable, err.to_string());
            }
        };

        let outcome = self.drive(session.as_ref(), url, descriptor.viewport).await;

        if let Some(tag) = outcome.tag() {
            self.capture_diagnostics(session.as_ref(), tag).await;
        }

        if let Err(err) = session.close().await {
            log::warn!("failed to close session for {url}: {err}");
        }

        outcome
    }

    async fn drive(&self, session: &dyn Session, url: &Url, viewport: Viewport) -> AttemptOutcome {
        let race = ResponseRace::arm(session, self.detector.clone(), &self.config.endpoints);
        let navigation = self.navigate(session, url, viewport);
        let captured = match race.settle(navigation, self.config.response_timeout).await {
            Ok(captured) => captured,
            Err(outcome) => return outcome,
        };

        match self.finish(session, captured).await {
            Ok(payload) => AttemptOutcome::Success(payload),
            Err(outcome) => outcome,
        }
    }

    async fn navigate(
        &self,
        session: &dyn Session,
        url: &Url,
        viewport: Viewport,
    ) -> Result<(), AttemptOutcome> {
        self.config.pre_navigation_delay.pause().await;
        if let Err(err) = wander_pointer(session, viewport).await {
            log::debug!("pointer movement failed: {err}");
        }

        let options = NavigateOptions {
            timeout: self.config.navigation_timeout,
            wait_until: self.config.wait_until,
        };

        match timeout(options.timeout, session.navigate(url, &options)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(navigation_failure(err)),
            Err(_) => Err(navigation_failure(SessionError::Timeout(options.timeout))),
        }
    }

    async fn finish(
        &self,
        session: &dyn Session,
        captured: CapturedResponses,
    ) -> Result<ProductPayload, AttemptOutcome> {
        ensure_ok(&captured.detail, "product detail")?;
        ensure_ok(&captured.benefits, "benefits")?;

        self.config.post_capture_delay.pause().await;
        auto_scroll(session, &self.config.scroll).await.map_err(|err| {
            AttemptOutcome::transient(TransientCause::Unknown, format!("auto-scroll failed: {err}"))
        })?;

        Ok(ProductPayload {
            product_detail: parse_payload(&captured.detail.body, "product detail")?,
            benefits: parse_payload(&captured.benefits.body, "benefits")?,
        })
    }

    async fn capture_diagnostics(&self, session: &dyn Session, tag: &str) {
        let Some(dir) = self.config.screenshot_dir.as_ref() else {
            return;
        };

        let idle = self.config.network_idle_timeout;
        match timeout(idle, session.wait_for_network_idle(idle)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::debug!("network did not settle before screenshot: {err}"),
            Err(_) => log::debug!("network did not settle within {idle:?} before screenshot"),
        }

        let path = dir.join(format!(
            "failure-{tag}-{}.png",
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        match session.screenshot(&path).await {
            Ok(()) => log::info!("saved failure screenshot to {}", path.display()),
            Err(err) => log::warn!("failed to capture screenshot {}: {err}", path.display()),
        }
    }
}

fn proxy_label(identity: Option<&Identity>) -> String {
    identity
        .map(ToString::to_string)
        .unwrap_or_else(|| "direct connection".into())
}

fn navigation_failure(err: SessionError) -> AttemptOutcome {
    let cause = match err {
        SessionError::Timeout(_) => TransientCause::NetworkTimeout,
        SessionError::Unavailable(_) => TransientCause::SessionUnavailable,
        SessionError::Navigation(_) | SessionError::Other(_) => TransientCause::Unknown,
    };
    AttemptOutcome::transient(cause, err.to_string())
}

// The race only accepts 200s, but a status slipping through must not be
// parsed as data.
fn ensure_ok(response: &ObservedResponse, label: &str) -> Result<(), AttemptOutcome> {
    if response.status == StatusCode::OK {
        return Ok(());
    }
    Err(AttemptOutcome::transient(
        TransientCause::Unknown,
        format!("{label} responded with status {}", response.status.as_u16()),
    ))
}

fn parse_payload(body: &Bytes, label: &str) -> Result<Value, AttemptOutcome> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(AttemptOutcome::transient(
            TransientCause::EmptyPayload,
            format!("{label} response body was empty"),
        ));
    }

    let value: Value = serde_json::from_slice(body).map_err(|err| {
        AttemptOutcome::transient(
            TransientCause::Unknown,
            format!("{label} response is not valid JSON: {err}"),
        )
    })?;

    let empty = match &value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if empty {
        return Err(AttemptOutcome::transient(
            TransientCause::EmptyPayload,
            format!("{label} payload was empty"),
        ));
    }

    Ok(value)
}
