//! Blocking-vs-success response race.
//!
//! Two listeners are attached to the page before navigation starts: one
//! watches every response for blocking signals, the other waits for the two
//! data endpoints. The first side to settle wins and both listeners are
//! detached before the result is returned, or when the race is dropped.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::blocking::{AttemptOutcome, BlockDetector, BlockReason, TransientCause};
use crate::config::EndpointConfig;

use super::{ListenerId, ObservedResponse, Session};

/// Both data responses, captured with status 200.
#[derive(Debug)]
pub(crate) struct CapturedResponses {
    pub detail: ObservedResponse,
    pub benefits: ObservedResponse,
}

type Slot<T> = Arc<Mutex<Option<oneshot::Sender<T>>>>;

fn slot<T>() -> (Slot<T>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

/// Resolves the slot at most once; later calls are no-ops.
fn fire<T>(slot: &Slot<T>, value: T) -> bool {
    let sender = slot.lock().ok().and_then(|mut guard| guard.take());
    match sender {
        Some(tx) => tx.send(value).is_ok(),
        None => false,
    }
}

/// Detaches listeners on drop so no handler outlives its attempt.
struct ListenerGuard<'a> {
    session: &'a dyn Session,
    ids: Vec<ListenerId>,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            self.session.off_response(id);
        }
    }
}

pub(crate) struct ResponseRace<'a> {
    guard: ListenerGuard<'a>,
    blocked_rx: oneshot::Receiver<BlockReason>,
    detail_rx: oneshot::Receiver<ObservedResponse>,
    benefits_rx: oneshot::Receiver<ObservedResponse>,
}

impl<'a> ResponseRace<'a> {
    /// Attaches both observers to `session`.
    pub(crate) fn arm(
        session: &'a dyn Session,
        detector: Arc<BlockDetector>,
        endpoints: &EndpointConfig,
    ) -> Self {
        let (blocked_slot, blocked_rx) = slot::<BlockReason>();
        let blocking_id = session.on_response(Arc::new(move |response: &ObservedResponse| {
            if let Some(reason) = detector.classify(response)
                && fire(&blocked_slot, reason)
            {
                log::warn!(
                    "blocking signal {reason} from {} (status {})",
                    response.url,
                    response.status.as_u16()
                );
            }
        }));

        let (detail_slot, detail_rx) = slot::<ObservedResponse>();
        let (benefits_slot, benefits_rx) = slot::<ObservedResponse>();
        let detail_pattern = endpoints.product_detail.clone();
        let benefits_pattern = endpoints.benefits.clone();
        let success_id = session.on_response(Arc::new(move |response: &ObservedResponse| {
            if response.status != StatusCode::OK {
                return;
            }
            let url = response.url.as_str();
            if url.contains(detail_pattern.as_str()) && fire(&detail_slot, response.clone()) {
                log::debug!("captured product detail response from {url}");
            } else if url.contains(benefits_pattern.as_str())
                && fire(&benefits_slot, response.clone())
            {
                log::debug!("captured benefits response from {url}");
            }
        }));

        Self {
            guard: ListenerGuard {
                session,
                ids: vec![blocking_id, success_id],
            },
            blocked_rx,
            detail_rx,
            benefits_rx,
        }
    }

    /// Drives `navigation` while waiting for either a blocking signal or
    /// both data responses, each bounded by `response_timeout`.
    pub(crate) async fn settle<N>(
        self,
        navigation: N,
        response_timeout: Duration,
    ) -> Result<CapturedResponses, AttemptOutcome>
    where
        N: Future<Output = Result<(), AttemptOutcome>>,
    {
        let ResponseRace {
            guard,
            mut blocked_rx,
            detail_rx,
            benefits_rx,
        } = self;

        let captured = async {
            tokio::try_join!(
                await_response(detail_rx, response_timeout, "product detail"),
                await_response(benefits_rx, response_timeout, "benefits"),
                navigation,
            )
        };

        let result = tokio::select! {
            biased;
            Ok(reason) = &mut blocked_rx => Err(AttemptOutcome::Blocked(reason)),
            captured = captured => {
                // A blocking signal may have landed on the same poll.
                match blocked_rx.try_recv() {
                    Ok(reason) => Err(AttemptOutcome::Blocked(reason)),
                    Err(_) => captured.map(|(detail, benefits, ())| CapturedResponses { detail, benefits }),
                }
            }
        };

        drop(guard);
        result
    }
}

async fn await_response(
    rx: oneshot::Receiver<ObservedResponse>,
    limit: Duration,
    label: &str,
) -> Result<ObservedResponse, AttemptOutcome> {
    match timeout(limit, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(AttemptOutcome::transient(
            TransientCause::Unknown,
            format!("{label} listener was dropped before a response arrived"),
        )),
        Err(_) => Err(AttemptOutcome::transient(
            TransientCause::NetworkTimeout,
            format!("timed out after {:.0}s waiting for {label} response", limit.as_secs_f64()),
        )),
    }
}
