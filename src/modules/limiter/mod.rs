//! Global admission control.
//!
//! Two constraints apply at once: at most `max_concurrent` tasks running, and
//! at most `reservoir` task starts per refill interval. The reservoir is
//! topped back up to its full size on every interval boundary counted from
//! construction, regardless of when tokens were spent. Waiters are admitted
//! strictly in arrival order.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit, watch};
use tokio::time::{Instant, sleep_until};

use crate::config::duration_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub max_concurrent: usize,
    pub reservoir: u32,
    #[serde(with = "duration_ms")]
    pub refill_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            reservoir: 10,
            refill_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("admission limiter is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub queued: usize,
    pub running: usize,
    pub tokens_remaining: u32,
}

#[derive(Debug)]
struct Reservoir {
    capacity: u32,
    interval: Duration,
    epoch: Instant,
    tick: u64,
    tokens: u32,
}

impl Reservoir {
    fn new(capacity: u32, interval: Duration) -> Self {
        Self {
            capacity,
            interval: interval.max(Duration::from_millis(1)),
            epoch: Instant::now(),
            tick: 0,
            tokens: capacity,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.epoch).as_nanos();
        let tick = (elapsed / self.interval.as_nanos()) as u64;
        if tick > self.tick {
            self.tick = tick;
            self.tokens = self.capacity;
        }
    }

    /// Takes a token, or returns the instant of the next refill boundary.
    fn try_take(&mut self, now: Instant) -> Result<(), Instant> {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            return Ok(());
        }
        let next = self.tick.saturating_add(1).min(u64::from(u32::MAX)) as u32;
        Err(self.epoch + self.interval * next)
    }
}

/// One unit of a gauge, held until dropped.
struct Counted<'a>(&'a AtomicUsize);

impl<'a> Counted<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for Counted<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// FIFO admission gate combining a concurrency cap with a refillable reservoir.
#[derive(Debug)]
pub struct AdmissionLimiter {
    turn: tokio::sync::Mutex<()>,
    slots: Semaphore,
    reservoir: Mutex<Reservoir>,
    shutdown: watch::Sender<bool>,
    queued: AtomicUsize,
    running: AtomicUsize,
}

impl AdmissionLimiter {
    pub fn new(config: &LimiterConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            turn: tokio::sync::Mutex::new(()),
            slots: Semaphore::new(config.max_concurrent.max(1)),
            reservoir: Mutex::new(Reservoir::new(config.reservoir.max(1), config.refill_interval)),
            shutdown,
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
        }
    }

    /// Waits for admission, then runs `task` to completion.
    pub async fn schedule<F, Fut>(&self, task: F) -> Result<Fut::Output, AdmissionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let permit = {
            let _queued = Counted::enter(&self.queued);
            self.admit().await?
        };

        let running = Counted::enter(&self.running);
        let output = task().await;
        drop(running);
        drop(permit);
        Ok(output)
    }

    /// Fails every queued and future `schedule` call. Running tasks finish.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        self.slots.close();
        log::info!("admission limiter closed");
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let tokens_remaining = {
            let mut reservoir = self.reservoir.lock().expect("reservoir lock poisoned");
            reservoir.refill(Instant::now());
            reservoir.tokens
        };
        AdmissionSnapshot {
            queued: self.queued.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            tokens_remaining,
        }
    }

    async fn admit(&self) -> Result<SemaphorePermit<'_>, AdmissionError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(AdmissionError::Closed);
        }
        let closed = async move {
            let _ = shutdown.wait_for(|closed| *closed).await;
        };
        tokio::pin!(closed);

        // Held until this caller is admitted, so later arrivals queue behind it.
        let _turn = tokio::select! {
            _ = &mut closed => return Err(AdmissionError::Closed),
            turn = self.turn.lock() => turn,
        };

        let permit = tokio::select! {
            _ = &mut closed => return Err(AdmissionError::Closed),
            permit = self.slots.acquire() => permit.map_err(|_| AdmissionError::Closed)?,
        };

        loop {
            let next_refill = match self
                .reservoir
                .lock()
                .expect("reservoir lock poisoned")
                .try_take(Instant::now())
            {
                Ok(()) => break,
                Err(next_refill) => next_refill,
            };

            log::debug!(
                "reservoir empty, waiting {:.2}s for refill",
                next_refill.saturating_duration_since(Instant::now()).as_secs_f64()
            );
            tokio::select! {
                _ = &mut closed => return Err(AdmissionError::Closed),
                _ = sleep_until(next_refill) => {}
            }
        }

        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(max_concurrent: usize, reservoir: u32, refill_secs: u64) -> AdmissionLimiter {
        AdmissionLimiter::new(&LimiterConfig {
            max_concurrent,
            reservoir,
            refill_interval: Duration::from_secs(refill_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn reservoir_admits_r_then_waits_for_refill() {
        let limiter = limiter(4, 2, 1);
        let start = Instant::now();
        let (a, b, c) = tokio::join!(
            limiter.schedule(|| async { Instant::now() }),
            limiter.schedule(|| async { Instant::now() }),
            limiter.schedule(|| async { Instant::now() }),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert!(a.duration_since(start) < Duration::from_secs(1));
        assert!(b.duration_since(start) < Duration::from_secs(1));
        assert!(c.duration_since(start) >= Duration::from_secs(1));
        assert_eq!(limiter.snapshot().tokens_remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_tick_based_not_rolling() {
        let limiter = limiter(1, 1, 10);
        tokio::time::advance(Duration::from_secs(9)).await;
        let first = limiter.schedule(|| async { Instant::now() }).await.unwrap();
        let second = limiter.schedule(|| async { Instant::now() }).await.unwrap();
        // The boundary sits 10s after construction, one second after `first`.
        let gap = second.duration_since(first);
        assert!(gap >= Duration::from_secs(1));
        assert!(gap < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_serializes_in_fifo_order() {
        let limiter = limiter(1, 100, 60);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let peak = Arc::new(AtomicUsize::new(0));

        let run = |id: usize| {
            let order = order.clone();
            let peak = peak.clone();
            let limiter = &limiter;
            async move {
                limiter
                    .schedule(|| async move {
                        let running = limiter.snapshot().running;
                        peak.fetch_max(running, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        order.lock().unwrap().push(id);
                    })
                    .await
                    .unwrap();
            }
        };

        tokio::join!(run(1), run(2), run(3));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_queued_and_future_tasks() {
        let limiter = Arc::new(limiter(1, 10, 60));

        let busy = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .schedule(|| tokio::time::sleep(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.schedule(|| async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.queued, 1);

        limiter.close();
        assert_eq!(queued.await.unwrap(), Err(AdmissionError::Closed));
        assert!(busy.await.unwrap().is_ok());
        assert_eq!(limiter.schedule(|| async {}).await, Err(AdmissionError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_callers_release_their_counts() {
        let limiter = Arc::new(limiter(1, 10, 60));

        let busy = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .schedule(|| tokio::time::sleep(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiting = tokio::time::timeout(
            Duration::from_millis(10),
            limiter.schedule(|| async {}),
        )
        .await;
        assert!(waiting.is_err());
        assert_eq!(limiter.snapshot().queued, 0);

        busy.abort();
        let _ = busy.await;
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.queued, 0);

        // The abandoned slot is free again.
        assert_eq!(limiter.schedule(|| async { 7 }).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reservoir_config_still_admits() {
        let limiter = limiter(1, 0, 60);
        let start = Instant::now();
        let first = limiter.schedule(|| async { Instant::now() }).await.unwrap();
        let second = limiter.schedule(|| async { Instant::now() }).await.unwrap();

        assert!(first.duration_since(start) < Duration::from_secs(1));
        assert!(second.duration_since(start) >= Duration::from_secs(60));
        assert!(second.duration_since(start) < Duration::from_secs(61));
    }
}
