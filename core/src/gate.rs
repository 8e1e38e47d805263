//! Admission control for per-row tasks: a bounded slot pool with FIFO
//! waiters, plus sliding-window request quotas per minute and per hour.
//!
//! Throttling suspends submission only. Once a task is admitted it runs to
//! its own conclusion; there is no cancelled transition for admitted tasks.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing::trace;
use verdict_protocol::config::RateLimitSettings;

/// Small buffer added to rate-limit sleeps so a re-check lands strictly after
/// the oldest admission has slid out of the window.
const WINDOW_SLACK: Duration = Duration::from_millis(100);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3_600);

struct GateInner {
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct RateWindow {
    window: Duration,
    cap: usize,
}

struct RateLimiter {
    windows: Vec<RateWindow>,
    admissions: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    fn new(settings: &RateLimitSettings) -> Self {
        let mut windows = Vec::new();
        if let Some(cap) = settings.max_requests_per_minute
            && cap > 0
        {
            windows.push(RateWindow {
                window: MINUTE,
                cap: cap as usize,
            });
        }
        if let Some(cap) = settings.max_requests_per_hour
            && cap > 0
        {
            windows.push(RateWindow {
                window: HOUR,
                cap: cap as usize,
            });
        }
        Self {
            windows,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    /// Blocks until every configured window has room, then records the
    /// admission timestamp. Timestamps older than one hour are compacted on
    /// the way in to bound memory.
    async fn admit(&self) {
        if self.windows.is_empty() {
            return;
        }
        loop {
            let wait = {
                let mut admissions = self.admissions.lock().await;
                let now = Instant::now();
                while admissions
                    .front()
                    .is_some_and(|stamp| now.duration_since(*stamp) > HOUR)
                {
                    admissions.pop_front();
                }

                let mut wait: Option<Duration> = None;
                for window in &self.windows {
                    let in_window = admissions
                        .iter()
                        .filter(|stamp| now.duration_since(**stamp) <= window.window)
                        .count();
                    if in_window < window.cap {
                        continue;
                    }
                    // Sleep until the oldest admission inside this window
                    // slides out, then re-evaluate from scratch.
                    let oldest = admissions
                        .iter()
                        .find(|stamp| now.duration_since(**stamp) <= window.window);
                    if let Some(oldest) = oldest {
                        let until = window.window.saturating_sub(now.duration_since(*oldest))
                            + WINDOW_SLACK;
                        wait = Some(wait.map_or(until, |other| other.max(until)));
                    }
                }

                match wait {
                    Some(wait) => wait,
                    None => {
                        admissions.push_back(now);
                        return;
                    }
                }
            };
            trace!("rate window full; sleeping {wait:?}");
            sleep(wait).await;
        }
    }
}

/// Bounds simultaneous in-flight tasks and enforces the request quotas.
/// Tasks are opaque: the gate neither inspects nor classifies their output.
pub struct ConcurrencyGate {
    max: usize,
    inner: Mutex<GateInner>,
    limiter: RateLimiter,
}

impl ConcurrencyGate {
    pub fn new(max: usize, rate_limit: &RateLimitSettings) -> Self {
        Self {
            max: max.max(1),
            inner: Mutex::new(GateInner {
                active: 0,
                waiters: VecDeque::new(),
            }),
            limiter: RateLimiter::new(rate_limit),
        }
    }

    /// Acquires a slot, waits for rate-limit compliance, runs `task`, and
    /// releases the slot. The task's output (or failure value) is returned
    /// unchanged; a failing task consumes a slot and a timestamp like any
    /// other.
    pub async fn run<F>(&self, task: F) -> F::Output
    where
        F: Future,
    {
        self.acquire().await;
        self.limiter.admit().await;
        let output = task.await;
        self.release().await;
        output
    }

    /// Number of currently admitted tasks. Exposed for probes.
    pub async fn active(&self) -> usize {
        self.inner.lock().await.active
    }

    async fn acquire(&self) {
        let mut woken = false;
        loop {
            let waiter = {
                let mut inner = self.inner.lock().await;
                if inner.active < self.max {
                    inner.active += 1;
                    return;
                }
                let (tx, rx) = oneshot::channel();
                if woken {
                    // A concurrent release raced ahead and consumed the slot
                    // this waiter was woken for; put it back at the head so
                    // admission stays FIFO.
                    inner.waiters.push_front(tx);
                } else {
                    inner.waiters.push_back(tx);
                }
                rx
            };
            // A dropped sender is treated as a spurious wake: loop and
            // either take the slot or park again.
            let _ = waiter.await;
            woken = true;
        }
    }

    async fn release(&self) {
        let mut inner = self.inner.lock().await;
        inner.active = inner.active.saturating_sub(1);
        // Wake exactly one waiter; skip any whose callers have gone away.
        while let Some(waiter) = inner.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                break;
            }
        }
    }
}
