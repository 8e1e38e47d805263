//! Cumulative batch counters, derived throughput statistics, and rate-limited
//! progress emission.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use verdict_protocol::config::CostSettings;
use verdict_protocol::progress::ProgressEvent;
use verdict_protocol::progress::ProgressEventKind;

use crate::config::ProgressListener;

/// Rolling window used for the average-row-time estimate. Bounding it keeps
/// the estimate responsive on long batches and the memory footprint fixed.
const ROLLING_WINDOW_SAMPLES: usize = 1_000;

struct TrackerInner {
    processed: usize,
    successful: usize,
    failed: usize,
    durations_ms: VecDeque<u64>,
    total_tokens: i64,
    last_emit: Option<Instant>,
}

/// Maintains the batch counters and emits [`ProgressEvent`]s to the optional
/// listener: non-forced events at most once per interval, lifecycle events
/// (started, completed, retry) always.
///
/// Every emission reads the counters under one short critical section; the
/// listener is awaited outside it.
pub struct ProgressTracker {
    total_rows: usize,
    interval: Duration,
    listener: Option<Arc<dyn ProgressListener>>,
    cost: Option<CostSettings>,
    inner: Mutex<TrackerInner>,
}

impl ProgressTracker {
    pub fn new(
        total_rows: usize,
        interval: Duration,
        listener: Option<Arc<dyn ProgressListener>>,
        cost: Option<CostSettings>,
    ) -> Self {
        Self {
            total_rows,
            interval,
            listener,
            cost,
            inner: Mutex::new(TrackerInner {
                processed: 0,
                successful: 0,
                failed: 0,
                durations_ms: VecDeque::new(),
                total_tokens: 0,
                last_emit: None,
            }),
        }
    }

    /// Records the epoch and emits a `started` event immediately.
    pub async fn start(&self) {
        let event = {
            let mut inner = self.inner.lock().await;
            self.force_event(&mut inner, ProgressEventKind::Started, None, None, None)
        };
        self.deliver(event).await;
    }

    pub async fn record_success(&self, duration_ms: u64, tokens: Option<i64>, index: usize) {
        let event = {
            let mut inner = self.inner.lock().await;
            inner.processed += 1;
            inner.successful += 1;
            if inner.durations_ms.len() == ROLLING_WINDOW_SAMPLES {
                inner.durations_ms.pop_front();
            }
            inner.durations_ms.push_back(duration_ms);
            if let Some(tokens) = tokens {
                inner.total_tokens += tokens;
            }
            self.maybe_event(
                &mut inner,
                ProgressEventKind::Progress,
                Some(index),
                None,
                None,
            )
        };
        if let Some(event) = event {
            self.deliver(event).await;
        }
    }

    pub async fn record_failure(&self, duration_ms: u64, error: &str, index: usize) {
        let event = {
            let mut inner = self.inner.lock().await;
            inner.processed += 1;
            inner.failed += 1;
            if inner.durations_ms.len() == ROLLING_WINDOW_SAMPLES {
                inner.durations_ms.pop_front();
            }
            inner.durations_ms.push_back(duration_ms);
            self.maybe_event(
                &mut inner,
                ProgressEventKind::Error,
                Some(index),
                Some(error.to_string()),
                None,
            )
        };
        if let Some(event) = event {
            self.deliver(event).await;
        }
    }

    /// Retry notices are never rate limited.
    pub async fn record_retry(&self, error: &str, attempt: u32) {
        let event = {
            let mut inner = self.inner.lock().await;
            self.force_event(
                &mut inner,
                ProgressEventKind::Retry,
                None,
                Some(error.to_string()),
                Some(attempt),
            )
        };
        self.deliver(event).await;
    }

    /// Fast-forwards past rows a resume asserts were already done. No
    /// duration samples are recorded, and the rows count as successful; a
    /// prior run may in fact have failed some of them.
    pub async fn skip_rows(&self, count: usize) {
        let mut inner = self.inner.lock().await;
        inner.processed += count;
        inner.successful += count;
    }

    /// Emits a final `completed` event immediately.
    pub async fn complete(&self) {
        let event = {
            let mut inner = self.inner.lock().await;
            self.force_event(&mut inner, ProgressEventKind::Completed, None, None, None)
        };
        self.deliver(event).await;
    }

    /// Reads the latest derived event without emitting it.
    pub async fn current(&self) -> ProgressEvent {
        let inner = self.inner.lock().await;
        self.build_event(&inner, ProgressEventKind::Progress, None, None, None)
    }

    fn maybe_event(
        &self,
        inner: &mut TrackerInner,
        kind: ProgressEventKind,
        current_index: Option<usize>,
        current_error: Option<String>,
        retry_count: Option<u32>,
    ) -> Option<ProgressEvent> {
        let now = Instant::now();
        if inner
            .last_emit
            .is_some_and(|last| now.duration_since(last) < self.interval)
        {
            return None;
        }
        inner.last_emit = Some(now);
        Some(self.build_event(inner, kind, current_index, current_error, retry_count))
    }

    fn force_event(
        &self,
        inner: &mut TrackerInner,
        kind: ProgressEventKind,
        current_index: Option<usize>,
        current_error: Option<String>,
        retry_count: Option<u32>,
    ) -> ProgressEvent {
        inner.last_emit = Some(Instant::now());
        self.build_event(inner, kind, current_index, current_error, retry_count)
    }

    fn build_event(
        &self,
        inner: &TrackerInner,
        kind: ProgressEventKind,
        current_index: Option<usize>,
        current_error: Option<String>,
        retry_count: Option<u32>,
    ) -> ProgressEvent {
        let average_row_time_ms = if inner.durations_ms.is_empty() {
            None
        } else {
            let sum: u64 = inner.durations_ms.iter().sum();
            Some(sum as f64 / inner.durations_ms.len() as f64)
        };
        let remaining = self.total_rows.saturating_sub(inner.processed);
        let estimated_remaining_ms = match average_row_time_ms {
            Some(avg) if avg > 0.0 && remaining > 0 => Some((remaining as f64 * avg) as u64),
            _ => None,
        };
        let percent_complete = if self.total_rows == 0 {
            0.0
        } else {
            inner.processed as f64 / self.total_rows as f64 * 100.0
        };
        let estimated_cost_usd = self.cost.as_ref().and_then(|cost| {
            (inner.total_tokens > 0)
                .then(|| inner.total_tokens as f64 / 1_000_000.0 * cost.price_per_million_tokens)
        });
        let estimated_tokens_remaining = self
            .cost
            .as_ref()
            .map(|cost| remaining as i64 * cost.tokens_per_row as i64);

        ProgressEvent {
            kind,
            timestamp: Utc::now(),
            total_rows: self.total_rows,
            processed_rows: inner.processed,
            successful_rows: inner.successful,
            failed_rows: inner.failed,
            current_index,
            percent_complete,
            estimated_remaining_ms,
            average_row_time_ms,
            current_error,
            retry_count,
            estimated_cost_usd,
            estimated_tokens_remaining,
        }
    }

    async fn deliver(&self, event: ProgressEvent) {
        if let Some(listener) = &self.listener {
            listener.on_progress(&event).await;
        }
    }
}
