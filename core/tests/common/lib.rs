//! Shared fixtures for the integration suite: canned evaluators with
//! controllable behavior and a recording progress listener.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use verdict_core::Evaluator;
use verdict_core::ProgressListener;
use verdict_protocol::items::EvaluationInput;
use verdict_protocol::items::EvaluatorOutcome;
use verdict_protocol::items::ProcessingStats;
use verdict_protocol::items::Score;
use verdict_protocol::items::TokenCounts;
use verdict_protocol::progress::ProgressEvent;

pub fn rows(candidates: &[&str]) -> Vec<EvaluationInput> {
    candidates
        .iter()
        .map(|candidate| EvaluationInput {
            candidate_text: (*candidate).to_string(),
            ..Default::default()
        })
        .collect()
}

pub fn outcome(evaluator: &str, score: f64) -> EvaluatorOutcome {
    EvaluatorOutcome {
        evaluator: evaluator.to_string(),
        score: Score::Numeric(score),
        feedback: format!("scored {score}"),
        stats: ProcessingStats {
            execution_time_ms: 1,
            tokens: None,
        },
        error: None,
    }
}

/// Deterministic evaluator returning a fixed numeric score. Counts its
/// invocations so tests can assert attempt budgets.
pub struct StaticEvaluator {
    name: String,
    score: f64,
    tokens: Option<TokenCounts>,
    pub calls: AtomicUsize,
}

impl StaticEvaluator {
    pub fn new(name: &str, score: f64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            score,
            tokens: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn with_tokens(name: &str, score: f64, total: i64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            score,
            tokens: Some(TokenCounts {
                input: total / 2,
                output: total - total / 2,
                total,
            }),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for StaticEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, _input: &EvaluationInput) -> anyhow::Result<EvaluatorOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EvaluatorOutcome {
            evaluator: self.name.clone(),
            score: Score::Numeric(self.score),
            feedback: "deterministic".to_string(),
            stats: ProcessingStats {
                execution_time_ms: 1,
                tokens: self.tokens,
            },
            error: None,
        })
    }
}

/// Always fails with the given message.
pub struct FailingEvaluator {
    name: String,
    message: String,
    pub calls: AtomicUsize,
}

impl FailingEvaluator {
    pub fn new(name: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            message: message.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for FailingEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, _input: &EvaluationInput) -> anyhow::Result<EvaluatorOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("{}", self.message)
    }
}

/// Fails the first `failures` calls, then succeeds.
pub struct FlakyEvaluator {
    name: String,
    message: String,
    failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyEvaluator {
    pub fn new(name: &str, message: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            message: message.to_string(),
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for FlakyEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, _input: &EvaluationInput) -> anyhow::Result<EvaluatorOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("{}", self.message);
        }
        Ok(outcome(&self.name, 75.0))
    }
}

/// Holds each call open for a fixed duration while tracking how many calls
/// overlap, so tests can probe the concurrency bound.
pub struct BlockingEvaluator {
    name: String,
    hold_ms: u64,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub entry_order: Mutex<Vec<String>>,
}

impl BlockingEvaluator {
    pub fn new(name: &str, hold_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            hold_ms,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            entry_order: Mutex::new(Vec::new()),
        })
    }

    pub fn max_overlap(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for BlockingEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, input: &EvaluationInput) -> anyhow::Result<EvaluatorOutcome> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.entry_order
            .lock()
            .await
            .push(input.candidate_text.clone());
        tokio::time::sleep(std::time::Duration::from_millis(self.hold_ms)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome(&self.name, 50.0))
    }
}

/// Records the wall-clock admission time of every call.
pub struct StampingEvaluator {
    name: String,
    pub stamps: Mutex<Vec<tokio::time::Instant>>,
}

impl StampingEvaluator {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            stamps: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Evaluator for StampingEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, _input: &EvaluationInput) -> anyhow::Result<EvaluatorOutcome> {
        self.stamps.lock().await.push(tokio::time::Instant::now());
        Ok(outcome(&self.name, 100.0))
    }
}

/// Collects every progress event it receives.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl ProgressListener for RecordingListener {
    async fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().await.push(event.clone());
    }
}

/// A minimal committed-row fixture for tests that drive sinks directly.
pub fn committed_row(index: usize, candidate: &str, outcomes: Vec<EvaluatorOutcome>) -> verdict_protocol::items::RowResult {
    verdict_protocol::items::RowResult {
        id: format!("row-{index}"),
        index,
        input: EvaluationInput {
            candidate_text: candidate.to_string(),
            ..Default::default()
        },
        outcomes,
        combined_score: None,
        completed_at: Utc::now(),
        duration_ms: 1,
        retry_count: 0,
        error: None,
    }
}
