use async_trait::async_trait;
use verdict_protocol::items::EvaluationInput;
use verdict_protocol::items::EvaluatorOutcome;

/// A single evaluation capability: consume one input row, produce one
/// outcome, possibly failing.
///
/// Implementations are external black boxes to the engine (typically a
/// language-model call behind a provider client, or a lexical metric). The
/// engine only cares about the outcome, the rendered error message on
/// failure, and the declared name, which must be stable because outcome
/// order and snapshot echoes are keyed on declaration order.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, input: &EvaluationInput) -> anyhow::Result<EvaluatorOutcome>;
}
