#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use core_test_support::RecordingListener;
use core_test_support::StaticEvaluator;
use core_test_support::rows;
use pretty_assertions::assert_eq;
use verdict_core::BatchRunner;
use verdict_core::Evaluator;
use verdict_core::EvaluationOptions;
use verdict_core::load_state;
use verdict_protocol::config::InputConfig;
use verdict_protocol::items::Score;
use verdict_protocol::progress::ProgressEventKind;

#[tokio::test]
async fn start_index_skips_the_prefix() {
    let evaluator = StaticEvaluator::new("accuracy", 90.0);
    let listener = RecordingListener::new();
    let options = EvaluationOptions {
        on_progress: Some(listener.clone()),
        progress_interval_ms: 0,
        ..Default::default()
    };
    let runner = BatchRunner::new(vec![evaluator.clone() as Arc<dyn Evaluator>], options);

    let mut input = InputConfig::inline(rows(&["a", "b", "c", "d", "e"]));
    input.start_index = 2;
    let batch = runner.evaluate(input).await.unwrap();

    assert_eq!(evaluator.call_count(), 3);
    let mut indices: Vec<usize> = batch.results.iter().map(|row| row.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![2, 3, 4]);

    // Progress counts start past the skipped prefix and grow per completion.
    let mut processed: Vec<usize> = listener
        .events()
        .await
        .iter()
        .filter(|event| event.kind == ProgressEventKind::Progress)
        .map(|event| event.processed_rows)
        .collect();
    processed.sort_unstable();
    assert_eq!(processed, vec![3, 4, 5]);
}

#[tokio::test]
async fn resume_from_state_completes_the_remaining_rows() {
    let all_rows = rows(&["a", "b", "c", "d", "e"]);

    // First run covers a prefix of the input.
    let prefix_runner = BatchRunner::new(
        vec![StaticEvaluator::new("accuracy", 90.0) as Arc<dyn Evaluator>],
        EvaluationOptions {
            save_state_interval_ms: Some(60_000),
            ..Default::default()
        },
    );
    prefix_runner
        .evaluate(InputConfig::inline(all_rows[..3].to_vec()))
        .await
        .unwrap();
    let snapshot = prefix_runner.state().await.unwrap();
    assert_eq!(snapshot.processed_rows.len(), 3);

    // Second run resumes over the full input.
    let evaluator = StaticEvaluator::new("accuracy", 90.0);
    let resumed_runner = BatchRunner::new(
        vec![evaluator.clone() as Arc<dyn Evaluator>],
        EvaluationOptions {
            resume_from: Some(snapshot.clone()),
            ..Default::default()
        },
    );
    let batch = resumed_runner
        .evaluate(InputConfig::inline(all_rows.clone()))
        .await
        .unwrap();

    // Only the unprocessed suffix was evaluated.
    assert_eq!(evaluator.call_count(), 2);
    assert_eq!(batch.batch_id, snapshot.batch_id);
    assert_eq!(batch.total_rows, 5);

    // The combined result set matches a single full run.
    let full_runner = BatchRunner::new(
        vec![StaticEvaluator::new("accuracy", 90.0) as Arc<dyn Evaluator>],
        EvaluationOptions::default(),
    );
    let full = full_runner
        .evaluate(InputConfig::inline(all_rows))
        .await
        .unwrap();
    let key = |batch: &verdict_protocol::items::BatchResult| {
        let mut keys: Vec<(usize, String, Vec<Score>)> = batch
            .results
            .iter()
            .map(|row| {
                (
                    row.index,
                    row.id.clone(),
                    row.outcomes
                        .iter()
                        .map(|outcome| outcome.score.clone())
                        .collect(),
                )
            })
            .collect();
        keys.sort_by_key(|(index, _, _)| *index);
        keys
    };
    assert_eq!(key(&batch), key(&full));
}

#[tokio::test]
async fn state_file_is_written_and_loadable() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let runner = BatchRunner::new(
        vec![StaticEvaluator::new("accuracy", 90.0) as Arc<dyn Evaluator>],
        EvaluationOptions {
            state_path: Some(state_path.clone()),
            ..Default::default()
        },
    );

    let batch = runner
        .evaluate(InputConfig::inline(rows(&["a", "b"])))
        .await
        .unwrap();

    let state = load_state(&state_path).await.unwrap();
    assert_eq!(state.batch_id, batch.batch_id);
    assert_eq!(state.total_rows, 2);
    assert_eq!(state.processed_rows.len(), 2);
    assert_eq!(state.results.len(), 2);
    assert_eq!(state.evaluators, vec!["accuracy".to_string()]);
}

#[tokio::test]
async fn resumed_rows_are_not_re_exported() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("stream.csv");
    let all_rows = rows(&["a", "b", "c"]);

    let prefix_runner = BatchRunner::new(
        vec![StaticEvaluator::new("accuracy", 90.0) as Arc<dyn Evaluator>],
        EvaluationOptions {
            save_state_interval_ms: Some(60_000),
            ..Default::default()
        },
    );
    prefix_runner
        .evaluate(InputConfig::inline(all_rows[..2].to_vec()))
        .await
        .unwrap();
    let snapshot = prefix_runner.state().await.unwrap();

    let resumed_runner = BatchRunner::new(
        vec![StaticEvaluator::new("accuracy", 90.0) as Arc<dyn Evaluator>],
        EvaluationOptions {
            resume_from: Some(snapshot),
            stream_export: Some(verdict_core::ExportOptions::new(
                verdict_protocol::config::ExportSettings::csv(&csv_path),
            )),
            ..Default::default()
        },
    );
    resumed_runner
        .evaluate(InputConfig::inline(all_rows))
        .await
        .unwrap();

    // Only the one new row hit the stream.
    let content = tokio::fs::read_to_string(&csv_path).await.unwrap();
    assert_eq!(content.lines().count(), 2);
    assert!(content.contains("row-2,"));
}

#[tokio::test]
async fn state_save_hook_sees_every_save() {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct Counting {
        saves: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl verdict_core::StateSaveHook for Counting {
        async fn on_state_save(
            &self,
            _state: &verdict_protocol::state::BatchState,
        ) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let hook = Arc::new(Counting {
        saves: AtomicUsize::new(0),
    });
    let runner = BatchRunner::new(
        vec![StaticEvaluator::new("accuracy", 90.0) as Arc<dyn Evaluator>],
        EvaluationOptions {
            on_state_save: Some(hook.clone()),
            ..Default::default()
        },
    );
    runner
        .evaluate(InputConfig::inline(rows(&["a"])))
        .await
        .unwrap();

    // At least the final shutdown save.
    assert!(hook.saves.load(Ordering::SeqCst) >= 1);
}
