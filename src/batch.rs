//! Batch scheduler: many pipeline runs under one concurrency bound.
//!
//! Concurrency is two-level: at most `width` pipeline runs execute at once,
//! and each run fans out its own renderer calls under its own bound.
//! Admission is greedy: whenever a run finishes, the next queued run starts
//! immediately rather than waiting for a cohort to drain.
//!
//! Run failures are isolated. A run that dies on a sequential role call is
//! recorded as failed and the batch continues.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{error, info};

use crate::gateway::ChatGateway;
use crate::pipeline::{
    cancel_requested, PipelineConfig, PipelineCoordinator, PipelineError, RunIdentity, RunReport,
    TerminalState,
};
use crate::store::RunStore;

/// One requested prompt in a batch, run `trials` times.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    pub category: u32,
    pub item: u32,
    pub prompt: String,
    #[serde(default = "default_trials")]
    pub trials: u32,
}

fn default_trials() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Upper bound on concurrently executing pipeline runs.
    pub width: usize,
    pub pipeline: PipelineConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            width: 5,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// What happened to one scheduled run.
#[derive(Debug)]
pub enum RunOutcome {
    /// The run reached a terminal state (including cancelled mid-run).
    Finished(RunReport),
    /// A sequential role call failed; the run produced no score.
    Failed {
        identity: RunIdentity,
        error: PipelineError,
    },
    /// The cancel flag was set before the run started; nothing was dispatched
    /// and nothing was written for it.
    Skipped { category: u32, item: u32, trial: u32 },
}

/// Aggregate tallies over a finished batch.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub completed: usize,
    pub incomplete: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outcomes: Vec<RunOutcome>,
}

pub struct BatchRunner {
    gateway: Arc<dyn ChatGateway>,
    config: BatchConfig,
    store: RunStore,
}

impl BatchRunner {
    pub fn new(gateway: Arc<dyn ChatGateway>, config: BatchConfig, store: RunStore) -> Self {
        Self {
            gateway,
            config,
            store,
        }
    }

    /// Run every trial of every item to completion (or cancellation).
    ///
    /// The cancel flag is re-checked as each queued run comes up for
    /// admission; runs already in flight finish their current round and
    /// stop at the next boundary.
    pub async fn run(&self, items: &[BatchItem], cancel: Option<&AtomicBool>) -> BatchSummary {
        let jobs: Vec<(u32, u32, u32, &str)> = items
            .iter()
            .flat_map(|it| {
                (1..=it.trials).map(move |trial| (it.category, it.item, trial, it.prompt.as_str()))
            })
            .collect();

        let width = self.config.width.max(1);
        info!(runs = jobs.len(), width, "starting batch");

        let outcomes: Vec<RunOutcome> = stream::iter(jobs.into_iter().map(
            |(category, item, trial, prompt)| async move {
                if cancel_requested(cancel) {
                    info!(category, item, trial, "cancel requested; run not started");
                    return RunOutcome::Skipped {
                        category,
                        item,
                        trial,
                    };
                }

                let identity = RunIdentity::new(category, item, trial);
                let coordinator = PipelineCoordinator::new(
                    self.gateway.clone(),
                    self.config.pipeline.clone(),
                    self.store.clone(),
                    identity.clone(),
                );
                match coordinator.run(prompt, cancel).await {
                    Ok(report) => RunOutcome::Finished(report),
                    Err(error) => {
                        error!(run = %identity, error = %error, "run failed");
                        RunOutcome::Failed { identity, error }
                    }
                }
            },
        ))
        .buffer_unordered(width)
        .collect()
        .await;

        let mut summary = BatchSummary::default();
        for outcome in &outcomes {
            match outcome {
                RunOutcome::Finished(report) => match report.state {
                    TerminalState::Complete => summary.completed += 1,
                    TerminalState::IncompleteAfterBudget => summary.incomplete += 1,
                    TerminalState::Cancelled => summary.cancelled += 1,
                },
                RunOutcome::Failed { .. } => summary.failed += 1,
                RunOutcome::Skipped { .. } => summary.skipped += 1,
            }
        }
        info!(
            completed = summary.completed,
            incomplete = summary.incomplete,
            cancelled = summary.cancelled,
            failed = summary.failed,
            skipped = summary.skipped,
            "batch finished"
        );
        summary.outcomes = outcomes;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChatRequest, ChatResponse, FinishReason, ProviderError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn reply(content: impl Into<String>) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            input_tokens: 10,
            output_tokens: 10,
            latency: Duration::from_millis(1),
            finish_reason: FinishReason::Stop,
        }
    }

    const COMPLETE_PART: &str = "<part id=\"P1\">\n<measure number=\"1\"/>\n</part>\n</score-partwise>";

    /// Single-segment happy-path backend that tracks gateway concurrency.
    struct CountingGateway {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        fail_first_organizer: AtomicBool,
        set_on_refiner: Option<Arc<AtomicBool>>,
    }

    impl CountingGateway {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail_first_organizer: AtomicBool::new(false),
                set_on_refiner: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl ChatGateway for CountingGateway {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match req.attribution.caller {
                "refiner" => {
                    if let Some(flag) = &self.set_on_refiner {
                        flag.store(true, Ordering::SeqCst);
                    }
                    Ok(reply("refined"))
                }
                "organizer" => {
                    if self.fail_first_organizer.swap(false, Ordering::SeqCst) {
                        Err(ProviderError::provider("openai", "injected", true))
                    } else {
                        Ok(reply("*Only Part piano"))
                    }
                }
                "renderer" => Ok(reply(COMPLETE_PART)),
                other => panic!("unexpected caller {other}"),
            }
        }
    }

    fn items(n: u32, trials: u32) -> Vec<BatchItem> {
        (1..=n)
            .map(|i| BatchItem {
                category: 1,
                item: i,
                prompt: format!("prompt {i}"),
                trials,
            })
            .collect()
    }

    fn runner(gateway: Arc<dyn ChatGateway>, dir: &std::path::Path, width: usize) -> BatchRunner {
        let store = RunStore::create(dir).unwrap();
        BatchRunner::new(
            gateway,
            BatchConfig {
                width,
                pipeline: PipelineConfig {
                    skip_planner: true,
                    ..PipelineConfig::default()
                },
            },
            store,
        )
    }

    #[tokio::test]
    async fn width_bounds_concurrent_runs() {
        let gateway = Arc::new(CountingGateway::new());
        let dir = tempfile::tempdir().unwrap();
        let summary = runner(gateway.clone(), dir.path(), 2)
            .run(&items(6, 1), None)
            .await;

        assert_eq!(summary.completed, 6);
        assert_eq!(summary.failed + summary.skipped + summary.cancelled, 0);
        // Each run makes one gateway call at a time, so gateway concurrency
        // equals run concurrency here.
        assert!(
            gateway.max_in_flight.load(Ordering::SeqCst) <= 2,
            "observed {} concurrent calls",
            gateway.max_in_flight.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn trials_expand_to_distinct_runs() {
        let gateway = Arc::new(CountingGateway::new());
        let dir = tempfile::tempdir().unwrap();
        let summary = runner(gateway.clone(), dir.path(), 3)
            .run(
                &[BatchItem {
                    category: 2,
                    item: 7,
                    prompt: "prompt".into(),
                    trials: 3,
                }],
                None,
            )
            .await;

        assert_eq!(summary.completed, 3);
        let mut trials: Vec<u32> = summary
            .outcomes
            .iter()
            .map(|o| match o {
                RunOutcome::Finished(report) => report.identity.trial,
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect();
        trials.sort_unstable();
        assert_eq!(trials, vec![1, 2, 3]);
        for trial in 1..=3 {
            assert!(dir
                .path()
                .join(format!("scores/Category2_Prompt7_Trial{trial}.xml"))
                .exists());
        }
    }

    #[tokio::test]
    async fn failed_run_does_not_sink_the_batch() {
        let gateway = Arc::new(CountingGateway::new());
        gateway.fail_first_organizer.store(true, Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();
        // Width 1 keeps ordering deterministic: the first run eats the
        // injected failure, the rest complete.
        let summary = runner(gateway.clone(), dir.path(), 1)
            .run(&items(3, 1), None)
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 2);
        let failed = summary
            .outcomes
            .iter()
            .find_map(|o| match o {
                RunOutcome::Failed { error, .. } => Some(error),
                _ => None,
            })
            .unwrap();
        assert!(matches!(
            failed,
            PipelineError::RoleCall { role: "organizer", .. }
        ));
    }

    #[tokio::test]
    async fn cancel_suppresses_runs_not_yet_started() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut gateway = CountingGateway::new();
        gateway.set_on_refiner = Some(flag.clone());
        let gateway = Arc::new(gateway);
        let dir = tempfile::tempdir().unwrap();

        let summary = runner(gateway.clone(), dir.path(), 1)
            .run(&items(3, 1), Some(flag.as_ref()))
            .await;

        // Run 1 sets the flag on its first call and still finishes its
        // round; runs 2 and 3 are never admitted.
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
        assert!(!dir
            .path()
            .join("scores/Category1_Prompt2_Trial1.xml")
            .exists());
    }
}
