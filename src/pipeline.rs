//! Pipeline coordinator: one multi-role conversation end-to-end.
//!
//! Wires together:
//! - the sequential role chain (planner → refiner → organizer)
//! - the segment splitter on the organizer's tagged output
//! - bounded-parallel renderer fan-out with a fan-in barrier per round
//! - the document assembler and per-round persistence
//! - bounded continuation rounds for segments that have not closed
//!
//! Each coordinator instance exclusively owns its transcript and its output
//! files; instances never share mutable state, so the batch layer can run
//! many of them concurrently without coordination beyond the cancel flag.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assembler::{assemble, is_score_complete};
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message, ProviderError};
use crate::roles::{RoleConfig, RoleSet};
use crate::splitter::{split_segments, Segment};
use crate::store::{RunStore, StoreError, TranscriptTurn};

// =============================================================================
// Identity and configuration
// =============================================================================

/// Unique name for one coordinator instance. Immutable once the run starts.
///
/// Output file names derive from (category, item, trial) only; the random
/// suffix disambiguates log lines when trials are re-run.
#[derive(Debug, Clone)]
pub struct RunIdentity {
    pub category: u32,
    pub item: u32,
    pub trial: u32,
    pub suffix: u16,
    pub run_id: Uuid,
}

impl RunIdentity {
    pub fn new(category: u32, item: u32, trial: u32) -> Self {
        Self {
            category,
            item,
            trial,
            suffix: rand::thread_rng().gen_range(1000..10_000),
            run_id: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cat{}_Prompt{}_Trial{}_{}",
            self.category, self.item, self.trial, self.suffix
        )
    }
}

/// Coordinator knobs. Defaults mirror production settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub roles: RoleSet,
    /// Maximum fan-out rounds, including the first.
    pub max_iterations: usize,
    /// Upper bound on concurrent renderer calls within one round.
    pub fanout_width: usize,
    /// Use the user request verbatim as the planner output.
    pub skip_planner: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            roles: RoleSet::default(),
            max_iterations: 3,
            fanout_width: 20,
            skip_planner: false,
        }
    }
}

// =============================================================================
// Errors and outcomes
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A sequential role call failed after retry exhaustion. Fatal for the
    /// run; segment-level failures never surface here.
    #[error("{role} call failed: {source}")]
    RoleCall {
        role: &'static str,
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a run ended. All three states are reported, not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Every segment closed and the document terminator is present.
    Complete,
    /// The iteration budget ran out with material still unfinished.
    IncompleteAfterBudget,
    /// The cancel flag was observed at a checkpoint.
    Cancelled,
}

/// Summary of one finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub identity: RunIdentity,
    pub state: TerminalState,
    /// Fan-out rounds executed.
    pub iterations: usize,
    /// Segments discovered by the splitter.
    pub segments: usize,
    /// Last persisted score, if any round completed.
    pub score_path: Option<PathBuf>,
    pub transcript_path: PathBuf,
}

// =============================================================================
// Segment results
// =============================================================================

/// A segment plus its accumulated renderer output.
///
/// Results are keyed by (label, index), not by position or object identity:
/// continuation rounds locate the entry to extend by that key, and merge
/// order is recomputed from indices every round.
#[derive(Debug, Clone)]
pub struct SegmentResult {
    pub segment: Segment,
    pub response: String,
}

impl SegmentResult {
    pub fn new(segment: Segment) -> Self {
        Self {
            segment,
            response: String::new(),
        }
    }

    /// Whether this result refers to the given (label, index) key.
    pub fn matches(&self, label: &str, index: u32) -> bool {
        self.segment.label == label && self.segment.index == index
    }

    /// Append a continuation chunk (or adopt the first response).
    pub fn append(&mut self, text: &str) {
        if self.response.is_empty() {
            self.response = text.to_string();
        } else {
            self.response.push_str("\n\n");
            self.response.push_str(text);
        }
    }

    pub fn is_complete(&self) -> bool {
        crate::assembler::is_part_complete(&self.response)
    }
}

/// Stable merge order over results: ascending index, ties in discovery order.
///
/// Out-of-order concatenation corrupts the score irrecoverably, so every
/// assembly pass goes through this.
pub fn merge_order(results: &[SegmentResult]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by_key(|&i| results[i].segment.index);
    order
}

fn initial_render_prompt(segment: &Segment) -> String {
    format!(
        "Part: {} (ID: P{}) ---\n\n{}\n\nPlease implement this part in proper MusicXML format using part ID P{}.",
        segment.label, segment.index, segment.content, segment.index
    )
}

fn continuation_render_prompt(segment: &Segment, previous: &str) -> String {
    format!(
        "Part: {} (ID: P{}) ---\n\n{}\n\n--- Previous Implementation ---\n\n{}\n\nContinue the existing composition for this part, maintaining part ID P{}.",
        segment.label, segment.index, segment.content, previous, segment.index
    )
}

pub(crate) fn cancel_requested(cancel: Option<&AtomicBool>) -> bool {
    cancel
        .map(|flag| flag.load(AtomicOrdering::Relaxed))
        .unwrap_or(false)
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct PipelineCoordinator {
    gateway: Arc<dyn ChatGateway>,
    config: PipelineConfig,
    store: RunStore,
    identity: RunIdentity,
    transcript: Vec<TranscriptTurn>,
}

impl PipelineCoordinator {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        config: PipelineConfig,
        store: RunStore,
        identity: RunIdentity,
    ) -> Self {
        Self {
            gateway,
            config,
            store,
            identity,
            transcript: Vec::new(),
        }
    }

    /// Run the pipeline to a terminal state.
    ///
    /// The cancel flag is polled at run start and at round boundaries; a
    /// call already in flight is allowed to finish. The assembled score is
    /// persisted after every round, the transcript once at the end.
    pub async fn run(
        mut self,
        prompt: &str,
        cancel: Option<&AtomicBool>,
    ) -> Result<RunReport, PipelineError> {
        let roles = self.config.roles.clone();

        self.transcript
            .push(TranscriptTurn::new("user", prompt));
        info!(run = %self.identity, "starting pipeline run");

        if cancel_requested(cancel) {
            return self.finish(TerminalState::Cancelled, 0, 0, None);
        }

        // Sequential chain: each role sees only its predecessor's output.
        let planner_output = if self.config.skip_planner {
            self.transcript
                .push(TranscriptTurn::new(roles.planner.name, "[planner step skipped]"));
            info!(run = %self.identity, "planner step skipped");
            prompt.to_string()
        } else {
            self.sequential_call(&roles.planner, prompt).await?
        };

        let refiner_output = self.sequential_call(&roles.refiner, &planner_output).await?;
        let organizer_output = self.sequential_call(&roles.organizer, &refiner_output).await?;

        let segments = split_segments(&organizer_output);
        info!(run = %self.identity, segments = segments.len(), "split organizer output");

        // Pre-seed one result per segment. A failed dispatch leaves its
        // accumulation untouched and the segment is retried next round.
        let mut results: Vec<SegmentResult> =
            segments.into_iter().map(SegmentResult::new).collect();

        let mut iteration = 0usize;
        let mut score_path: Option<PathBuf> = None;

        let state = loop {
            iteration += 1;

            let targets: Vec<usize> = if iteration == 1 {
                (0..results.len()).collect()
            } else {
                let incomplete: Vec<usize> = (0..results.len())
                    .filter(|&i| !results[i].is_complete())
                    .collect();
                if incomplete.is_empty() {
                    // Every part closed but the document terminator is
                    // missing: continue the highest-index part on the guess
                    // that the ending is what's unfinished.
                    let last = merge_order(&results)
                        .last()
                        .copied()
                        .expect("splitter yields at least one segment");
                    info!(
                        run = %self.identity,
                        segment = %results[last].segment.label,
                        "all parts closed but terminator missing; continuing last part"
                    );
                    vec![last]
                } else {
                    incomplete
                }
            };

            let width = self.config.fanout_width.min(targets.len()).max(1);
            info!(
                run = %self.identity,
                round = iteration,
                dispatching = targets.len(),
                width,
                "dispatching renderer round"
            );

            let this = &self;
            let renderer = &roles.renderer;
            let round: Vec<(usize, Result<String, ProviderError>)> =
                stream::iter(targets.into_iter().map(|idx| {
                    let result = &results[idx];
                    let prompt_text = if result.response.is_empty() {
                        initial_render_prompt(&result.segment)
                    } else {
                        continuation_render_prompt(&result.segment, &result.response)
                    };
                    async move { (idx, this.invoke_role(renderer, &prompt_text).await) }
                }))
                .buffer_unordered(width)
                .collect()
                .await;

            // Fan-in barrier passed: mutate results only now, with every
            // dispatched call fully returned or failed.
            let mut round_responses: Vec<(String, u32, String)> = Vec::new();
            for (idx, outcome) in round {
                match outcome {
                    Ok(text) => {
                        round_responses.push((
                            results[idx].segment.label.clone(),
                            results[idx].segment.index,
                            text.clone(),
                        ));
                        results[idx].append(&text);
                    }
                    Err(err) => {
                        warn!(
                            run = %self.identity,
                            segment = %results[idx].segment.label,
                            index = results[idx].segment.index,
                            error = %err,
                            "segment dispatch failed; keeping prior text, will retry next round"
                        );
                    }
                }
            }

            if iteration == 1 {
                let order = merge_order(&results);
                let combined = order
                    .iter()
                    .map(|&i| results[i].response.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                self.transcript
                    .push(TranscriptTurn::new(roles.renderer.name, combined));
            } else {
                for (label, index, text) in round_responses {
                    self.transcript.push(TranscriptTurn::new(
                        format!("{} (cont. {label} P{index})", roles.renderer.name),
                        text,
                    ));
                }
            }

            let order = merge_order(&results);
            let fragments: Vec<&str> =
                order.iter().map(|&i| results[i].response.as_str()).collect();
            let document = assemble(&fragments);
            let path = self.store.save_score(
                self.identity.category,
                self.identity.item,
                self.identity.trial,
                &document,
            )?;
            info!(run = %self.identity, round = iteration, path = %path.display(), "persisted score");
            score_path = Some(path);

            let incomplete = results.iter().filter(|r| !r.is_complete()).count();
            if incomplete == 0 && is_score_complete(&document) {
                break TerminalState::Complete;
            }
            if iteration >= self.config.max_iterations {
                break TerminalState::IncompleteAfterBudget;
            }
            if cancel_requested(cancel) {
                break TerminalState::Cancelled;
            }
        };

        let segment_count = results.len();
        self.finish(state, iteration, segment_count, score_path)
    }

    fn finish(
        self,
        state: TerminalState,
        iterations: usize,
        segments: usize,
        score_path: Option<PathBuf>,
    ) -> Result<RunReport, PipelineError> {
        let transcript_path = self.store.save_transcript(
            self.identity.category,
            self.identity.item,
            self.identity.trial,
            &self.transcript,
        )?;
        info!(
            run = %self.identity,
            state = ?state,
            iterations,
            segments,
            "run finished"
        );
        Ok(RunReport {
            identity: self.identity,
            state,
            iterations,
            segments,
            score_path,
            transcript_path,
        })
    }

    /// One sequential role call; a failure here aborts the whole run.
    async fn sequential_call(
        &mut self,
        role: &RoleConfig,
        input: &str,
    ) -> Result<String, PipelineError> {
        match self.invoke_role(role, input).await {
            Ok(output) => {
                self.transcript
                    .push(TranscriptTurn::new(role.name, &output));
                Ok(output)
            }
            Err(source) => {
                warn!(
                    run = %self.identity,
                    role = role.name,
                    error = %source,
                    "sequential role call failed, aborting run"
                );
                // Best-effort transcript persistence before surfacing.
                if let Err(store_err) = self.store.save_transcript(
                    self.identity.category,
                    self.identity.item,
                    self.identity.trial,
                    &self.transcript,
                ) {
                    warn!(run = %self.identity, error = %store_err, "failed to persist transcript");
                }
                Err(PipelineError::RoleCall {
                    role: role.name,
                    source,
                })
            }
        }
    }

    async fn invoke_role(
        &self,
        role: &RoleConfig,
        user_content: &str,
    ) -> Result<String, ProviderError> {
        let messages = vec![
            Message::system(&role.system_prompt),
            Message::user(user_content),
        ];
        let request = ChatRequest::new(
            &role.model,
            messages,
            Attribution::new(role.name).with_run(self.identity.run_id),
        )
        .temperature(role.temperature)
        .top_p(role.top_p)
        .max_tokens(role.max_tokens);

        let response = self.gateway.chat(request).await?;
        info!(
            run = %self.identity,
            role = role.name,
            chars = response.content.len(),
            "role response received"
        );
        Ok(response.content)
    }
}

// =============================================================================
// TESTS
// =============================================================================
