#![forbid(unsafe_code)]

//! # partwise
//!
//! Multi-role LLM pipeline for generating MusicXML scores.
//!
//! A single model call cannot reliably produce a long, structurally valid
//! score. partwise splits the job across four fixed roles: a planner outlines
//! the composition, a refiner corrects rhythm and pitch, an organizer tags
//! the outline into per-instrument segments, and a renderer converts each
//! segment to MusicXML in parallel. The coordinator merges the fragments,
//! detects incomplete material, and runs bounded continuation rounds until
//! the document closes or the budget runs out.
//!
//! The batch layer runs many pipelines under one concurrency bound with
//! greedy admission and cooperative cancellation.

pub mod assembler;
pub mod batch;
pub mod gateway;
pub mod pipeline;
pub mod roles;
pub mod splitter;
pub mod store;

pub use batch::{BatchConfig, BatchItem, BatchRunner, BatchSummary, RunOutcome};
pub use gateway::{
    Attribution, ChatGateway, GatewayConfig, NoopUsageSink, ProviderGateway, StderrUsageSink,
    UsageSink,
};
pub use pipeline::{
    PipelineConfig, PipelineCoordinator, PipelineError, RunIdentity, RunReport, TerminalState,
};
pub use roles::{RoleConfig, RoleSet};
pub use splitter::{split_segments, Segment};
pub use store::{RunStore, TranscriptTurn};
