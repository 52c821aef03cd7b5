//! Per-run persistence for transcripts and assembled scores.
//!
//! Each run owns two files, named deterministically from its identity. Both
//! are overwritten wholesale: the score after every fan-out round (so a crash
//! leaves the last completed round durable), the transcript once at run end.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One turn of a run's conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptTurn {
    pub role: String,
    pub content: String,
}

impl TranscriptTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Output directories for a batch of runs.
#[derive(Debug, Clone)]
pub struct RunStore {
    conversation_dir: PathBuf,
    score_dir: PathBuf,
}

impl RunStore {
    /// Create the store under `base`, making both subdirectories.
    pub fn create(base: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base = base.as_ref();
        let conversation_dir = base.join("conversations");
        let score_dir = base.join("scores");
        fs::create_dir_all(&conversation_dir)?;
        fs::create_dir_all(&score_dir)?;
        Ok(Self {
            conversation_dir,
            score_dir,
        })
    }

    pub fn score_path(&self, category: u32, item: u32, trial: u32) -> PathBuf {
        self.score_dir
            .join(format!("Category{category}_Prompt{item}_Trial{trial}.xml"))
    }

    pub fn transcript_path(&self, category: u32, item: u32, trial: u32) -> PathBuf {
        self.conversation_dir
            .join(format!("conversation_Cat{category}_Prompt{item}_Trial{trial}.json"))
    }

    /// Overwrite the score file with the latest assembled document.
    pub fn save_score(
        &self,
        category: u32,
        item: u32,
        trial: u32,
        document: &str,
    ) -> Result<PathBuf, StoreError> {
        let path = self.score_path(category, item, trial);
        fs::write(&path, document)?;
        Ok(path)
    }

    /// Overwrite the transcript file with the full turn sequence.
    pub fn save_transcript(
        &self,
        category: u32,
        item: u32,
        trial: u32,
        turns: &[TranscriptTurn],
    ) -> Result<PathBuf, StoreError> {
        let path = self.transcript_path(category, item, trial);
        let json = serde_json::to_string_pretty(turns)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}
