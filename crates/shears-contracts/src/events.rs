use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::generation::GenerationFeatures;

/// Everything a session records about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        model: String,
        transport: String,
        max_image_dim: u32,
        features: GenerationFeatures,
    },
    GenerationRequested {
        action: String,
        prompt_chars: usize,
        input_images: usize,
        temperature: Option<f32>,
        turns: usize,
    },
    GenerationFinished {
        action: String,
        text_parts: usize,
        image_parts: usize,
        turns: usize,
    },
    GenerationFailed {
        action: String,
        error_kind: String,
        message: String,
        turns: usize,
    },
    ConversationCleared {
        dropped_turns: usize,
    },
    ImageSaved {
        path: String,
        bytes: usize,
        mime_type: String,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::GenerationRequested { .. } => "generation_requested",
            Self::GenerationFinished { .. } => "generation_finished",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::ConversationCleared { .. } => "conversation_cleared",
            Self::ImageSaved { .. } => "image_saved",
        }
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub session_id: String,
    pub ts: String,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Append-only JSONL log owned by a single session.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    session_id: String,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.into(),
        }
    }

    pub fn append(&self, event: SessionEvent) -> anyhow::Result<EventRecord> {
        let record = EventRecord {
            session_id: self.session_id.clone(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            event,
        };
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        Ok(record)
    }
}
