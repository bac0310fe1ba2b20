use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    VoiceProcessing,
    VoiceDone,
    VideoProcessing,
    Completed,
    Error,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::VoiceProcessing => "voice_processing",
            UnitState::VoiceDone => "voice_done",
            UnitState::VideoProcessing => "video_processing",
            UnitState::Completed => "completed",
            UnitState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Completed | UnitState::Error)
    }

    pub fn can_transition(&self, to: UnitState) -> bool {
        use UnitState::*;
        match (self, to) {
            (Completed, _) | (Error, _) => false,
            (_, Error) => true,
            (Pending, VoiceProcessing)
            | (VoiceProcessing, VoiceDone)
            | (VoiceDone, VideoProcessing)
            | (VideoProcessing, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Channel documents and moving the scripts into `Working/`.
    Prepare,
    Hook,
    Voice,
    Subtitle,
    Video,
    /// Moving results into their final folders.
    Promote,
    Metadata,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Hook => "hook",
            Stage::Voice => "voice",
            Stage::Subtitle => "subtitle",
            Stage::Video => "video",
            Stage::Promote => "promote",
            Stage::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Hook {
        audio: PathBuf,
        thumbnail: Option<PathBuf>,
        overlay: Option<PathBuf>,
    },
    Voice {
        audio: PathBuf,
        subtitle: Option<PathBuf>,
    },
    Subtitle {
        path: PathBuf,
    },
    Video {
        path: PathBuf,
        remote_task_id: String,
        overlay_copy: Option<PathBuf>,
    },
    Metadata {
        embedded: bool,
    },
}

/// Everything known about one unit of work while it moves through the stages.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub workflow: String,
    pub channel: String,
    pub prefix: String,
    pub file_path: PathBuf,
    pub state: UnitState,
    pub results: BTreeMap<Stage, StageResult>,
    pub started_at: DateTime<Utc>,
    pub task_id: Option<i64>,
}

impl ProcessingContext {
    pub fn new(
        workflow: impl Into<String>,
        channel: impl Into<String>,
        prefix: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            channel: channel.into(),
            prefix: prefix.into(),
            file_path: file_path.into(),
            state: UnitState::Pending,
            results: BTreeMap::new(),
            started_at: Utc::now(),
            task_id: None,
        }
    }

    pub fn transition(&mut self, to: UnitState) -> PipelineResult<()> {
        if !self.state.can_transition(to) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!(
            channel = %self.channel,
            prefix = %self.prefix,
            from = %self.state,
            to = %to,
            "state transition"
        );
        self.state = to;
        Ok(())
    }

    pub fn record(&mut self, stage: Stage, result: StageResult) {
        self.results.insert(stage, result);
    }

    pub fn result(&self, stage: Stage) -> Option<&StageResult> {
        self.results.get(&stage)
    }

    pub fn remote_task_id(&self) -> Option<&str> {
        match self.results.get(&Stage::Video) {
            Some(StageResult::Video { remote_task_id, .. }) => Some(remote_task_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { video: PathBuf },
    Failed { stage: Stage, message: String },
    Skipped { reason: String },
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }
}
