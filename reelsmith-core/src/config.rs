use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowConfig {
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub services: ServicesSection,
    #[serde(default)]
    pub voice: VoiceSection,
    #[serde(default)]
    pub subtitles: SubtitleSection,
    #[serde(default)]
    pub video: VideoSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl WorkflowConfig {
    /// Builds a configuration with every default filled in, rooted at `root_dir`.
    pub fn with_root(name: impl Into<String>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            workflow: WorkflowSection {
                name: name.into(),
                root_dir: root_dir.into(),
                logs_dir: None,
                task_db: None,
            },
            services: ServicesSection::default(),
            voice: VoiceSection::default(),
            subtitles: SubtitleSection::default(),
            video: VideoSection::default(),
            retry: RetrySection::default(),
            pipeline: PipelineSection::default(),
            logging: LoggingSection::default(),
        }
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workflow.root_dir.join(path)
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        match &self.workflow.logs_dir {
            Some(dir) => self.resolve_path(dir),
            None => self.workflow.root_dir.join("_logs"),
        }
    }

    pub fn task_db_path(&self) -> Option<PathBuf> {
        self.workflow
            .task_db
            .as_ref()
            .map(|path| self.resolve_path(path))
    }

    /// Applies the process environment on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(root) = value("WORKFLOW_ROOT") {
            self.workflow.root_dir = PathBuf::from(root);
        }
        if let Some(dir) = value("PANDORA_DIR") {
            self.services.pandrator_dir = PathBuf::from(dir);
        }
        if let Some(url) = value("VOICE_API_URL") {
            self.services.voice_api = url;
        }
        if let Some(url) = value("XTTS_API_URL") {
            self.services.xtts_api = url;
        }
        if let Some(url) = value("TTS_API_URL") {
            self.services.tts_api = url;
        }
        if let Some(url) = value("WHISPER_API_URL") {
            self.services.whisper_api = url;
        }
        if let Some(url) = value("VIDEO_API_URL") {
            self.services.video_api = url;
        }
        if let Some(db) = value("REELSMITH_TASK_DB") {
            self.workflow.task_db = Some(PathBuf::from(db));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workflow.name.trim().is_empty() {
            return Err(ConfigError::Invalid("workflow.name must not be empty".into()));
        }
        if self.workflow.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "workflow.root_dir must not be empty".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if self.video.max_poll_attempts == 0 {
            return Err(ConfigError::Invalid(
                "video.max_poll_attempts must be greater than zero".into(),
            ));
        }
        if self.subtitles.source == SubtitleSource::Voice && self.voice.backend == VoiceBackend::Tts
        {
            return Err(ConfigError::Invalid(
                "subtitles.source = \"voice\" needs the pandrator voice backend".into(),
            ));
        }
        if self.video.mode == VideoMode::Make && self.subtitles.source == SubtitleSource::None {
            return Err(ConfigError::Invalid(
                "video.mode = \"make\" needs subtitles".into(),
            ));
        }
        if let Some(command) = &self.pipeline.thumbnail_command {
            if command.is_empty() {
                return Err(ConfigError::Invalid(
                    "pipeline.thumbnail_command must name a program".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    pub name: String,
    pub root_dir: PathBuf,
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    #[serde(default)]
    pub task_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServicesSection {
    pub voice_api: String,
    pub xtts_api: String,
    pub tts_api: String,
    pub whisper_api: String,
    pub video_api: String,
    pub pandrator_dir: PathBuf,
}

impl Default for ServicesSection {
    fn default() -> Self {
        Self {
            voice_api: "http://localhost:5003".into(),
            xtts_api: "http://localhost:5002".into(),
            tts_api: "http://localhost:5006".into(),
            whisper_api: "http://localhost:5004".into(),
            video_api: "http://localhost:8000".into(),
            pandrator_dir: PathBuf::from("Pandrator"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceBackend {
    Pandrator,
    Tts,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceSection {
    pub backend: VoiceBackend,
    pub request_timeout_secs: u64,
    pub artifact_wait_secs: u64,
    pub tts_voice: Option<String>,
    pub tts_speed: f32,
}

impl VoiceSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for VoiceSection {
    fn default() -> Self {
        Self {
            backend: VoiceBackend::Pandrator,
            request_timeout_secs: 1800,
            artifact_wait_secs: 30,
            tts_voice: None,
            tts_speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleSource {
    Voice,
    Whisper,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubtitleSection {
    pub source: SubtitleSource,
    pub request_timeout_secs: u64,
    pub words_per_segment: Option<u32>,
    pub max_chars: Option<u32>,
    pub artifact_wait_secs: u64,
}

impl SubtitleSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for SubtitleSection {
    fn default() -> Self {
        Self {
            source: SubtitleSource::Whisper,
            request_timeout_secs: 1200,
            words_per_segment: None,
            max_chars: None,
            artifact_wait_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoMode {
    /// Single render from explicit audio, subtitle and overlay paths.
    Make,
    /// Render everything the service finds in the Working folder.
    Batch,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoSection {
    pub mode: VideoMode,
    pub submit_path: Option<String>,
    pub status_path: Option<String>,
    pub request_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
    pub output_extension: String,
}

impl VideoSection {
    pub fn submit_path(&self) -> &str {
        match (&self.submit_path, self.mode) {
            (Some(path), _) => path.as_str(),
            (None, VideoMode::Make) => "/api/v1/api/process/make",
            (None, VideoMode::Batch) => "/api/v1/hook/batch/9_16",
        }
    }

    pub fn status_path(&self) -> &str {
        match (&self.status_path, self.mode) {
            (Some(path), _) => path.as_str(),
            (None, VideoMode::Make) => "/api/v1/api/process/status",
            (None, VideoMode::Batch) => "/api/v1/hook/status",
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for VideoSection {
    fn default() -> Self {
        Self {
            mode: VideoMode::Make,
            submit_path: None,
            status_path: None,
            request_timeout_secs: 30,
            poll_interval_secs: 10,
            max_poll_attempts: 180,
            output_extension: "mp4".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFailurePolicy {
    Fatal,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionLayout {
    /// Scripts go to Completed, rendered media to Final.
    Split,
    /// Everything goes to Final.
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Fifo,
    Parallel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub hook_failure: HookFailurePolicy,
    pub promotion: PromotionLayout,
    pub dispatch: DispatchMode,
    pub thumbnail_command: Option<Vec<String>>,
    pub embed_metadata: bool,
    pub ffmpeg: PathBuf,
    pub shutdown_grace_secs: u64,
}

impl PipelineSection {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            hook_failure: HookFailurePolicy::Fatal,
            promotion: PromotionLayout::Split,
            dispatch: DispatchMode::Fifo,
            thumbnail_command: None,
            embed_metadata: false,
            ffmpeg: PathBuf::from("ffmpeg"),
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

pub fn load_workflow_config<P: AsRef<Path>>(path: P) -> Result<WorkflowConfig> {
    let config: WorkflowConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

pub(crate) fn load_json<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Json {
        source,
        path: path.to_path_buf(),
    })
}
