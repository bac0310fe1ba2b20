mod commands;
mod error;
pub mod files;
mod metadata;
mod recorder;
mod types;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelDocuments, ChannelPaths};
use crate::clients::{
    render, HttpService, PandratorVoiceClient, PollPolicy, RetryPolicy, ServiceError,
    ServiceResult, SubtitleRequest, SubtitleService, TtsVoiceClient, VideoClient, VideoJob,
    VideoService, VoiceRequest, VoiceService, WhisperClient,
};
use crate::config::{
    HookFailurePolicy, PromotionLayout, SubtitleSource, VideoMode, VoiceBackend, WorkflowConfig,
};
use crate::queue::{WorkHandler, WorkItem};
use crate::tasks::{NewTask, TaskPriority};

pub use commands::{
    render_thumbnail, run_checked, CommandExecutor, SystemCommandExecutor, ThumbnailJob,
    ThumbnailOutput,
};
pub use error::{PipelineError, PipelineResult};
pub use metadata::{embed_metadata, VideoMetadata};
pub use recorder::TaskRecorder;
pub use types::{PipelineOutcome, ProcessingContext, Stage, StageResult, UnitState};

pub const FAILURES_LOG: &str = "pipeline_failures.log";

/// Workflow-level knobs the executor needs, resolved from [`WorkflowConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workflow_name: String,
    pub hook_failure: HookFailurePolicy,
    pub promotion: PromotionLayout,
    pub video_mode: VideoMode,
    pub subtitle_source: SubtitleSource,
    pub words_per_segment: Option<u32>,
    pub max_chars: Option<u32>,
    pub output_extension: String,
    pub video_poll: PollPolicy,
    pub thumbnail_command: Option<Vec<String>>,
    pub embed_metadata: bool,
    pub ffmpeg: PathBuf,
    pub failures_log: PathBuf,
}

impl PipelineSettings {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            workflow_name: config.workflow.name.clone(),
            hook_failure: config.pipeline.hook_failure,
            promotion: config.pipeline.promotion,
            video_mode: config.video.mode,
            subtitle_source: config.subtitles.source,
            words_per_segment: config.subtitles.words_per_segment,
            max_chars: config.subtitles.max_chars,
            output_extension: config.video.output_extension.clone(),
            video_poll: PollPolicy::new(config.video.poll_interval(), config.video.max_poll_attempts),
            thumbnail_command: config.pipeline.thumbnail_command.clone(),
            embed_metadata: config.pipeline.embed_metadata,
            ffmpeg: config.pipeline.ffmpeg.clone(),
            failures_log: config.logs_dir().join(FAILURES_LOG),
        }
    }
}

/// External collaborators of the executor.
#[derive(Clone)]
pub struct PipelineServices {
    pub voice: Arc<dyn VoiceService>,
    pub subtitles: Option<Arc<dyn SubtitleService>>,
    pub video: Arc<dyn VideoService>,
    pub commands: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for PipelineServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineServices")
            .field("subtitles", &self.subtitles.is_some())
            .finish()
    }
}

impl PipelineServices {
    pub fn new(voice: Arc<dyn VoiceService>, video: Arc<dyn VideoService>) -> Self {
        Self {
            voice,
            subtitles: None,
            video,
            commands: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_subtitles(mut self, subtitles: Arc<dyn SubtitleService>) -> Self {
        self.subtitles = Some(subtitles);
        self
    }

    pub fn with_command_executor(mut self, commands: Arc<dyn CommandExecutor>) -> Self {
        self.commands = commands;
        self
    }

    /// HTTP clients for every service the configuration points at.
    pub fn from_config(config: &WorkflowConfig) -> ServiceResult<Self> {
        let retry = RetryPolicy::from(&config.retry);
        let services = &config.services;
        let voice: Arc<dyn VoiceService> = match config.voice.backend {
            VoiceBackend::Pandrator => Arc::new(PandratorVoiceClient::new(
                HttpService::new(&services.voice_api, config.voice.request_timeout(), retry.clone())?,
                config.resolve_path(&services.pandrator_dir),
                services.xtts_api.clone(),
                PollPolicy::per_second(config.voice.artifact_wait_secs),
            )),
            VoiceBackend::Tts => Arc::new(TtsVoiceClient::new(
                HttpService::new(&services.tts_api, config.voice.request_timeout(), retry.clone())?,
                config.voice.tts_voice.clone(),
                config.voice.tts_speed,
            )),
        };
        let video = Arc::new(VideoClient::new(
            HttpService::new(&services.video_api, config.video.request_timeout(), retry.clone())?,
            config.video.submit_path(),
            config.video.status_path(),
        ));
        let mut built = Self::new(voice, video);
        if config.subtitles.source == SubtitleSource::Whisper {
            built = built.with_subtitles(Arc::new(WhisperClient::new(
                HttpService::new(&services.whisper_api, config.subtitles.request_timeout(), retry)?,
                PollPolicy::per_second(config.subtitles.artifact_wait_secs),
            )));
        }
        Ok(built)
    }
}

struct StageFailure {
    stage: Stage,
    error: PipelineError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T, E: Into<PipelineError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|err| StageFailure {
            stage,
            error: err.into(),
        })
    }
}

/// Files this run has placed in `Final/` or `Completed/`; they are pulled
/// back on failure.
#[derive(Debug, Default)]
struct Placed {
    final_files: Vec<PathBuf>,
    completed_files: Vec<PathBuf>,
}

/// Everything that goes to `Error/` when a unit fails: what is left in
/// `Working/` and `Scripts/`, plus whatever this run already promoted.
fn failure_sweep(paths: &ChannelPaths, prefix: &str, placed: &Placed) -> Vec<PathBuf> {
    let mut stray = files::artifacts_for_prefix(&paths.working, prefix);
    stray.extend(files::artifacts_for_prefix(&paths.scripts, prefix));
    stray.extend(
        placed
            .final_files
            .iter()
            .chain(&placed.completed_files)
            .filter(|path| path.exists())
            .cloned(),
    );
    stray
}

/// Runs one hook/kb pair of a channel through every stage.
pub struct PipelineExecutor {
    paths: ChannelPaths,
    settings: Arc<PipelineSettings>,
    services: PipelineServices,
    recorder: TaskRecorder,
}

impl fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("channel", &self.paths.name)
            .field("settings", &self.settings)
            .field("recorder", &self.recorder)
            .finish()
    }
}

impl PipelineExecutor {
    pub fn new(
        paths: ChannelPaths,
        settings: Arc<PipelineSettings>,
        services: PipelineServices,
    ) -> Self {
        Self {
            paths,
            settings,
            services,
            recorder: TaskRecorder::default(),
        }
    }

    pub fn with_recorder(mut self, recorder: TaskRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    pub async fn execute(&self, item: &WorkItem) -> PipelineOutcome {
        if !commands::exists(&item.hook).await || !commands::exists(&item.kb).await {
            info!(channel = %self.paths.name, prefix = %item.prefix, "pair already consumed");
            return PipelineOutcome::Skipped {
                reason: "pair already consumed".into(),
            };
        }
        let mut context = ProcessingContext::new(
            self.settings.workflow_name.clone(),
            self.paths.name.clone(),
            item.prefix.clone(),
            item.kb.clone(),
        );
        let mut placed = Placed::default();
        info!(channel = %context.channel, prefix = %context.prefix, "processing unit of work");
        match self.run_stages(item, &mut context, &mut placed).await {
            Ok(video) => {
                self.recorder
                    .complete(context.task_id, context.remote_task_id().map(str::to_string))
                    .await;
                info!(
                    channel = %context.channel,
                    prefix = %context.prefix,
                    video = %video.display(),
                    elapsed_ms = (Utc::now() - context.started_at).num_milliseconds(),
                    "unit of work completed"
                );
                PipelineOutcome::Completed { video }
            }
            Err(failure) => self.fail(&mut context, &placed, failure).await,
        }
    }

    async fn run_stages(
        &self,
        item: &WorkItem,
        context: &mut ProcessingContext,
        placed: &mut Placed,
    ) -> Result<PathBuf, StageFailure> {
        let documents = self.paths.load_documents().at(Stage::Prepare)?;
        context.task_id = self
            .recorder
            .start(NewTask {
                workflow_name: context.workflow.clone(),
                channel_name: context.channel.clone(),
                prefix: context.prefix.clone(),
                file_path: item.kb.clone(),
                priority: TaskPriority::Normal,
            })
            .await;

        let hook = files::promote(&item.hook, &self.paths.working)
            .await
            .at(Stage::Prepare)?;
        let kb = files::promote(&item.kb, &self.paths.working)
            .await
            .at(Stage::Prepare)?;
        context.file_path = kb.clone();
        let hook_text = tokio::fs::read_to_string(&hook)
            .await
            .map_err(PipelineError::io(&hook))
            .at(Stage::Prepare)?;
        context.transition(UnitState::VoiceProcessing).at(Stage::Prepare)?;

        match self.hook_stage(context, &hook, &documents).await {
            Ok(result) => context.record(Stage::Hook, result),
            Err(err) if self.settings.hook_failure == HookFailurePolicy::Skip => {
                warn!(
                    channel = %context.channel,
                    prefix = %context.prefix,
                    error = %err,
                    "hook stage failed; continuing without hook outputs"
                );
                self.log_failure(Stage::Hook, context, &err.to_string()).await;
            }
            Err(err) => return Err(StageFailure { stage: Stage::Hook, error: err }),
        }

        let (audio, subtitle) = self.voice_stage(context, &kb, &documents).await?;
        context.transition(UnitState::VoiceDone).at(Stage::Voice)?;

        context.transition(UnitState::VideoProcessing).at(Stage::Video)?;
        let (job, overlay2) = self
            .video_job(&context.prefix, audio, subtitle, &documents)
            .at(Stage::Video)?;
        let output = render(self.services.video.as_ref(), &job, &self.settings.video_poll)
            .await
            .at(Stage::Video)?;
        info!(
            channel = %context.channel,
            prefix = %context.prefix,
            task_id = %output.task_id,
            output = %output.path.display(),
            "video rendered"
        );

        let video = files::promote(&output.path, &self.paths.final_dir)
            .await
            .at(Stage::Promote)?;
        placed.final_files.push(video.clone());
        let overlay_copy = match overlay2 {
            Some(overlay2) => {
                let stem = video
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_else(|| context.prefix.clone());
                let target = files::unique_destination(
                    &self.paths.final_dir,
                    &format!("{stem}_overlay.png"),
                );
                files::copy_verified(&overlay2, &target)
                    .await
                    .at(Stage::Promote)?;
                placed.final_files.push(target.clone());
                Some(target)
            }
            None => None,
        };
        context.record(
            Stage::Video,
            StageResult::Video {
                path: video.clone(),
                remote_task_id: output.task_id,
                overlay_copy,
            },
        );
        self.promote_working(&context.prefix, placed)
            .await
            .at(Stage::Promote)?;

        if self.settings.embed_metadata {
            let metadata = VideoMetadata::from_hook_text(&hook_text);
            let embedded = match embed_metadata(
                self.services.commands.as_ref(),
                &self.settings.ffmpeg,
                &video,
                &metadata,
            )
            .await
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        channel = %context.channel,
                        prefix = %context.prefix,
                        error = %err,
                        "metadata embedding failed"
                    );
                    self.log_failure(Stage::Metadata, context, &err.to_string()).await;
                    false
                }
            };
            context.record(Stage::Metadata, StageResult::Metadata { embedded });
        }

        context.transition(UnitState::Completed).at(Stage::Promote)?;
        Ok(video)
    }

    async fn hook_stage(
        &self,
        context: &ProcessingContext,
        hook: &Path,
        documents: &ChannelDocuments,
    ) -> PipelineResult<StageResult> {
        let request = VoiceRequest {
            source: hook.to_path_buf(),
            output_dir: self.paths.working.clone(),
            audio_name: format!("{}_hook.wav", context.prefix),
            subtitle_name: None,
            settings: documents.voice_settings(),
        };
        let artifact = self.services.voice.synthesize(&request).await?;
        let (thumbnail, overlay) = match &self.settings.thumbnail_command {
            Some(argv) => {
                let assets = self.paths.hook_assets()?;
                let job = ThumbnailJob {
                    base_image: assets.base_image,
                    text_file: hook.to_path_buf(),
                    output_dir: self.paths.working.clone(),
                    font: assets.font,
                };
                let output =
                    render_thumbnail(self.services.commands.as_ref(), argv, &job).await?;
                (Some(output.thumbnail), Some(output.overlay))
            }
            None => (None, None),
        };
        Ok(StageResult::Hook {
            audio: artifact.audio,
            thumbnail,
            overlay,
        })
    }

    /// Narrates the kb script; returns the narration and the subtitle file,
    /// if any.
    async fn voice_stage(
        &self,
        context: &mut ProcessingContext,
        kb: &Path,
        documents: &ChannelDocuments,
    ) -> Result<(PathBuf, Option<PathBuf>), StageFailure> {
        let prefix = context.prefix.clone();
        let from_voice = self.settings.subtitle_source == SubtitleSource::Voice;
        let request = VoiceRequest {
            source: kb.to_path_buf(),
            output_dir: self.paths.working.clone(),
            audio_name: format!("{prefix}_audio.wav"),
            subtitle_name: from_voice.then(|| format!("{prefix}.srt")),
            settings: documents.voice_settings(),
        };
        let artifact = self
            .services
            .voice
            .synthesize(&request)
            .await
            .at(Stage::Voice)?;
        context.record(
            Stage::Voice,
            StageResult::Voice {
                audio: artifact.audio.clone(),
                subtitle: artifact.subtitle.clone(),
            },
        );

        let audio = artifact.audio;
        match self.settings.subtitle_source {
            SubtitleSource::None => Ok((audio, None)),
            SubtitleSource::Voice => artifact
                .subtitle
                .ok_or_else(|| ServiceError::MissingArtifact(self.paths.working.join(format!("{prefix}.srt"))))
                .map(|subtitle| (audio, Some(subtitle)))
                .at(Stage::Voice),
            SubtitleSource::Whisper => {
                let service = self
                    .services
                    .subtitles
                    .as_ref()
                    .ok_or_else(|| PipelineError::Invalid("no subtitle service configured".into()))
                    .at(Stage::Subtitle)?;
                let whisper = documents.whisper_settings();
                let request = SubtitleRequest {
                    audio: audio.clone(),
                    output_dir: self.paths.working.clone(),
                    filename: prefix,
                    words_per_segment: whisper.words_per_segment.or(self.settings.words_per_segment),
                    max_chars: whisper.max_chars.or(self.settings.max_chars),
                };
                let path = service.transcribe(&request).await.at(Stage::Subtitle)?;
                context.record(Stage::Subtitle, StageResult::Subtitle { path: path.clone() });
                Ok((audio, Some(path)))
            }
        }
    }

    fn video_job(
        &self,
        prefix: &str,
        audio: PathBuf,
        subtitle: Option<PathBuf>,
        documents: &ChannelDocuments,
    ) -> PipelineResult<(VideoJob, Option<PathBuf>)> {
        let preset_name = documents.preset_name().to_string();
        match self.settings.video_mode {
            VideoMode::Make => {
                let subtitle = subtitle
                    .ok_or_else(|| PipelineError::Invalid("make mode needs a subtitle file".into()))?;
                let overlay1 = self.paths.require_overlay1()?;
                let overlay2 = self.paths.pick_overlay2(&mut rand::thread_rng())?;
                let job = VideoJob::Make {
                    audio,
                    subtitle,
                    overlay1,
                    overlay2: overlay2.clone(),
                    preset_name,
                    output_name: video_output_name(prefix, &self.settings.output_extension),
                };
                Ok((job, Some(overlay2)))
            }
            VideoMode::Batch => Ok((
                VideoJob::Batch {
                    input_folder: self.paths.working.clone(),
                    preset_name,
                },
                None,
            )),
        }
    }

    /// Moves what is left in `Working/` for `prefix` to its final folder.
    async fn promote_working(&self, prefix: &str, placed: &mut Placed) -> PipelineResult<()> {
        for path in files::artifacts_for_prefix(&self.paths.working, prefix) {
            let is_script = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("txt"))
                .unwrap_or(false);
            let target = match self.settings.promotion {
                PromotionLayout::Split if is_script => &self.paths.completed,
                _ => &self.paths.final_dir,
            };
            let moved = files::promote(&path, target).await?;
            if target == &self.paths.final_dir {
                placed.final_files.push(moved);
            } else {
                placed.completed_files.push(moved);
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        context: &mut ProcessingContext,
        placed: &Placed,
        failure: StageFailure,
    ) -> PipelineOutcome {
        let StageFailure { stage, error: err } = failure;
        let message = err.to_string();
        error!(
            channel = %context.channel,
            prefix = %context.prefix,
            stage = %stage,
            error = %message,
            "unit of work failed"
        );
        if context.state.can_transition(UnitState::Error) {
            let _ = context.transition(UnitState::Error);
        }

        for path in failure_sweep(&self.paths, &context.prefix, placed) {
            if let Err(move_err) = files::promote(&path, &self.paths.error).await {
                warn!(path = %path.display(), error = %move_err, "failed to move artifact to Error");
            }
        }
        if let Err(log_err) =
            files::write_error_log(&self.paths.error, &context.prefix, stage.as_str(), &message)
                .await
        {
            warn!(error = %log_err, "failed to write error log");
        }
        self.recorder.fail(context.task_id, message.clone()).await;
        self.log_failure(stage, context, &message).await;
        PipelineOutcome::Failed { stage, message }
    }

    /// Appends one line to the workflow-wide failures log.
    async fn log_failure(&self, stage: Stage, context: &ProcessingContext, message: &str) {
        let path = &self.settings.failures_log;
        let line = format!(
            "{} [{}] {}/{}: {}\n",
            Utc::now().to_rfc3339(),
            stage,
            context.channel,
            context.prefix,
            message
        );
        if let Err(err) = append_line(path, &line).await {
            warn!(path = %path.display(), error = %err, "failed to append to failures log");
        }
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

#[async_trait]
impl WorkHandler for PipelineExecutor {
    async fn handle(&self, item: WorkItem) -> PipelineOutcome {
        self.execute(&item).await
    }
}

/// `<prefix>_<8 hex>.<ext>`
pub fn video_output_name(prefix: &str, extension: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}.{}", &id[..8], extension.trim_start_matches('.'))
}
