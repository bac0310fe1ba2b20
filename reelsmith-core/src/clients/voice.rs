use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::channel::VoiceSettings;

use super::http::{HttpService, MultipartField};
use super::poll::{wait_for_file, PollPolicy};
use super::{ServiceError, ServiceResult};

/// What to narrate and where the results must end up.
#[derive(Debug, Clone)]
pub struct VoiceRequest {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub audio_name: String,
    /// Set when the voice service should also provide subtitles.
    pub subtitle_name: Option<String>,
    pub settings: VoiceSettings,
}

impl VoiceRequest {
    pub fn audio_path(&self) -> PathBuf {
        self.output_dir.join(&self.audio_name)
    }

    pub fn subtitle_path(&self) -> Option<PathBuf> {
        self.subtitle_name
            .as_ref()
            .map(|name| self.output_dir.join(name))
    }

    fn source_stem(&self) -> String {
        self.source
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "script".into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceArtifact {
    pub audio: PathBuf,
    pub subtitle: Option<PathBuf>,
}

#[async_trait]
pub trait VoiceService: Send + Sync {
    async fn synthesize(&self, request: &VoiceRequest) -> ServiceResult<VoiceArtifact>;
}

#[derive(Debug, Deserialize)]
struct ServiceReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    local_path: Option<String>,
}

impl ServiceReply {
    fn ensure_ok(&self, service: &str) -> ServiceResult<()> {
        match self.status.as_deref() {
            Some(status)
                if status.eq_ignore_ascii_case("error") || status.eq_ignore_ascii_case("failed") =>
            {
                Err(ServiceError::Application(format!(
                    "{service} failed: {}",
                    self.message.as_deref().unwrap_or("no message")
                )))
            }
            _ => Ok(()),
        }
    }
}

pub fn session_name(script_stem: &str, now: DateTime<Utc>) -> String {
    format!("{script_stem}_{}", now.format("%Y%m%d_%H%M%S_%3f"))
}

/// Request body for the Pandrator endpoint: the fixed keys followed by every
/// channel voice setting.
pub fn pandrator_payload(
    source_file: &Path,
    session: &str,
    default_xtts_url: &str,
    settings: &VoiceSettings,
) -> Value {
    let mut body = Map::new();
    body.insert(
        "source_file".into(),
        Value::String(source_file.to_string_lossy().to_string()),
    );
    body.insert("session_name".into(), Value::String(session.to_string()));
    body.insert(
        "xtts_server_url".into(),
        Value::String(
            settings
                .xtts_server_url
                .clone()
                .unwrap_or_else(|| default_xtts_url.to_string()),
        ),
    );
    if let Some(voice) = &settings.speaker_voice {
        body.insert("speaker_voice".into(), Value::String(voice.clone()));
    }
    if let Some(language) = &settings.language {
        body.insert("language".into(), Value::String(language.clone()));
    }
    for (key, value) in &settings.extra {
        body.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(body)
}

/// Narration through the Pandrator voice API. Results are written by the
/// service into its own session folder and copied into the channel from there.
#[derive(Debug, Clone)]
pub struct PandratorVoiceClient {
    http: HttpService,
    pandrator_dir: PathBuf,
    xtts_url: String,
    artifact_wait: PollPolicy,
}

impl PandratorVoiceClient {
    pub fn new(
        http: HttpService,
        pandrator_dir: impl Into<PathBuf>,
        xtts_url: impl Into<String>,
        artifact_wait: PollPolicy,
    ) -> Self {
        Self {
            http,
            pandrator_dir: pandrator_dir.into(),
            xtts_url: xtts_url.into(),
            artifact_wait,
        }
    }

    pub fn session_dir(&self, session: &str) -> PathBuf {
        self.pandrator_dir.join("sessions").join(session)
    }
}

#[async_trait]
impl VoiceService for PandratorVoiceClient {
    async fn synthesize(&self, request: &VoiceRequest) -> ServiceResult<VoiceArtifact> {
        let session = session_name(&request.source_stem(), Utc::now());
        let payload = pandrator_payload(&request.source, &session, &self.xtts_url, &request.settings);
        info!(session = %session, source = %request.source.display(), "requesting narration");
        let reply: ServiceReply = self.http.post_json("process_with_pandrator", &payload).await?;
        reply.ensure_ok("voice generation")?;

        let session_dir = self.session_dir(&session);
        let produced_audio = wait_for_file(&session_dir.join("final.wav"), &self.artifact_wait).await?;
        let audio = request.audio_path();
        copy_artifact(&produced_audio, &audio).await?;

        let subtitle = match request.subtitle_path() {
            Some(target) => {
                let produced = wait_for_file(&session_dir.join("final.srt"), &self.artifact_wait).await?;
                copy_artifact(&produced, &target).await?;
                Some(target)
            }
            None => None,
        };
        Ok(VoiceArtifact { audio, subtitle })
    }
}

/// Narration through the plain TTS API (multipart upload of the script).
#[derive(Debug, Clone)]
pub struct TtsVoiceClient {
    http: HttpService,
    voice: Option<String>,
    speed: f32,
}

impl TtsVoiceClient {
    pub fn new(http: HttpService, voice: Option<String>, speed: f32) -> Self {
        Self { http, voice, speed }
    }
}

#[async_trait]
impl VoiceService for TtsVoiceClient {
    async fn synthesize(&self, request: &VoiceRequest) -> ServiceResult<VoiceArtifact> {
        let voice = self
            .voice
            .clone()
            .or_else(|| request.settings.speaker_voice.clone())
            .unwrap_or_default();
        let fields = vec![
            MultipartField::file("file", &request.source),
            MultipartField::text("voice", voice),
            MultipartField::text("speed", self.speed.to_string()),
            MultipartField::text("output_dir", request.output_dir.to_string_lossy()),
            MultipartField::text("output_filename", request.audio_name.clone()),
        ];
        info!(source = %request.source.display(), "requesting tts narration");
        let reply: ServiceReply = self.http.post_multipart("tts", &fields).await?;
        reply.ensure_ok("tts")?;
        if !reply
            .status
            .as_deref()
            .map(|status| status.eq_ignore_ascii_case("success"))
            .unwrap_or(false)
        {
            return Err(ServiceError::Malformed(format!(
                "unexpected tts status {:?}",
                reply.status
            )));
        }
        let produced = reply
            .local_path
            .map(PathBuf::from)
            .ok_or_else(|| ServiceError::Malformed("tts reply without local_path".into()))?;
        if !tokio::fs::try_exists(&produced).await.unwrap_or(false) {
            return Err(ServiceError::MissingArtifact(produced));
        }
        let audio = request.audio_path();
        if produced != audio {
            copy_artifact(&produced, &audio).await?;
        }
        Ok(VoiceArtifact {
            audio,
            subtitle: None,
        })
    }
}

async fn copy_artifact(from: &Path, to: &Path) -> ServiceResult<()> {
    tokio::fs::copy(from, to)
        .await
        .map_err(ServiceError::io(to))?;
    Ok(())
}
