use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::http::HttpService;
use super::poll::{wait_for_file, PollPolicy};
use super::{ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtitleRequest {
    #[serde(rename = "file_path")]
    pub audio: PathBuf,
    #[serde(rename = "output_path")]
    pub output_dir: PathBuf,
    /// File name without the `.srt` extension.
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words_per_segment: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<u32>,
}

impl SubtitleRequest {
    pub fn expected_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.srt", self.filename))
    }
}

#[async_trait]
pub trait SubtitleService: Send + Sync {
    async fn transcribe(&self, request: &SubtitleRequest) -> ServiceResult<PathBuf>;
}

#[derive(Debug, Deserialize)]
struct WhisperReply {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WhisperClient {
    http: HttpService,
    artifact_wait: PollPolicy,
}

impl WhisperClient {
    pub fn new(http: HttpService, artifact_wait: PollPolicy) -> Self {
        Self {
            http,
            artifact_wait,
        }
    }
}

#[async_trait]
impl SubtitleService for WhisperClient {
    async fn transcribe(&self, request: &SubtitleRequest) -> ServiceResult<PathBuf> {
        info!(audio = %request.audio.display(), "requesting subtitles");
        let reply: WhisperReply = self.http.post_json("to_srt/", request).await?;
        if !reply.status.eq_ignore_ascii_case("success") {
            return Err(ServiceError::Application(format!(
                "subtitle generation failed: {}",
                reply.message.unwrap_or(reply.status)
            )));
        }
        wait_for_file(&request.expected_path(), &self.artifact_wait).await
    }
}
