use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::http::HttpService;
use super::poll::{poll_until, PollPolicy, PollStatus};
use super::{ServiceError, ServiceResult};

pub const VIDEO_FAILURE_PREFIX: &str = "Video generation failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoJob {
    Make {
        audio: PathBuf,
        subtitle: PathBuf,
        overlay1: PathBuf,
        overlay2: PathBuf,
        preset_name: String,
        output_name: String,
    },
    Batch {
        input_folder: PathBuf,
        preset_name: String,
    },
}

impl VideoJob {
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let path = |value: &PathBuf| value.to_string_lossy().to_string();
        match self {
            VideoJob::Make {
                audio,
                subtitle,
                overlay1,
                overlay2,
                preset_name,
                output_name,
            } => vec![
                ("audio_path", path(audio)),
                ("subtitle_path", path(subtitle)),
                ("overlay1_path", path(overlay1)),
                ("overlay2_path", path(overlay2)),
                ("preset_name", preset_name.clone()),
                ("output_name", output_name.clone()),
            ],
            VideoJob::Batch {
                input_folder,
                preset_name,
            } => vec![
                ("input_folder", path(input_folder)),
                ("preset_name", preset_name.clone()),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOutput {
    pub task_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoStatusResponse {
    pub status: String,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub output_paths: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
}

/// Maps a status document onto a poll step.
pub fn interpret_status(
    task_id: &str,
    response: &VideoStatusResponse,
) -> ServiceResult<PollStatus<VideoOutput>> {
    match response.status.to_ascii_lowercase().as_str() {
        "pending" | "queued" | "processing" | "running" => Ok(PollStatus::Pending),
        "completed" | "complete" | "success" => {
            let path = response
                .output_path
                .clone()
                .or_else(|| {
                    response
                        .output_paths
                        .as_ref()
                        .and_then(|paths| paths.first().cloned())
                })
                .filter(|path| !path.trim().is_empty())
                .ok_or_else(|| {
                    ServiceError::Malformed(format!(
                        "video task {task_id} completed without an output path"
                    ))
                })?;
            Ok(PollStatus::Done(VideoOutput {
                task_id: task_id.to_string(),
                path: PathBuf::from(path),
            }))
        }
        "failed" | "error" => Ok(PollStatus::Failed(format!(
            "{VIDEO_FAILURE_PREFIX}: {}",
            response.error.as_deref().unwrap_or("unknown error")
        ))),
        other => Err(ServiceError::Malformed(format!(
            "video task {task_id} reported unknown status {other}"
        ))),
    }
}

/// Task id from a submit reply; accepts `task_id` or `id`, string or number.
pub fn parse_task_id(reply: &Value) -> ServiceResult<String> {
    let id = reply.get("task_id").or_else(|| reply.get("id"));
    match id {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(ServiceError::Malformed(format!(
            "submit reply without task id: {reply}"
        ))),
    }
}

#[async_trait]
pub trait VideoService: Send + Sync {
    async fn submit(&self, job: &VideoJob) -> ServiceResult<String>;
    async fn status(&self, task_id: &str) -> ServiceResult<PollStatus<VideoOutput>>;
}

/// Submits `job` and polls until the render finishes. The output file must
/// exist before success is reported.
pub async fn render(
    service: &dyn VideoService,
    job: &VideoJob,
    policy: &PollPolicy,
) -> ServiceResult<VideoOutput> {
    let task_id = service.submit(job).await?;
    info!(task_id = %task_id, "video task submitted");
    let label = format!("video task {task_id}");
    let output = poll_until(policy, &label, || service.status(&task_id)).await?;
    if !tokio::fs::try_exists(&output.path).await.unwrap_or(false) {
        return Err(ServiceError::MissingArtifact(output.path));
    }
    Ok(output)
}

#[derive(Debug, Clone)]
pub struct VideoClient {
    http: HttpService,
    submit_path: String,
    status_path: String,
}

impl VideoClient {
    pub fn new(
        http: HttpService,
        submit_path: impl Into<String>,
        status_path: impl Into<String>,
    ) -> Self {
        Self {
            http,
            submit_path: submit_path.into(),
            status_path: status_path.into(),
        }
    }

    pub fn status_endpoint(&self, task_id: &str) -> String {
        format!("{}/{}", self.status_path.trim_end_matches('/'), task_id)
    }
}

#[async_trait]
impl VideoService for VideoClient {
    async fn submit(&self, job: &VideoJob) -> ServiceResult<String> {
        let reply: Value = self.http.post_form(&self.submit_path, &job.form_fields()).await?;
        parse_task_id(&reply)
    }

    async fn status(&self, task_id: &str) -> ServiceResult<PollStatus<VideoOutput>> {
        let response: VideoStatusResponse = self.http.get_json(&self.status_endpoint(task_id)).await?;
        interpret_status(task_id, &response)
    }
}
