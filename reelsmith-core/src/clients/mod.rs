mod http;
mod poll;
mod retry;
mod subtitle;
mod video;
mod voice;

use std::path::PathBuf;

use thiserror::Error;

pub use http::{HttpService, MultipartField};
pub use poll::{poll_until, wait_for_file, PollPolicy, PollStatus};
pub use retry::{retry_transient, RetryPolicy};
pub use subtitle::{SubtitleRequest, SubtitleService, WhisperClient};
pub use video::{
    interpret_status, parse_task_id, render, VideoClient, VideoJob, VideoOutput, VideoService,
    VideoStatusResponse, VIDEO_FAILURE_PREFIX,
};
pub use voice::{
    pandrator_payload, session_name, PandratorVoiceClient, TtsVoiceClient, VoiceArtifact,
    VoiceRequest, VoiceService,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transient service failure: {0}")]
    Transient(String),
    #[error("service returned http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("{0}")]
    Application(String),
    #[error("gave up after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("expected artifact missing: {0}")]
    MissingArtifact(PathBuf),
    #[error("malformed service response: {0}")]
    Malformed(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl ServiceError {
    /// Connection-level failures and gateway statuses are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Transient(_) => true,
            ServiceError::Http { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> ServiceError {
        let path = path.into();
        move |source| ServiceError::Io { source, path }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() || error.is_request() {
            return ServiceError::Transient(error.to_string());
        }
        if let Some(status) = error.status() {
            return ServiceError::Http {
                status: status.as_u16(),
                body: error.to_string(),
            };
        }
        ServiceError::Malformed(error.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_statuses_are_transient() {
        for status in [502, 503, 504] {
            let error = ServiceError::Http {
                status,
                body: String::new(),
            };
            assert!(error.is_transient(), "{status} should be retried");
        }
        for status in [400, 404, 500] {
            let error = ServiceError::Http {
                status,
                body: String::new(),
            };
            assert!(!error.is_transient(), "{status} should not be retried");
        }
        assert!(ServiceError::Transient("refused".into()).is_transient());
        assert!(!ServiceError::Application("bad".into()).is_transient());
    }
}
