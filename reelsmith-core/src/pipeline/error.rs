use std::path::PathBuf;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::clients::ServiceError;

use super::types::UnitState;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("copy of {path} did not match its source")]
    Verification { path: PathBuf },
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: UnitState, to: UnitState },
    #[error("{0}")]
    Invalid(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> PipelineError {
        let path = path.into();
        move |source| PipelineError::Io { source, path }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
