use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, info};

use super::error::{PipelineError, PipelineResult};

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.output().await
    }
}

pub(crate) fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().to_string()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Runs `command` and turns a non-zero exit into `CommandFailure`.
pub async fn run_checked(executor: &dyn CommandExecutor, command: &mut Command) -> PipelineResult<Output> {
    let description = describe(command);
    debug!(command = %description, "running command");
    let output = executor
        .run(command)
        .await
        .map_err(|err| PipelineError::CommandFailure {
            command: description.clone(),
            status: None,
            stderr: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(PipelineError::CommandFailure {
            command: description,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// Inputs of the hook thumbnail renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailJob {
    pub base_image: PathBuf,
    pub text_file: PathBuf,
    pub output_dir: PathBuf,
    pub font: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailOutput {
    pub thumbnail: PathBuf,
    pub overlay: PathBuf,
}

impl ThumbnailJob {
    fn stem(&self) -> String {
        self.text_file
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "hook".into())
    }

    pub fn expected_output(&self) -> ThumbnailOutput {
        let stem = self.stem();
        ThumbnailOutput {
            thumbnail: self.output_dir.join(format!("{stem}_thumbnail.png")),
            overlay: self.output_dir.join(format!("{stem}.png")),
        }
    }

    /// `argv` followed by the renderer flags.
    pub fn command(&self, argv: &[String]) -> PipelineResult<Command> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| PipelineError::Invalid("thumbnail command is empty".into()))?;
        let mut command = Command::new(program);
        command
            .args(rest)
            .arg("--base_image")
            .arg(&self.base_image)
            .arg("--text_file")
            .arg(&self.text_file)
            .arg("--output_dir")
            .arg(&self.output_dir)
            .arg("--font_path")
            .arg(&self.font);
        Ok(command)
    }
}

pub async fn render_thumbnail(
    executor: &dyn CommandExecutor,
    argv: &[String],
    job: &ThumbnailJob,
) -> PipelineResult<ThumbnailOutput> {
    let mut command = job.command(argv)?;
    run_checked(executor, &mut command).await?;
    let output = job.expected_output();
    for path in [&output.thumbnail, &output.overlay] {
        if !exists(path).await {
            return Err(PipelineError::Invalid(format!(
                "thumbnail renderer did not produce {}",
                path.display()
            )));
        }
    }
    info!(thumbnail = %output.thumbnail.display(), "rendered hook thumbnail");
    Ok(output)
}

pub(crate) async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
