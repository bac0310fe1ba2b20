use std::ffi::OsString;
use std::path::Path;

use tokio::process::Command;
use tracing::info;

use super::commands::{run_checked, CommandExecutor};
use super::error::{PipelineError, PipelineResult};

const COMMENT_LIMIT: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub title: String,
    pub comment: String,
    pub rating: u8,
}

impl VideoMetadata {
    /// Title is the first non-empty line of the hook, comment the rest.
    pub fn from_hook_text(text: &str) -> Self {
        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        let title = lines.next().unwrap_or_default().to_string();
        let rest = lines.collect::<Vec<_>>().join(" ");
        let comment = rest.chars().take(COMMENT_LIMIT).collect();
        Self {
            title,
            comment,
            rating: 5,
        }
    }

    pub fn ffmpeg_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-y"),
            OsString::from("-i"),
            OsString::from(input),
        ];
        for (key, value) in [
            ("title", self.title.clone()),
            ("comment", self.comment.clone()),
            ("rating", self.rating.to_string()),
        ] {
            args.push(OsString::from("-metadata"));
            args.push(OsString::from(format!("{key}={value}")));
        }
        args.push(OsString::from("-codec"));
        args.push(OsString::from("copy"));
        args.push(OsString::from(output));
        args
    }
}

/// Rewrites `video` in place with the metadata tags.
pub async fn embed_metadata(
    executor: &dyn CommandExecutor,
    ffmpeg: &Path,
    video: &Path,
    metadata: &VideoMetadata,
) -> PipelineResult<()> {
    let stem = video
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = video
        .extension()
        .map(|ext| ext.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".into());
    let tagged = video.with_file_name(format!("{stem}.tagged.{extension}"));
    let mut command = Command::new(ffmpeg);
    command.args(metadata.ffmpeg_args(video, &tagged));
    if let Err(err) = run_checked(executor, &mut command).await {
        let _ = tokio::fs::remove_file(&tagged).await;
        return Err(err);
    }
    tokio::fs::rename(&tagged, video)
        .await
        .map_err(PipelineError::io(video))?;
    info!(video = %video.display(), title = %metadata.title, "embedded metadata");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn title_and_truncated_comment() {
        let long = "x".repeat(400);
        let text = format!("\n  First line  \nsecond\n{long}\n");
        let metadata = VideoMetadata::from_hook_text(&text);
        assert_eq!(metadata.title, "First line");
        assert!(metadata.comment.starts_with("second x"));
        assert_eq!(metadata.comment.chars().count(), 255);
        assert_eq!(metadata.rating, 5);
    }

    #[test]
    fn ffmpeg_arguments() {
        let metadata = VideoMetadata {
            title: "Hi".into(),
            comment: "there".into(),
            rating: 5,
        };
        let args = metadata.ffmpeg_args(&PathBuf::from("in.mp4"), &PathBuf::from("out.mp4"));
        let args: Vec<String> = args
            .into_iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "-y", "-i", "in.mp4", "-metadata", "title=Hi", "-metadata", "comment=there",
                "-metadata", "rating=5", "-codec", "copy", "out.mp4"
            ]
        );
    }
}
