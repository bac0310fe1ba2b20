use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use hex::encode as hex_encode;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::error::{PipelineError, PipelineResult};

/// True for `<prefix>_anything` and `<prefix>.<ext>`, ignoring case.
pub fn matches_prefix(file_name: &str, prefix: &str) -> bool {
    let name = file_name.to_ascii_lowercase();
    let prefix = prefix.to_ascii_lowercase();
    match name.strip_prefix(&prefix) {
        Some(rest) => {
            rest.starts_with('_') || (rest.starts_with('.') && rest.len() > 1 && !rest[1..].contains('.'))
        }
        None => false,
    }
}

/// Regular files in `dir` that belong to `prefix`, sorted by name.
pub fn artifacts_for_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| matches_prefix(name, prefix))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// `dir/name`, or `dir/<stem>_<n>.<ext>` with the first free `n`.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}{extension}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(candidate)
}

pub async fn sha256_file(path: &Path) -> PipelineResult<String> {
    let bytes = tokio::fs::read(path).await.map_err(PipelineError::io(path))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex_encode(hasher.finalize()))
}

/// Copies `src` into `dst_dir`, checks size and digest of the copy, then
/// removes `src`. Returns the destination path.
pub async fn promote(src: &Path, dst_dir: &Path) -> PipelineResult<PathBuf> {
    let name = src
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| PipelineError::Invalid(format!("{} has no file name", src.display())))?;
    tokio::fs::create_dir_all(dst_dir)
        .await
        .map_err(PipelineError::io(dst_dir))?;
    let destination = unique_destination(dst_dir, &name);
    copy_verified(src, &destination).await?;
    tokio::fs::remove_file(src)
        .await
        .map_err(PipelineError::io(src))?;
    debug!(from = %src.display(), to = %destination.display(), "promoted file");
    Ok(destination)
}

/// Copies `src` to `destination` and checks size and digest; the source stays.
pub async fn copy_verified(src: &Path, destination: &Path) -> PipelineResult<()> {
    tokio::fs::copy(src, destination)
        .await
        .map_err(PipelineError::io(destination))?;
    let source_len = tokio::fs::metadata(src)
        .await
        .map_err(PipelineError::io(src))?
        .len();
    let copy_len = tokio::fs::metadata(destination)
        .await
        .map_err(PipelineError::io(destination))?
        .len();
    if source_len != copy_len || sha256_file(src).await? != sha256_file(destination).await? {
        let _ = tokio::fs::remove_file(destination).await;
        return Err(PipelineError::Verification {
            path: destination.to_path_buf(),
        });
    }
    Ok(())
}

pub fn error_log_contents(stage: &str, message: &str, at: DateTime<Local>) -> String {
    format!(
        "Error occurred at {}\nStage: {}\nError message: {}\n",
        at.format("%Y-%m-%d %H:%M:%S"),
        stage,
        message
    )
}

/// Appends a failure entry to `<error_dir>/<prefix>_error.log`.
pub async fn write_error_log(
    error_dir: &Path,
    prefix: &str,
    stage: &str,
    message: &str,
) -> PipelineResult<PathBuf> {
    tokio::fs::create_dir_all(error_dir)
        .await
        .map_err(PipelineError::io(error_dir))?;
    let path = error_dir.join(format!("{prefix}_error.log"));
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(PipelineError::io(&path))?;
    file.write_all(error_log_contents(stage, message, Local::now()).as_bytes())
        .await
        .map_err(PipelineError::io(&path))?;
    file.flush().await.map_err(PipelineError::io(&path))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn prefix_matching_is_exact_on_the_prefix() {
        assert!(matches_prefix("ABC_hook.txt", "ABC"));
        assert!(matches_prefix("abc_audio.wav", "ABC"));
        assert!(matches_prefix("ABC.srt", "abc"));
        assert!(!matches_prefix("ABCD_hook.txt", "ABC"));
        assert!(!matches_prefix("ABC.tar.gz", "ABC"));
        assert!(!matches_prefix("XABC_hook.txt", "ABC"));
    }

    #[test]
    fn collisions_get_numeric_suffix() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ABC.srt"), "a").unwrap();
        fs::write(dir.path().join("ABC_1.srt"), "a").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "ABC.srt"),
            dir.path().join("ABC_2.srt")
        );
        assert_eq!(
            unique_destination(dir.path(), "XYZ.srt"),
            dir.path().join("XYZ.srt")
        );
    }

    #[tokio::test]
    async fn promote_moves_and_verifies() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("ABC_hook.txt");
        fs::write(&src, "hook line").unwrap();
        let dst_dir = dir.path().join("Working");
        let moved = promote(&src, &dst_dir).await.unwrap();
        assert_eq!(moved, dst_dir.join("ABC_hook.txt"));
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(moved).unwrap(), "hook line");
    }

    #[test]
    fn error_log_format() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        assert_eq!(
            error_log_contents("video", "Video generation failed: render crashed", at),
            "Error occurred at 2024-05-01 09:30:00\nStage: video\nError message: Video generation failed: render crashed\n"
        );
    }
}
