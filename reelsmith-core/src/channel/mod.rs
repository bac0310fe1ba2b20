mod documents;
mod template;

use std::fs;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ConfigError;

pub use documents::{
    ChannelConfig, ChannelDocuments, ChannelPreset, VideoSettings, VoiceSettings,
    WhisperSettings,
};
pub use template::{ensure_template, TEMPLATE_DIR};

pub const SCRIPTS_DIR: &str = "Scripts";
pub const WORKING_DIR: &str = "Working";
pub const COMPLETED_DIR: &str = "Completed";
pub const ERROR_DIR: &str = "Error";
pub const FINAL_DIR: &str = "Final";
pub const ASSETS_DIR: &str = "Assets";
pub const CONFIG_FILE: &str = "config.json";
pub const PRESET_FILE: &str = "preset.json";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("channel {channel} is missing {path}")]
    MissingDocument { channel: String, path: PathBuf },
    #[error("channel document error: {0}")]
    Document(#[from] ConfigError),
    #[error("invalid channel name: {0}")]
    InvalidName(String),
    #[error("missing asset: {0}")]
    MissingAsset(PathBuf),
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ChannelError + '_ {
    move |source| ChannelError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Stage directories and documents of one channel under the workflow root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    pub name: String,
    pub root: PathBuf,
    pub scripts: PathBuf,
    pub working: PathBuf,
    pub completed: PathBuf,
    pub error: PathBuf,
    pub final_dir: PathBuf,
    pub assets: PathBuf,
    pub overlay1_dir: PathBuf,
    pub overlay2_dir: PathBuf,
    pub config_file: PathBuf,
    pub preset_file: PathBuf,
}

impl ChannelPaths {
    pub fn new(workflow_root: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let name = name.into();
        let root = workflow_root.as_ref().join(&name);
        let assets = root.join(ASSETS_DIR);
        Self {
            scripts: root.join(SCRIPTS_DIR),
            working: root.join(WORKING_DIR),
            completed: root.join(COMPLETED_DIR),
            error: root.join(ERROR_DIR),
            final_dir: root.join(FINAL_DIR),
            overlay1_dir: assets.join("Overlay1"),
            overlay2_dir: assets.join("Overlay2"),
            config_file: root.join(CONFIG_FILE),
            preset_file: root.join(PRESET_FILE),
            assets,
            root,
            name,
        }
    }

    pub fn stage_dirs(&self) -> [&Path; 8] {
        [
            &self.scripts,
            &self.working,
            &self.completed,
            &self.error,
            &self.final_dir,
            &self.assets,
            &self.overlay1_dir,
            &self.overlay2_dir,
        ]
    }

    /// Creates every stage directory that does not exist yet.
    pub fn ensure(&self) -> ChannelResult<()> {
        for dir in self.stage_dirs() {
            if !dir.is_dir() {
                fs::create_dir_all(dir).map_err(io_error(dir))?;
                debug!(channel = %self.name, path = %dir.display(), "created stage directory");
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> ChannelResult<()> {
        for document in [&self.config_file, &self.preset_file] {
            if !document.is_file() {
                return Err(ChannelError::MissingDocument {
                    channel: self.name.clone(),
                    path: document.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn load_documents(&self) -> ChannelResult<ChannelDocuments> {
        self.validate()?;
        Ok(ChannelDocuments::load(&self.config_file, &self.preset_file)?)
    }

    pub fn overlay1(&self) -> PathBuf {
        self.overlay1_dir.join("overlay1.png")
    }

    pub fn require_overlay1(&self) -> ChannelResult<PathBuf> {
        let path = self.overlay1();
        if path.is_file() {
            Ok(path)
        } else {
            Err(ChannelError::MissingAsset(path))
        }
    }

    pub fn pick_overlay2<R: Rng + ?Sized>(&self, rng: &mut R) -> ChannelResult<PathBuf> {
        let candidates = files_with_extension(&self.overlay2_dir, "png")?;
        candidates
            .choose(rng)
            .cloned()
            .ok_or_else(|| ChannelError::MissingAsset(self.overlay2_dir.join("*.png")))
    }

    /// Font and base image used by the thumbnail command.
    pub fn hook_assets(&self) -> ChannelResult<HookAssets> {
        let font = files_with_extension(&self.assets, "ttf")?
            .into_iter()
            .next()
            .ok_or_else(|| ChannelError::MissingAsset(self.assets.join("*.ttf")))?;
        let base_image = files_with_extension(&self.assets, "png")?
            .into_iter()
            .next()
            .ok_or_else(|| ChannelError::MissingAsset(self.assets.join("*.png")))?;
        Ok(HookAssets { font, base_image })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookAssets {
    pub font: PathBuf,
    pub base_image: PathBuf,
}

fn files_with_extension(dir: &Path, extension: &str) -> ChannelResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ChannelError::Io {
                source,
                path: dir.to_path_buf(),
            })
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Lists channel directories under the workflow root, skipping `_`-prefixed
/// entries. The root is created when missing.
pub fn discover_channels(root: impl AsRef<Path>) -> ChannelResult<Vec<ChannelPaths>> {
    let root = root.as_ref();
    if !root.exists() {
        fs::create_dir_all(root).map_err(io_error(root))?;
        info!(root = %root.display(), "created workflow root");
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(root).map_err(io_error(root))? {
        let entry = entry.map_err(io_error(root))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('_') || name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names
        .into_iter()
        .map(|name| ChannelPaths::new(root, name))
        .collect())
}

/// Creates a channel skeleton seeded from the template. Existing documents and
/// assets are left untouched.
pub fn init_channel(root: impl AsRef<Path>, name: &str) -> ChannelResult<ChannelPaths> {
    let root = root.as_ref();
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('_')
        || trimmed.starts_with('.')
        || trimmed.contains(['/', '\\'])
    {
        return Err(ChannelError::InvalidName(name.to_string()));
    }
    let template = ensure_template(root)?;
    let paths = ChannelPaths::new(root, trimmed);
    paths.ensure()?;
    let copies = [
        (template.config_file.clone(), paths.config_file.clone()),
        (template.preset_file.clone(), paths.preset_file.clone()),
        (template.overlay1(), paths.overlay1()),
        (
            template.overlay2_dir.join("overlay2.png"),
            paths.overlay2_dir.join("overlay2.png"),
        ),
    ];
    for (source, destination) in copies {
        if destination.exists() || !source.is_file() {
            continue;
        }
        fs::copy(&source, &destination).map_err(io_error(&destination))?;
    }
    info!(channel = %paths.name, root = %paths.root.display(), "initialized channel");
    Ok(paths)
}
