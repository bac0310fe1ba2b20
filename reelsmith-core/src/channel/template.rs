use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::ConfigError;

use super::{
    io_error, ChannelConfig, ChannelError, ChannelPaths, ChannelPreset, ChannelResult, VideoSettings,
    VoiceSettings,
};

pub const TEMPLATE_DIR: &str = "_template";

const PLACEHOLDER_PNG: [u8; 67] = [
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// Makes sure `<root>/_template` exists with default documents and placeholder
/// overlays. Files already present are never overwritten.
pub fn ensure_template(root: impl AsRef<Path>) -> ChannelResult<ChannelPaths> {
    let template = ChannelPaths::new(root, TEMPLATE_DIR);
    template.ensure()?;

    let config = ChannelConfig {
        voice_settings: VoiceSettings::template_defaults(),
    };
    let preset = ChannelPreset {
        video_settings: VideoSettings::default(),
        voice_settings: VoiceSettings::template_defaults(),
        whisper_settings: None,
    };
    write_json_if_absent(&template.config_file, &config)?;
    write_json_if_absent(&template.preset_file, &preset)?;
    write_if_absent(&template.overlay1(), &PLACEHOLDER_PNG)?;
    write_if_absent(&template.overlay2_dir.join("overlay2.png"), &PLACEHOLDER_PNG)?;
    Ok(template)
}

fn write_json_if_absent<T: serde::Serialize>(path: &Path, value: &T) -> ChannelResult<()> {
    if path.exists() {
        return Ok(());
    }
    let body = serde_json::to_string_pretty(value).map_err(|source| {
        ChannelError::Document(ConfigError::Json {
            source,
            path: path.to_path_buf(),
        })
    })?;
    write_if_absent(path, body.as_bytes())
}

fn write_if_absent(path: &Path, bytes: &[u8]) -> ChannelResult<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, bytes).map_err(io_error(path))?;
    info!(path = %path.display(), "wrote template file");
    Ok(())
}
