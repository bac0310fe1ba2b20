use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::load_json;
use crate::error::Result;

/// Voice synthesis knobs. Keys this crate does not know about are kept in
/// `extra` and forwarded verbatim to the voice service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xtts_server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VoiceSettings {
    pub fn template_defaults() -> Self {
        let extra = json!({
            "temperature": 0.75,
            "length_penalty": 1,
            "repetition_penalty": 5,
            "top_k": 50,
            "top_p": 0.85,
            "speed": 1,
            "stream_chunk_size": 200,
            "enable_text_splitting": true,
            "max_sentence_length": 60,
            "enable_sentence_splitting": true,
            "enable_sentence_appending": true,
            "remove_diacritics": false,
            "output_format": "wav",
            "bitrate": "312k",
            "appended_silence": 200,
            "paragraph_silence": 200
        });
        Self {
            xtts_server_url: Some("http://localhost:5002".into()),
            speaker_voice: Some("EN_Ivy_Female".into()),
            language: Some("en".into()),
            extra: match extra {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    /// Returns a copy of `self` with every value present in `overrides` applied.
    pub fn merged_with(&self, overrides: &VoiceSettings) -> VoiceSettings {
        let mut merged = self.clone();
        if overrides.xtts_server_url.is_some() {
            merged.xtts_server_url = overrides.xtts_server_url.clone();
        }
        if overrides.speaker_voice.is_some() {
            merged.speaker_voice = overrides.speaker_voice.clone();
        }
        if overrides.language.is_some() {
            merged.language = overrides.language.clone();
        }
        for (key, value) in &overrides.extra {
            merged.extra.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.xtts_server_url.is_none()
            && self.speaker_voice.is_none()
            && self.language.is_none()
            && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub voice_settings: VoiceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub preset_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            preset_name: "1".into(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhisperSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words_per_segment: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreset {
    #[serde(default)]
    pub video_settings: VideoSettings,
    #[serde(default)]
    pub voice_settings: VoiceSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whisper_settings: Option<WhisperSettings>,
}

/// Both per-channel documents, loaded together at the start of a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDocuments {
    pub config: ChannelConfig,
    pub preset: ChannelPreset,
}

impl ChannelDocuments {
    pub fn load(config_path: &Path, preset_path: &Path) -> Result<Self> {
        Ok(Self {
            config: load_json(config_path)?,
            preset: load_json(preset_path)?,
        })
    }

    /// Channel voice settings with preset values taking precedence.
    pub fn voice_settings(&self) -> VoiceSettings {
        self.config
            .voice_settings
            .merged_with(&self.preset.voice_settings)
    }

    pub fn preset_name(&self) -> &str {
        &self.preset.video_settings.preset_name
    }

    pub fn whisper_settings(&self) -> WhisperSettings {
        self.preset.whisper_settings.clone().unwrap_or_default()
    }
}
