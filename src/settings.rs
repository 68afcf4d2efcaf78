use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Result, SubburnError};
use crate::models::ModelSize;

/// Named colors accepted for subtitle styling, mapped to ASS `&HBBGGRR&`
/// hex by the media layer.
pub const NAMED_COLORS: &[(&str, &str)] = &[
    ("white", "&HFFFFFF&"),
    ("yellow", "&H00FFFF&"),
    ("black", "&H000000&"),
    ("green", "&H00FF00&"),
    ("cyan", "&HFFFF00&"),
    ("gray", "&H808080&"),
];

/// Languages the transcription hint and translation target may use.
pub const LANGUAGES: &[(&str, &str)] = &[
    ("en", "English"),
    ("it", "Italian"),
    ("fr", "French"),
    ("de", "German"),
    ("es", "Spanish"),
    ("pt", "Portuguese"),
    ("nl", "Dutch"),
    ("ru", "Russian"),
    ("zh", "Chinese"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
];

pub fn ass_color_hex(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    NAMED_COLORS
        .iter()
        .find(|(color, _)| *color == lower)
        .map(|(_, hex)| *hex)
}

fn is_language_code(code: &str) -> bool {
    LANGUAGES.iter().any(|(c, _)| *c == code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingPreset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl EncodingPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ultrafast => "ultrafast",
            Self::Superfast => "superfast",
            Self::Veryfast => "veryfast",
            Self::Faster => "faster",
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
            Self::Slower => "slower",
            Self::Veryslow => "veryslow",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "ultrafast" => Some(Self::Ultrafast),
            "superfast" => Some(Self::Superfast),
            "veryfast" => Some(Self::Veryfast),
            "faster" => Some(Self::Faster),
            "fast" => Some(Self::Fast),
            "medium" => Some(Self::Medium),
            "slow" => Some(Self::Slow),
            "slower" => Some(Self::Slower),
            "veryslow" => Some(Self::Veryslow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitlePosition {
    Bottom,
    Top,
}

impl SubtitlePosition {
    /// ASS alignment code: 2 = bottom center, 8 = top center.
    pub fn alignment(&self) -> u8 {
        match self {
            Self::Bottom => 2,
            Self::Top => 8,
        }
    }
}

/// Visual style applied when burning subtitles into the picture stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleStyle {
    pub font_family: String,
    pub font_size: u32,
    pub font_color: String,
    pub outline_color: String,
    pub background_color: Option<String>,
    pub position: SubtitlePosition,
}

/// Encoder quality knobs for the burn stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingQuality {
    pub crf: u8,
    pub preset: EncodingPreset,
}

/// Persisted user preferences. Unknown keys in the settings file are
/// ignored on load; missing keys fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: ModelSize,
    pub source_language: String,
    pub target_language: String,
    pub font_family: String,
    pub font_size: u32,
    pub font_color: String,
    pub outline_color: String,
    pub background_color: String,
    pub position: SubtitlePosition,
    pub crf: u8,
    pub preset: EncodingPreset,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: ModelSize::Base,
            source_language: "auto".to_string(),
            target_language: "en".to_string(),
            font_family: "Arial".to_string(),
            font_size: 24,
            font_color: "white".to_string(),
            outline_color: "black".to_string(),
            background_color: "none".to_string(),
            position: SubtitlePosition::Bottom,
            crf: 23,
            preset: EncodingPreset::Medium,
        }
    }
}

impl Settings {
    /// Check every value against its declared range. Runs at the store
    /// boundary and again on the snapshot taken at job start, so a pipeline
    /// run never discovers a bad value mid-flight.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, message: String| SubburnError::Validation {
            key: key.to_string(),
            message,
        };

        if self.source_language != "auto" && !is_language_code(&self.source_language) {
            return Err(invalid(
                "source_language",
                format!("unknown language code '{}'", self.source_language),
            ));
        }
        if !is_language_code(&self.target_language) {
            return Err(invalid(
                "target_language",
                format!("unknown language code '{}'", self.target_language),
            ));
        }
        if self.font_family.trim().is_empty() {
            return Err(invalid("font_family", "must not be empty".to_string()));
        }
        if !(16..=48).contains(&self.font_size) {
            return Err(invalid(
                "font_size",
                format!("{} is outside the valid range 16-48", self.font_size),
            ));
        }
        if ass_color_hex(&self.font_color).is_none() {
            return Err(invalid(
                "font_color",
                format!("unknown color '{}'", self.font_color),
            ));
        }
        if ass_color_hex(&self.outline_color).is_none() {
            return Err(invalid(
                "outline_color",
                format!("unknown color '{}'", self.outline_color),
            ));
        }
        if self.background_color != "none" && ass_color_hex(&self.background_color).is_none() {
            return Err(invalid(
                "background_color",
                format!("unknown color '{}'", self.background_color),
            ));
        }
        if self.crf > 51 {
            return Err(invalid(
                "crf",
                format!("{} is outside the valid range 0-51", self.crf),
            ));
        }

        Ok(())
    }

    pub fn subtitle_style(&self) -> SubtitleStyle {
        SubtitleStyle {
            font_family: self.font_family.clone(),
            font_size: self.font_size,
            font_color: self.font_color.clone(),
            outline_color: self.outline_color.clone(),
            background_color: if self.background_color == "none" {
                None
            } else {
                Some(self.background_color.clone())
            },
            position: self.position,
        }
    }

    pub fn encoding_quality(&self) -> EncodingQuality {
        EncodingQuality {
            crf: self.crf,
            preset: self.preset,
        }
    }
}

/// Partial settings change; only the populated fields are merged.
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub model: Option<ModelSize>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
    pub font_family: Option<String>,
    pub font_size: Option<u32>,
    pub font_color: Option<String>,
    pub outline_color: Option<String>,
    pub background_color: Option<String>,
    pub position: Option<SubtitlePosition>,
    pub crf: Option<u8>,
    pub preset: Option<EncodingPreset>,
}

impl SettingsPatch {
    /// Build a one-key patch from CLI `settings set <key> <value>` input.
    pub fn from_key_value(key: &str, value: &str) -> Result<Self> {
        let invalid = |message: String| SubburnError::Validation {
            key: key.to_string(),
            message,
        };
        let mut patch = Self::default();

        match key {
            "model" => {
                patch.model = Some(
                    ModelSize::from_name(value)
                        .ok_or_else(|| invalid(format!("unknown model '{value}'")))?,
                );
            }
            "source_language" => patch.source_language = Some(value.to_string()),
            "target_language" => patch.target_language = Some(value.to_string()),
            "font_family" => patch.font_family = Some(value.to_string()),
            "font_size" => {
                patch.font_size =
                    Some(value.parse().map_err(|_| invalid("expected a number".to_string()))?);
            }
            "font_color" => patch.font_color = Some(value.to_string()),
            "outline_color" => patch.outline_color = Some(value.to_string()),
            "background_color" => patch.background_color = Some(value.to_string()),
            "position" => {
                patch.position = Some(match value.to_lowercase().as_str() {
                    "bottom" => SubtitlePosition::Bottom,
                    "top" => SubtitlePosition::Top,
                    _ => return Err(invalid("expected 'bottom' or 'top'".to_string())),
                });
            }
            "crf" => {
                patch.crf =
                    Some(value.parse().map_err(|_| invalid("expected a number".to_string()))?);
            }
            "preset" => {
                patch.preset = Some(
                    EncodingPreset::from_name(value)
                        .ok_or_else(|| invalid(format!("unknown preset '{value}'")))?,
                );
            }
            _ => return Err(invalid("unknown settings key".to_string())),
        }

        Ok(patch)
    }

    fn apply(&self, base: &Settings) -> Settings {
        let mut next = base.clone();
        if let Some(v) = self.model {
            next.model = v;
        }
        if let Some(v) = &self.source_language {
            next.source_language = v.clone();
        }
        if let Some(v) = &self.target_language {
            next.target_language = v.clone();
        }
        if let Some(v) = &self.font_family {
            next.font_family = v.clone();
        }
        if let Some(v) = self.font_size {
            next.font_size = v;
        }
        if let Some(v) = &self.font_color {
            next.font_color = v.clone();
        }
        if let Some(v) = &self.outline_color {
            next.outline_color = v.clone();
        }
        if let Some(v) = &self.background_color {
            next.background_color = v.clone();
        }
        if let Some(v) = self.position {
            next.position = v;
        }
        if let Some(v) = self.crf {
            next.crf = v;
        }
        if let Some(v) = self.preset {
            next.preset = v;
        }
        next
    }
}

/// Process-wide settings store: loaded once at startup, every accepted
/// update is flushed to disk immediately.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Per-user settings file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("subburn")
            .join("settings.toml")
    }

    /// Load persisted settings. A missing file yields the defaults; a
    /// corrupt file is logged and replaced by the defaults, never an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        let settings = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<Settings>(&content) {
                Ok(settings) => match settings.validate() {
                    Ok(()) => settings,
                    Err(e) => {
                        warn!("Settings file {} has an invalid value ({e}), using defaults", path.display());
                        Settings::default()
                    }
                },
                Err(e) => {
                    warn!("Settings file {} is corrupt ({e}), using defaults", path.display());
                    Settings::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => {
                warn!("Could not read settings file {} ({e}), using defaults", path.display());
                Settings::default()
            }
        };

        Self {
            path,
            current: RwLock::new(settings),
        }
    }

    /// Current in-memory snapshot; safe to call from any thread.
    pub fn get(&self) -> Settings {
        self.current.read().expect("settings lock poisoned").clone()
    }

    /// Merge changed keys, validate, persist atomically, then swap the
    /// in-memory copy. On any error the prior value stays in effect both in
    /// memory and on disk.
    pub fn update(&self, patch: SettingsPatch) -> Result<Settings> {
        let candidate = patch.apply(&self.get());
        candidate.validate()?;
        self.persist(&candidate)?;

        let mut guard = self.current.write().expect("settings lock poisoned");
        *guard = candidate.clone();
        info!("Settings updated and saved to {}", self.path.display());
        Ok(candidate)
    }

    /// Write-to-temp-then-rename so a crash mid-write cannot corrupt the
    /// store.
    fn persist(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(settings)
            .map_err(|e| SubburnError::Config(format!("failed to serialize settings: {e}")))?;

        let temp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> SettingsStore {
        SettingsStore::load(dir.path().join("settings.toml"))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        let store = SettingsStore::load(&path);
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_unknown_keys_ignored_and_missing_keys_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "font_size = 32\nsome_future_key = true\n").unwrap();
        let store = SettingsStore::load(&path);
        let settings = store.get();
        assert_eq!(settings.font_size, 32);
        assert_eq!(settings.crf, Settings::default().crf);
    }

    #[test]
    fn test_update_persists_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let store = SettingsStore::load(&path);

        store
            .update(SettingsPatch::from_key_value("crf", "18").unwrap())
            .unwrap();
        assert_eq!(store.get().crf, 18);

        // Reload from disk: the change was flushed immediately.
        let reloaded = SettingsStore::load(&path);
        assert_eq!(reloaded.get().crf, 18);
    }

    #[test]
    fn test_update_out_of_range_rejected_and_prior_value_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let store = SettingsStore::load(&path);
        store
            .update(SettingsPatch::from_key_value("font_size", "20").unwrap())
            .unwrap();

        let err = store
            .update(SettingsPatch::from_key_value("font_size", "5").unwrap())
            .unwrap_err();
        match err {
            SubburnError::Validation { key, .. } => assert_eq!(key, "font_size"),
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(store.get().font_size, 20);
        let reloaded = SettingsStore::load(&path);
        assert_eq!(reloaded.get().font_size, 20);
    }

    #[test]
    fn test_unknown_settings_key_rejected() {
        assert!(SettingsPatch::from_key_value("no_such_key", "1").is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_color_and_language() {
        let mut settings = Settings::default();
        settings.font_color = "magenta".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.target_language = "xx".to_string();
        assert!(settings.validate().is_err());
    }
}
