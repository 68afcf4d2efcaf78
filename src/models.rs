use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, SubburnError};

/// Whisper model sizes the transcriber can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub const ALL: [ModelSize; 5] = [
        ModelSize::Tiny,
        ModelSize::Base,
        ModelSize::Small,
        ModelSize::Medium,
        ModelSize::Large,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Base => "base",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "tiny" => Some(Self::Tiny),
            "base" => Some(Self::Base),
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            _ => None,
        }
    }

    /// GGML model filename; "large" maps to the latest large revision.
    pub fn filename(&self) -> &'static str {
        match self {
            Self::Tiny => "ggml-tiny.bin",
            Self::Base => "ggml-base.bin",
            Self::Small => "ggml-small.bin",
            Self::Medium => "ggml-medium.bin",
            Self::Large => "ggml-large-v3.bin",
        }
    }

    pub fn url(&self) -> String {
        format!(
            "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/{}",
            self.filename()
        )
    }

    pub fn approx_size_bytes(&self) -> u64 {
        match self {
            Self::Tiny => 39_000_000,
            Self::Base => 142_000_000,
            Self::Small => 244_000_000,
            Self::Medium => 769_000_000,
            Self::Large => 1_550_000_000,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Tiny => "Fastest, least accurate",
            Self::Base => "Fast, decent accuracy",
            Self::Small => "Balanced speed/accuracy",
            Self::Medium => "Slower, more accurate",
            Self::Large => "Slowest, most accurate",
        }
    }
}

/// Cache record for one model. `local_path` is populated only when the file
/// is actually on disk at the time of the lookup.
#[derive(Debug, Clone)]
pub struct ModelAsset {
    pub model: ModelSize,
    pub local_path: Option<PathBuf>,
    pub approx_size_bytes: u64,
}

/// Local store of downloaded transcription models. Presence on disk is the
/// sole source of truth; lookups re-check the filesystem every time.
pub struct ModelCache {
    dir: PathBuf,
    client: Client,
    download_guard: Mutex<()>,
}

impl ModelCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let client = Client::builder()
            .user_agent(concat!("subburn/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            dir,
            client,
            download_guard: Mutex::new(()),
        })
    }

    /// Per-user model cache location.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("subburn")
            .join("models")
    }

    pub fn model_path(&self, model: ModelSize) -> PathBuf {
        self.dir.join(model.filename())
    }

    /// Local-storage check only; never touches the network.
    pub fn is_present(&self, model: ModelSize) -> bool {
        self.model_path(model).exists()
    }

    pub fn asset(&self, model: ModelSize) -> ModelAsset {
        let path = self.model_path(model);
        ModelAsset {
            model,
            local_path: path.exists().then_some(path),
            approx_size_bytes: model.approx_size_bytes(),
        }
    }

    /// Download the model if it is not already on disk, reporting progress
    /// as a fraction in [0, 1]. The guard serializes concurrent callers so
    /// the same model is never downloaded twice; a failed download leaves no
    /// partial file behind.
    pub async fn ensure_downloaded(
        &self,
        model: ModelSize,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<ModelAsset> {
        let _guard = self.download_guard.lock().await;

        if self.is_present(model) {
            debug!("Model {} already present", model.name());
            return Ok(self.asset(model));
        }

        let target = self.model_path(model);
        let temp_path = target.with_extension("bin.tmp");

        info!(
            "Downloading {} model (~{:.0} MB)",
            model.name(),
            model.approx_size_bytes() as f64 / 1_000_000.0
        );

        let result = self
            .download_to(model, &temp_path, on_progress)
            .await
            .map_err(|e| {
                SubburnError::Download(format!("downloading model '{}': {e}", model.name()))
            });

        if let Err(e) = result {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(e);
        }

        async_fs::rename(&temp_path, &target).await.map_err(|e| {
            SubburnError::Download(format!("storing model '{}': {e}", model.name()))
        })?;

        info!("Model {} stored at {}", model.name(), target.display());
        Ok(self.asset(model))
    }

    async fn download_to(
        &self,
        model: ModelSize,
        temp_path: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<()> {
        let response = self.client.get(model.url()).send().await?;
        if !response.status().is_success() {
            return Err(SubburnError::Download(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let total = response
            .content_length()
            .unwrap_or(model.approx_size_bytes())
            .max(1);

        let mut file = async_fs::File::create(temp_path).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress((downloaded as f64 / total as f64).min(1.0));
        }

        file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_names_round_trip() {
        for model in ModelSize::ALL {
            assert_eq!(ModelSize::from_name(model.name()), Some(model));
        }
        assert_eq!(ModelSize::from_name("LARGE"), Some(ModelSize::Large));
        assert_eq!(ModelSize::from_name("huge"), None);
    }

    #[test]
    fn test_presence_reflects_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();

        assert!(!cache.is_present(ModelSize::Tiny));
        assert!(cache.asset(ModelSize::Tiny).local_path.is_none());

        std::fs::write(cache.model_path(ModelSize::Tiny), b"stub").unwrap();
        assert!(cache.is_present(ModelSize::Tiny));
        assert_eq!(
            cache.asset(ModelSize::Tiny).local_path,
            Some(cache.model_path(ModelSize::Tiny))
        );
    }
}
