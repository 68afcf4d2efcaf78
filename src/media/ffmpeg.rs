use async_trait::async_trait;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

use super::{MediaCommandBuilder, VideoAdapter};
use crate::error::{Result, SubburnError};
use crate::pipeline::CancelToken;
use crate::settings::{EncodingQuality, SubtitleStyle};

const FFMPEG_BINARY: &str = "ffmpeg";

/// Concrete video adapter backed by the ffmpeg binaries.
pub struct FfmpegAdapter {
    command_builder: MediaCommandBuilder,
}

impl FfmpegAdapter {
    pub fn new() -> Self {
        Self {
            command_builder: MediaCommandBuilder::new(FFMPEG_BINARY),
        }
    }
}

impl Default for FfmpegAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VideoAdapter for FfmpegAdapter {
    async fn extract_audio(
        &self,
        video_path: &Path,
        audio_path: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        info!(
            "Extracting audio from {} to {}",
            video_path.display(),
            audio_path.display()
        );

        let command = self.command_builder.extract_audio(video_path, audio_path);
        command.execute(cancel, SubburnError::Extraction).await?;

        info!("Audio extraction completed");
        Ok(())
    }

    async fn burn_subtitles(
        &self,
        video_path: &Path,
        subtitle_path: &Path,
        output_path: &Path,
        style: &SubtitleStyle,
        quality: &EncodingQuality,
        cancel: &CancelToken,
    ) -> Result<()> {
        info!(
            "Burning subtitles from {} into {} -> {}",
            subtitle_path.display(),
            video_path.display(),
            output_path.display()
        );

        let command = self.command_builder.burn_subtitles(
            video_path,
            subtitle_path,
            output_path,
            style,
            quality,
        );
        command.execute(cancel, SubburnError::Encoding).await?;

        info!("Subtitle burning completed");
        Ok(())
    }

    fn check_availability(&self) -> Result<()> {
        let output = Command::new(FFMPEG_BINARY)
            .arg("-version")
            .output()
            .map_err(|e| SubburnError::Config(format!("ffmpeg not found: {e}")))?;

        if output.status.success() {
            debug!("ffmpeg is available");
            Ok(())
        } else {
            Err(SubburnError::Config(
                "ffmpeg version check failed".to_string(),
            ))
        }
    }
}
