// Media processing abstraction over the external encoder:
// - commands: ffmpeg command builders
// - ffmpeg: concrete adapter implementation

pub mod commands;
pub mod ffmpeg;

use async_trait::async_trait;
use std::path::Path;

#[cfg(test)]
use mockall::automock;

pub use commands::*;

use crate::error::Result;
use crate::pipeline::CancelToken;
use crate::settings::{EncodingQuality, SubtitleStyle};

/// Main trait for video operations: pulling the audio track out of a
/// container and compositing a subtitle file into the picture stream.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VideoAdapter: Send + Sync {
    /// Extract the audio track to a mono 16 kHz WAV suitable for the
    /// transcriber. Fails when the container is unreadable or carries no
    /// audio track.
    async fn extract_audio(
        &self,
        video_path: &Path,
        audio_path: &Path,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Burn a subtitle file into the video with the given visual style and
    /// encoding quality.
    async fn burn_subtitles(
        &self,
        video_path: &Path,
        subtitle_path: &Path,
        output_path: &Path,
        style: &SubtitleStyle,
        quality: &EncodingQuality,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Check that the encoder binary is runnable.
    fn check_availability(&self) -> Result<()>;
}

/// Factory for creating video adapter instances
pub struct VideoAdapterFactory;

impl VideoAdapterFactory {
    /// Create the default adapter implementation (ffmpeg-based)
    pub fn create_default() -> Box<dyn VideoAdapter> {
        Box::new(ffmpeg::FfmpegAdapter::new())
    }
}
