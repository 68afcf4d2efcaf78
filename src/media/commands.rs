use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SubburnError};
use crate::pipeline::CancelToken;
use crate::settings::{ass_color_hex, EncodingQuality, SubtitleStyle};

/// Abstract encoder command representation
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// Disable video
    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    pub fn audio_channels(self, channels: u32) -> Self {
        self.arg("-ac").arg(channels.to_string())
    }

    pub fn audio_bitrate<S: Into<String>>(self, bitrate: S) -> Self {
        self.arg("-b:a").arg(bitrate)
    }

    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-vf").arg(filter)
    }

    /// Run the command, killing the child process if the job is cancelled.
    /// Failures (spawn errors and non-zero exits) are passed to `failure`
    /// for stage-specific classification.
    pub async fn execute<F>(&self, cancel: &CancelToken, failure: F) -> Result<()>
    where
        F: Fn(String) -> SubburnError,
    {
        debug!(
            "Executing encoder command ({}): {} {:?}",
            self.description, self.binary_path, self.args
        );

        let mut child = Command::new(&self.binary_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failure(format!("failed to start {}: {e}", self.binary_path)))?;

        // Drain stderr concurrently; the encoder is chatty enough to fill
        // the pipe buffer otherwise.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(mut stderr) = stderr {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut buffer).await;
            }
            buffer
        });

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match status {
            Some(status) => {
                status.map_err(|e| failure(format!("{} did not run: {e}", self.binary_path)))?
            }
            None => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(SubburnError::Cancelled);
            }
        };

        if !status.success() {
            let stderr_output = stderr_task.await.unwrap_or_default();
            return Err(failure(format!(
                "{} failed: {}",
                self.description,
                stderr_output.trim()
            )));
        }

        Ok(())
    }
}

/// Builder for the encoder operations the pipeline needs
pub struct MediaCommandBuilder {
    binary_path: String,
}

impl MediaCommandBuilder {
    pub fn new<S: Into<String>>(binary_path: S) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Audio extraction: mono 16 kHz PCM WAV, the input format whisper
    /// models expect.
    pub fn extract_audio<P: AsRef<Path>>(&self, video_path: P, audio_path: P) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Audio extraction")
            .input(video_path)
            .no_video()
            .audio_codec("pcm_s16le")
            .audio_sample_rate(16000)
            .audio_channels(1)
            .overwrite()
            .output(audio_path)
    }

    /// Subtitle burning via the subtitles filter with an inline ASS style.
    pub fn burn_subtitles<P: AsRef<Path>>(
        &self,
        video_path: P,
        subtitle_path: P,
        output_path: P,
        style: &SubtitleStyle,
        quality: &EncodingQuality,
    ) -> MediaCommand {
        let force_style = build_force_style(style);
        MediaCommand::new(&self.binary_path, "Subtitle burning")
            .overwrite()
            .input(video_path)
            .video_filter(format!(
                "subtitles='{}':force_style='{}'",
                subtitle_path.as_ref().display(),
                force_style
            ))
            .video_codec("libx264")
            .arg("-preset")
            .arg(quality.preset.as_str())
            .arg("-crf")
            .arg(quality.crf.to_string())
            .audio_codec("aac")
            .audio_bitrate("192k")
            .output(output_path)
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check").arg("-version")
    }
}

/// ASS style string for the subtitles filter. Background colors switch to an
/// opaque box (BorderStyle=3); otherwise an outlined style is used.
fn build_force_style(style: &SubtitleStyle) -> String {
    let mut components = vec![
        format!("FontSize={}", style.font_size),
        format!("FontName={}", style.font_family),
        format!(
            "PrimaryColour={}",
            ass_color_hex(&style.font_color).unwrap_or("&HFFFFFF&")
        ),
        format!(
            "OutlineColour={}",
            ass_color_hex(&style.outline_color).unwrap_or("&H000000&")
        ),
        "MarginL=50".to_string(),
        "MarginR=50".to_string(),
        "MarginV=20".to_string(),
        "Outline=1".to_string(),
        "Shadow=1".to_string(),
        format!("Alignment={}", style.position.alignment()),
    ];

    match &style.background_color {
        Some(color) => {
            components.push(format!(
                "BackColour={}",
                ass_color_hex(color).unwrap_or("&H000000&")
            ));
            components.push("BorderStyle=3".to_string());
        }
        None => components.push("BorderStyle=1".to_string()),
    }

    components.join(",")
}
