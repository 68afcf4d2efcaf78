// Transcription abstraction over the external speech-to-text engine.
// The whisper-cli implementation shells out to whisper.cpp; synthetic
// implementations back the pipeline tests.

pub mod whisper_cli;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::pipeline::CancelToken;

/// One timed text segment, in seconds from the start of the audio. The
/// engine produces these with monotonically increasing times.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Progress callback, called with the fraction of audio time processed.
pub type TranscribeProgress<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Main trait for transcription operations
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe an audio file into timed segments. `language` is a source
    /// language hint; `None` lets the engine detect it. Each call restarts
    /// from the beginning of the audio.
    async fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        on_progress: TranscribeProgress<'_>,
        cancel: &CancelToken,
    ) -> Result<Vec<TimedSegment>>;
}

/// Factory for creating transcriber instances
pub struct TranscriberFactory;

impl TranscriberFactory {
    /// Create the default implementation (whisper-cli) for a local model
    /// file.
    pub fn create_default(model_path: PathBuf) -> Box<dyn Transcriber> {
        Box::new(whisper_cli::WhisperCliTranscriber::new(model_path))
    }
}
