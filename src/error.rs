use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubburnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid value for '{key}': {message}")]
    Validation { key: String, message: String },

    #[error("malformed subtitle data: {0}")]
    Format(String),

    #[error("transcription produced no usable segments")]
    EmptyTranscript,

    #[error("translated text count ({actual}) does not match entry count ({expected})")]
    Alignment { expected: usize, actual: usize },

    #[error("audio extraction failed: {0}")]
    Extraction(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("translation failed: {0}")]
    Translation(String),

    #[error("failed to persist output: {0}")]
    Persistence(String),

    #[error("video encoding failed: {0}")]
    Encoding(String),

    #[error("model download failed: {0}")]
    Download(String),

    #[error("a job is already running")]
    JobAlreadyRunning,

    #[error("job was cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl SubburnError {
    /// Whether this is the cooperative-cancellation unwind signal rather
    /// than a real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SubburnError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SubburnError>;
