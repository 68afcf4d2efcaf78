use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::{TimedSegment, TranscribeProgress, Transcriber};
use crate::error::{Result, SubburnError};
use crate::pipeline::CancelToken;

const WHISPER_BINARY: &str = "whisper-cli";

/// whisper.cpp JSON output shape (`-oj`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhisperCliOutput {
    result: WhisperCliResult,
    transcription: Vec<WhisperCliSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhisperCliResult {
    language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhisperCliSegment {
    offsets: WhisperCliOffsets,
    text: String,
}

/// Segment offsets in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhisperCliOffsets {
    from: i64,
    to: i64,
}

/// Transcriber that shells out to the whisper.cpp CLI with a local GGML
/// model file.
pub struct WhisperCliTranscriber {
    model_path: PathBuf,
}

impl WhisperCliTranscriber {
    pub fn new(model_path: PathBuf) -> Self {
        Self { model_path }
    }
}

#[async_trait]
impl Transcriber for WhisperCliTranscriber {
    async fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        on_progress: TranscribeProgress<'_>,
        cancel: &CancelToken,
    ) -> Result<Vec<TimedSegment>> {
        info!("Transcribing {} with whisper-cli", audio_path.display());

        let temp_dir = tempfile::tempdir()
            .map_err(|e| SubburnError::Transcription(format!("temp directory: {e}")))?;
        let output_prefix = temp_dir.path().join("transcript");

        let mut cmd = Command::new(WHISPER_BINARY);
        cmd.arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(audio_path)
            .arg("-l")
            .arg(language.unwrap_or("auto"))
            .arg("-oj")
            .arg("-of")
            .arg(&output_prefix)
            .arg("--print-progress")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SubburnError::Transcription(format!("failed to start whisper-cli: {e}")))?;

        // whisper-cli reports "progress = NN%" on stderr as it walks the
        // audio; forward that as the stage fraction.
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SubburnError::Transcription("stderr not captured".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();
        let mut stderr_tail: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(SubburnError::Cancelled);
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(fraction) = parse_progress_line(&line) {
                                on_progress(fraction);
                            } else {
                                debug!("whisper-cli: {line}");
                                stderr_tail.push(line);
                                if stderr_tail.len() > 20 {
                                    stderr_tail.remove(0);
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match status {
            Some(status) => status
                .map_err(|e| SubburnError::Transcription(format!("whisper-cli did not run: {e}")))?,
            None => {
                let _ = child.kill().await;
                return Err(SubburnError::Cancelled);
            }
        };

        if !status.success() {
            return Err(SubburnError::Transcription(format!(
                "whisper-cli exited with {status}: {}",
                stderr_tail.join(" | ")
            )));
        }

        let json_path = output_prefix.with_extension("json");
        let content = std::fs::read_to_string(&json_path)
            .map_err(|e| SubburnError::Transcription(format!("missing engine output: {e}")))?;
        let output: WhisperCliOutput = serde_json::from_str(&content)
            .map_err(|e| SubburnError::Transcription(format!("unparseable engine output: {e}")))?;

        debug!("Detected language: {}", output.result.language);

        let segments = output
            .transcription
            .into_iter()
            .map(|segment| TimedSegment {
                start: segment.offsets.from.max(0) as f64 / 1000.0,
                end: segment.offsets.to.max(0) as f64 / 1000.0,
                text: segment.text.trim().to_string(),
            })
            .collect();

        Ok(segments)
    }
}

/// Extract the fraction from a "progress = NN%" stderr line.
fn parse_progress_line(line: &str) -> Option<f64> {
    let rest = line.split("progress =").nth(1)?;
    let percent: f64 = rest.trim().trim_end_matches('%').trim().parse().ok()?;
    Some((percent / 100.0).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_line("whisper_print_progress_callback: progress =  15%"),
            Some(0.15)
        );
        assert_eq!(parse_progress_line("progress = 100%"), Some(1.0));
        assert_eq!(parse_progress_line("loading model..."), None);
    }

    #[test]
    fn test_engine_output_maps_offsets_to_seconds() {
        let json = r#"{
            "result": {"language": "en"},
            "transcription": [
                {"offsets": {"from": 0, "to": 1500}, "text": " Hello."},
                {"offsets": {"from": 1500, "to": 3000}, "text": " World."}
            ]
        }"#;
        let output: WhisperCliOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.transcription.len(), 2);
        assert_eq!(output.transcription[1].offsets.to, 3000);
    }
}
