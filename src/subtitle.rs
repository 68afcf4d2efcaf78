use std::fmt;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, SubburnError};
use crate::transcribe::TimedSegment;

/// Millisecond-precision subtitle timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds.max(0.0) * 1000.0) as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Parse an SRT timestamp in `HH:MM:SS,mmm` form.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (clock, millis) = text
            .split_once(',')
            .ok_or_else(|| SubburnError::Format(format!("invalid timestamp: {text}")))?;

        let parts: Vec<&str> = clock.split(':').collect();
        if parts.len() != 3 {
            return Err(SubburnError::Format(format!("invalid timestamp: {text}")));
        }

        let field = |value: &str| -> Result<u64> {
            value
                .parse::<u64>()
                .map_err(|_| SubburnError::Format(format!("invalid timestamp: {text}")))
        };

        let hours = field(parts[0])?;
        let minutes = field(parts[1])?;
        let seconds = field(parts[2])?;
        let millis = field(millis)?;

        if minutes >= 60 || seconds >= 60 || millis >= 1000 {
            return Err(SubburnError::Format(format!(
                "timestamp component out of range: {text}"
            )));
        }

        Ok(Self(
            hours * 3_600_000 + minutes * 60_000 + seconds * 1_000 + millis,
        ))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.0 / 3_600_000;
        let minutes = (self.0 % 3_600_000) / 60_000;
        let seconds = (self.0 % 60_000) / 1_000;
        let millis = self.0 % 1_000;
        write!(f, "{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
    }
}

/// One numbered caption with its display interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleEntry {
    pub index: usize,
    pub start: Timestamp,
    pub end: Timestamp,
    pub text: String,
}

/// Ordered sequence of subtitle entries, parsed from or serialized to SRT.
///
/// Entries keep their one-based sequential numbering; overlapping intervals
/// are kept as-is and never reordered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubtitleDocument {
    entries: Vec<SubtitleEntry>,
}

impl SubtitleDocument {
    pub fn entries(&self) -> &[SubtitleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse SRT text. Tolerates CRLF line endings, trailing whitespace and
    /// extra blank lines between entries; rejects malformed timestamp pairs,
    /// inverted intervals and non-sequential numbering.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.replace("\r\n", "\n");

        let mut blocks: Vec<Vec<&str>> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                if !current.is_empty() {
                    blocks.push(std::mem::take(&mut current));
                }
            } else {
                current.push(line);
            }
        }
        if !current.is_empty() {
            blocks.push(current);
        }

        let mut entries = Vec::with_capacity(blocks.len());
        for (position, block) in blocks.iter().enumerate() {
            let expected = position + 1;

            let index: usize = block[0].trim().parse().map_err(|_| {
                SubburnError::Format(format!("entry {expected}: invalid index line '{}'", block[0]))
            })?;
            if index != expected {
                return Err(SubburnError::Format(format!(
                    "non-sequential entry numbering: expected {expected}, found {index}"
                )));
            }

            if block.len() < 2 {
                return Err(SubburnError::Format(format!(
                    "entry {expected}: missing timestamp line"
                )));
            }
            let (start_text, end_text) = block[1].split_once("-->").ok_or_else(|| {
                SubburnError::Format(format!("entry {expected}: invalid timestamp line"))
            })?;
            let start = Timestamp::parse(start_text)?;
            let end = Timestamp::parse(end_text)?;
            if end <= start {
                return Err(SubburnError::Format(format!(
                    "entry {expected}: end {end} is not after start {start}"
                )));
            }

            if block.len() < 3 {
                return Err(SubburnError::Format(format!(
                    "entry {expected}: missing subtitle text"
                )));
            }
            let entry_text = block[2..].join("\n");

            entries.push(SubtitleEntry {
                index,
                start,
                end,
                text: entry_text,
            });
        }

        Ok(Self { entries })
    }

    /// Serialize to canonical SRT: index line, timestamp line, text lines,
    /// blank separator. Deterministic for a given document.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!(
                "{}\n{} --> {}\n{}\n\n",
                entry.index, entry.start, entry.end, entry.text
            ));
        }
        out
    }

    /// Build a document from transcription segments, assigning one-based
    /// sequential indices in input order. Segments whose text is blank are
    /// dropped; a zero or negative duration is clamped to one millisecond.
    pub fn from_segments(segments: &[TimedSegment]) -> Result<Self> {
        let mut entries = Vec::with_capacity(segments.len());
        for segment in segments {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            let start = Timestamp::from_seconds(segment.start);
            let mut end = Timestamp::from_seconds(segment.end);
            if end <= start {
                end = Timestamp::from_millis(start.as_millis() + 1);
            }
            entries.push(SubtitleEntry {
                index: entries.len() + 1,
                start,
                end,
                text: text.to_string(),
            });
        }

        if entries.is_empty() {
            return Err(SubburnError::EmptyTranscript);
        }

        Ok(Self { entries })
    }

    /// Replace entry text positionally, leaving indices and timestamps
    /// untouched. The replacement sequence must match the entry count.
    pub fn with_translated_text(&self, translated: &[String]) -> Result<Self> {
        if translated.len() != self.entries.len() {
            return Err(SubburnError::Alignment {
                expected: self.entries.len(),
                actual: translated.len(),
            });
        }

        let entries = self
            .entries
            .iter()
            .zip(translated)
            .map(|(entry, text)| SubtitleEntry {
                index: entry.index,
                start: entry.start,
                end: entry.end,
                text: text.trim().to_string(),
            })
            .collect();

        Ok(Self { entries })
    }

    /// Read and parse an SRT file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading subtitle file: {}", path.display());
        let content = fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Write the document to disk. An existing file is backed up to
    /// `<path>.bak` first, and the new content is synced so later pipeline
    /// stages only ever see durable output.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!("Writing subtitle file: {}", path.display());

        if fs::try_exists(path).await.unwrap_or(false) {
            let backup = path.with_extension("srt.bak");
            fs::copy(path, &backup)
                .await
                .map_err(|e| SubburnError::Persistence(format!("backup failed: {e}")))?;
            debug!("Backed up existing subtitles to {}", backup.display());
        }

        let mut file = fs::File::create(path)
            .await
            .map_err(|e| SubburnError::Persistence(format!("{}: {e}", path.display())))?;
        file.write_all(self.serialize().as_bytes())
            .await
            .map_err(|e| SubburnError::Persistence(format!("{}: {e}", path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| SubburnError::Persistence(format!("{}: {e}", path.display())))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, end: f64, text: &str) -> TimedSegment {
        TimedSegment {
            start,
            end,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(Timestamp::from_seconds(0.0).to_string(), "00:00:00,000");
        assert_eq!(Timestamp::from_seconds(65.123).to_string(), "00:01:05,123");
        assert_eq!(Timestamp::from_seconds(3661.5).to_string(), "01:01:01,500");
    }

    #[test]
    fn test_timestamp_parse() {
        assert_eq!(Timestamp::parse("01:02:03,456").unwrap().as_millis(), 3_723_456);
        assert_eq!(Timestamp::parse(" 00:00:01,000 ").unwrap().as_millis(), 1_000);
        assert!(Timestamp::parse("00:61:00,000").is_err());
        assert!(Timestamp::parse("00:00:00.000").is_err());
        assert!(Timestamp::parse("garbage").is_err());
    }

    #[test]
    fn test_parse_serialize_round_trip() {
        let source = "1\n00:00:00,000 --> 00:00:01,500\nHello there\n\n2\n00:00:01,500 --> 00:00:04,000\nTwo lines\nof text\n\n";
        let doc = SubtitleDocument::parse(source).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.entries()[1].text, "Two lines\nof text");

        let round_tripped = SubtitleDocument::parse(&doc.serialize()).unwrap();
        assert_eq!(doc, round_tripped);
    }

    #[test]
    fn test_parse_tolerates_crlf_and_extra_blank_lines() {
        let source = "1\r\n00:00:00,000 --> 00:00:01,000\r\nHello\r\n\r\n\r\n2\r\n00:00:01,000 --> 00:00:02,000\r\nWorld\r\n\r\n";
        let doc = SubtitleDocument::parse(source).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.entries()[0].text, "Hello");
    }

    #[test]
    fn test_parse_rejects_inverted_interval() {
        let source = "1\n00:00:02,000 --> 00:00:01,000\nBackwards\n";
        assert!(matches!(
            SubtitleDocument::parse(source),
            Err(SubburnError::Format(_))
        ));
    }

    #[test]
    fn test_parse_rejects_non_sequential_numbering() {
        let source = "1\n00:00:00,000 --> 00:00:01,000\nOne\n\n3\n00:00:01,000 --> 00:00:02,000\nThree\n";
        assert!(matches!(
            SubtitleDocument::parse(source),
            Err(SubburnError::Format(_))
        ));
    }

    #[test]
    fn test_from_segments_assigns_sequential_indices() {
        let segments = vec![
            segment(0.0, 1.0, " hello "),
            segment(1.0, 2.5, ""),
            segment(2.5, 4.0, "world"),
        ];
        let doc = SubtitleDocument::from_segments(&segments).unwrap();
        let indices: Vec<usize> = doc.entries().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(doc.entries()[0].text, "hello");
        assert_eq!(doc.entries()[1].start.as_millis(), 2_500);
    }

    #[test]
    fn test_from_segments_clamps_degenerate_duration() {
        let doc = SubtitleDocument::from_segments(&[segment(1.0, 1.0, "blip")]).unwrap();
        assert_eq!(doc.entries()[0].start.as_millis(), 1_000);
        assert_eq!(doc.entries()[0].end.as_millis(), 1_001);
    }

    #[test]
    fn test_from_segments_empty_is_an_error() {
        assert!(matches!(
            SubtitleDocument::from_segments(&[]),
            Err(SubburnError::EmptyTranscript)
        ));
        assert!(matches!(
            SubtitleDocument::from_segments(&[segment(0.0, 1.0, "  ")]),
            Err(SubburnError::EmptyTranscript)
        ));
    }

    #[test]
    fn test_with_translated_text_replaces_only_text() {
        let doc = SubtitleDocument::from_segments(&[
            segment(0.0, 1.0, "one"),
            segment(1.0, 2.0, "two"),
        ])
        .unwrap();

        let translated = doc
            .with_translated_text(&["uno".to_string(), "due".to_string()])
            .unwrap();

        assert_eq!(translated.entries()[0].text, "uno");
        assert_eq!(translated.entries()[1].text, "due");
        for (before, after) in doc.entries().iter().zip(translated.entries()) {
            assert_eq!(before.index, after.index);
            assert_eq!(before.start, after.start);
            assert_eq!(before.end, after.end);
        }
    }

    #[test]
    fn test_with_translated_text_length_mismatch() {
        let doc = SubtitleDocument::from_segments(&[segment(0.0, 1.0, "one")]).unwrap();
        let result = doc.with_translated_text(&[]);
        assert!(matches!(
            result,
            Err(SubburnError::Alignment {
                expected: 1,
                actual: 0
            })
        ));
    }
}
