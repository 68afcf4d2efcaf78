use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Settings file path (defaults to the per-user location)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline on a single video file
    Process {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Translate the subtitles to the configured target language
        #[arg(long)]
        translate: bool,

        /// Write the subtitle file only, skip burning
        #[arg(long)]
        skip_burn: bool,

        /// Use an existing SRT file instead of transcribing
        #[arg(long)]
        subtitles: Option<PathBuf>,

        /// Output directory for generated files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Run the pipeline on every video file in a directory
    Batch {
        /// Input directory containing video files
        #[arg(short, long)]
        input_dir: PathBuf,

        /// Translate the subtitles to the configured target language
        #[arg(long)]
        translate: bool,

        /// Write the subtitle files only, skip burning
        #[arg(long)]
        skip_burn: bool,

        /// Output directory for generated files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Extract the audio track from a video file
    Extract {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Output audio file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Transcribe a video file to subtitles
    Transcribe {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for the subtitle file
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Translate an existing subtitle file
    Translate {
        /// Input subtitle file
        #[arg(short, long)]
        input: PathBuf,

        /// Output subtitle file (defaults to `<stem>_<lang>.srt`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Burn a subtitle file into a video
    Burn {
        /// Input video file
        #[arg(long)]
        video: PathBuf,

        /// Subtitle file to burn
        #[arg(short, long)]
        subtitles: PathBuf,

        /// Output video file (defaults to `<stem>_subbed.mp4`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List transcription models and their download status
    Models {
        /// Download all missing models
        #[arg(long)]
        download: bool,
    },

    /// Show or change persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
pub enum SettingsAction {
    /// Print the effective settings
    Show,

    /// Set one settings key (validated and saved immediately)
    Set {
        /// Settings key, e.g. font_size, crf, model
        key: String,

        /// New value
        value: String,
    },
}
