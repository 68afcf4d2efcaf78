//! subburn - Burned-Subtitle Video Pipeline
//!
//! Main entry point for the subburn CLI, which turns a video file into a
//! burned-subtitle output video using whisper-cli, ollama, and ffmpeg.

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use walkdir::WalkDir;

use subburn::cli::{Args, Commands, SettingsAction};
use subburn::media::{VideoAdapter, VideoAdapterFactory};
use subburn::models::{ModelCache, ModelSize};
use subburn::pipeline::{
    translate_document, CancelToken, JobOutcome, JobRequest, JobStatus, Pipeline,
    PipelineObserver, ProgressEvent, RetryPolicy, StageSelection, SUPPORTED_CONTAINERS,
};
use subburn::settings::{Settings, SettingsPatch, SettingsStore};
use subburn::subtitle::SubtitleDocument;
use subburn::transcribe::{Transcriber, TranscriberFactory};
use subburn::translate::ollama::OllamaTranslator;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose)?;

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(SettingsStore::default_path);
    let store = SettingsStore::load(&settings_path);

    match args.command {
        Commands::Process {
            input,
            translate,
            skip_burn,
            subtitles,
            output_dir,
        } => {
            let settings = store.get();
            let (pipeline, translator) = build_pipeline(&settings)?;
            if translate {
                translator.check_availability().await?;
            }
            install_cancel_handler(&pipeline);

            let transcribe = subtitles.is_none();
            let request = JobRequest {
                video: input,
                subtitles,
                output_dir,
                stages: StageSelection {
                    transcribe,
                    translate,
                    burn: !skip_burn,
                },
            };

            pipeline.start(request, settings)?;
            let outcome = pipeline.wait().await?;
            report_outcome(&outcome)?;
        }
        Commands::Batch {
            input_dir,
            translate,
            skip_burn,
            output_dir,
        } => {
            if !input_dir.is_dir() {
                anyhow::bail!("input path is not a directory: {}", input_dir.display());
            }

            let settings = store.get();
            let (pipeline, translator) = build_pipeline(&settings)?;
            if translate {
                translator.check_availability().await?;
            }
            install_cancel_handler(&pipeline);

            let mut videos = Vec::new();
            for entry in WalkDir::new(&input_dir).into_iter().filter_map(|e| e.ok()) {
                if let Some(extension) = entry.path().extension().and_then(|e| e.to_str()) {
                    if SUPPORTED_CONTAINERS.contains(&extension.to_lowercase().as_str()) {
                        videos.push(entry.path().to_path_buf());
                    }
                }
            }
            info!("Found {} video files to process", videos.len());

            for video in videos {
                let request = JobRequest {
                    video: video.clone(),
                    subtitles: None,
                    output_dir: output_dir.clone(),
                    stages: StageSelection {
                        transcribe: true,
                        translate,
                        burn: !skip_burn,
                    },
                };
                if let Err(e) = pipeline.start(request, settings.clone()) {
                    warn!("Skipping {}: {e}", video.display());
                    continue;
                }

                let outcome = pipeline.wait().await?;
                for warning in &outcome.warnings {
                    warn!("{warning}");
                }
                match outcome.status {
                    JobStatus::Completed => info!("Processed {}", video.display()),
                    JobStatus::Cancelled => {
                        println!("Cancelled");
                        break;
                    }
                    _ => warn!(
                        "Failed to process {}: {}",
                        video.display(),
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ),
                }
            }
        }
        Commands::Extract { input, output } => {
            let video: Arc<dyn VideoAdapter> = Arc::from(VideoAdapterFactory::create_default());
            video.check_availability()?;
            let cancel = cancellable_token();

            match video.extract_audio(&input, &output, &cancel).await {
                Ok(()) => println!("Audio written to {}", output.display()),
                Err(e) if e.is_cancellation() => {
                    let _ = tokio::fs::remove_file(&output).await;
                    println!("Cancelled");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Transcribe { input, output_dir } => {
            let settings = store.get();
            let (pipeline, _translator) = build_pipeline(&settings)?;
            install_cancel_handler(&pipeline);

            let request = JobRequest {
                video: input,
                subtitles: None,
                output_dir,
                stages: StageSelection {
                    transcribe: true,
                    translate: false,
                    burn: false,
                },
            };
            pipeline.start(request, settings)?;
            let outcome = pipeline.wait().await?;
            report_outcome(&outcome)?;
        }
        Commands::Translate { input, output } => {
            let settings = store.get();
            settings.validate()?;

            let translator = OllamaTranslator::new();
            translator.check_availability().await?;

            let document = SubtitleDocument::load(&input).await?;
            let output = output.unwrap_or_else(|| {
                let stem = input
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "subtitles".to_string());
                input.with_file_name(format!("{stem}_{}.srt", settings.target_language))
            });

            let bar = ProgressBar::new(document.len() as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} entries")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            let on_entry_done = |done: usize, _total: usize| bar.set_position(done as u64);

            let cancel = cancellable_token();
            let (translated, warnings) = translate_document(
                &document,
                &translator,
                &settings.source_language,
                &settings.target_language,
                RetryPolicy::default(),
                &cancel,
                &on_entry_done,
            )
            .await?;
            bar.finish();

            for warning in &warnings {
                warn!("{warning}");
            }
            translated.save(&output).await?;
            println!("Translated subtitles: {}", output.display());
        }
        Commands::Burn {
            video,
            subtitles,
            output,
        } => {
            let settings = store.get();
            settings.validate()?;

            let adapter: Arc<dyn VideoAdapter> = Arc::from(VideoAdapterFactory::create_default());
            adapter.check_availability()?;

            // Parse up front so a malformed file is rejected before the
            // encoder runs.
            let document = SubtitleDocument::load(&subtitles).await?;
            info!("Burning {} subtitle entries", document.len());

            let output = output.unwrap_or_else(|| {
                let stem = video
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "output".to_string());
                video.with_file_name(format!("{stem}_subbed.mp4"))
            });

            let cancel = cancellable_token();
            let result = adapter
                .burn_subtitles(
                    &video,
                    &subtitles,
                    &output,
                    &settings.subtitle_style(),
                    &settings.encoding_quality(),
                    &cancel,
                )
                .await;
            match result {
                Ok(()) => println!("Output video: {}", output.display()),
                Err(e) if e.is_cancellation() => {
                    let _ = tokio::fs::remove_file(&output).await;
                    println!("Cancelled");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Models { download } => {
            let cache = ModelCache::new(ModelCache::default_dir())?;

            println!("\nAvailable transcription models:");
            println!(
                "{:<8} {:<22} {:>9}  {:<26} {:<10}",
                "Name", "Filename", "Size (MB)", "Description", "Status"
            );
            println!("{}", "-".repeat(80));
            for model in ModelSize::ALL {
                let status = if cache.is_present(model) {
                    "Downloaded"
                } else {
                    "Missing"
                };
                println!(
                    "{:<8} {:<22} {:>9.0}  {:<26} {:<10}",
                    model.name(),
                    model.filename(),
                    model.approx_size_bytes() as f64 / 1_000_000.0,
                    model.description(),
                    status
                );
            }

            if download {
                for model in ModelSize::ALL {
                    if cache.is_present(model) {
                        continue;
                    }
                    let bar = ProgressBar::new(100);
                    bar.set_style(
                        ProgressStyle::default_bar()
                            .template(
                                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}",
                            )
                            .unwrap()
                            .progress_chars("#>-"),
                    );
                    bar.set_message(model.name());
                    let progress = {
                        let bar = bar.clone();
                        move |fraction: f64| bar.set_position((fraction * 100.0) as u64)
                    };
                    cache.ensure_downloaded(model, &progress).await?;
                    bar.finish_with_message(format!("Downloaded {}", model.name()));
                }
            }
        }
        Commands::Settings { action } => match action {
            SettingsAction::Show => {
                let settings = store.get();
                print!("{}", toml::to_string_pretty(&settings)?);
            }
            SettingsAction::Set { key, value } => {
                store.update(SettingsPatch::from_key_value(&key, &value)?)?;
                println!("{key} = {value}");
            }
        },
    }

    Ok(())
}

/// Progress bar observer for pipeline jobs.
struct ConsoleObserver {
    bar: ProgressBar,
}

impl ConsoleObserver {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        Self { bar }
    }
}

impl PipelineObserver for ConsoleObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        self.bar.set_position((event.fraction * 100.0) as u64);
        self.bar.set_message(event.message.clone());
    }

    fn on_finished(&self, outcome: &JobOutcome) {
        match outcome.status {
            JobStatus::Completed => self.bar.finish_with_message("Completed"),
            JobStatus::Cancelled => self.bar.abandon_with_message("Cancelled"),
            _ => self.bar.abandon_with_message("Failed"),
        }
    }
}

/// Wire up the real adapters behind a pipeline. The translator is also
/// returned directly so commands can probe its availability first.
fn build_pipeline(
    settings: &Settings,
) -> Result<(Arc<Pipeline>, Arc<OllamaTranslator>)> {
    let models = Arc::new(ModelCache::new(ModelCache::default_dir())?);
    let transcriber: Arc<dyn Transcriber> = Arc::from(TranscriberFactory::create_default(
        models.model_path(settings.model),
    ));
    let translator = Arc::new(OllamaTranslator::new());
    let video: Arc<dyn VideoAdapter> = Arc::from(VideoAdapterFactory::create_default());
    video.check_availability()?;

    let pipeline = Pipeline::new(
        transcriber,
        translator.clone(),
        video,
        models,
        Arc::new(ConsoleObserver::new()),
    );
    Ok((Arc::new(pipeline), translator))
}

/// Ctrl-C cancels the running pipeline job instead of killing the process
/// outright, so partial outputs are cleaned up.
fn install_cancel_handler(pipeline: &Arc<Pipeline>) {
    let pipeline = pipeline.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            pipeline.cancel();
        }
    });
}

/// Fresh cancel token wired to Ctrl-C, for commands that drive an adapter
/// directly.
fn cancellable_token() -> CancelToken {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handler.cancel();
        }
    });
    cancel
}

fn report_outcome(outcome: &JobOutcome) -> Result<()> {
    for warning in &outcome.warnings {
        warn!("{warning}");
    }

    match outcome.status {
        JobStatus::Completed => {
            if let Some(path) = &outcome.outputs.subtitles {
                println!("Subtitles: {}", path.display());
            }
            if let Some(path) = &outcome.outputs.translated_subtitles {
                println!("Translated subtitles: {}", path.display());
            }
            if let Some(path) = &outcome.outputs.video {
                println!("Output video: {}", path.display());
            }
            Ok(())
        }
        JobStatus::Cancelled => {
            println!("Cancelled");
            Ok(())
        }
        _ => anyhow::bail!(
            "{}",
            outcome.error.as_deref().unwrap_or("job failed")
        ),
    }
}

/// Setup logging to both console and a daily-rolling file in the per-user
/// data directory.
fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("subburn")
        .join("log");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = rolling::daily(&log_dir, "subburn.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(())
}
