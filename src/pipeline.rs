use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SubburnError};
use crate::media::VideoAdapter;
use crate::models::ModelCache;
use crate::settings::Settings;
use crate::subtitle::SubtitleDocument;
use crate::transcribe::Transcriber;
use crate::translate::Translator;

/// Video containers the pipeline accepts as input.
pub const SUPPORTED_CONTAINERS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm"];

/// Cooperative cancellation flag shared between the orchestrator's public
/// API and the worker task. Adapters driving external processes await
/// `cancelled()` to know when to kill their child.
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One discrete phase of the pipeline with its own progress tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DownloadingModel,
    ExtractingAudio,
    Transcribing,
    WritingSrt,
    Translating,
    Burning,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::DownloadingModel => "Downloading model",
            Stage::ExtractingAudio => "Extracting audio",
            Stage::Transcribing => "Transcribing",
            Stage::WritingSrt => "Writing subtitles",
            Stage::Translating => "Translating",
            Stage::Burning => "Burning subtitles",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Progress report delivered to the observer. Fractions within a stage are
/// non-decreasing; a stage always reaches 1.0 before the next stage's first
/// event.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub fraction: f64,
    pub message: String,
}

/// Files a job produces, populated per selected stage.
#[derive(Debug, Clone, Default)]
pub struct JobOutputs {
    pub subtitles: Option<PathBuf>,
    pub translated_subtitles: Option<PathBuf>,
    pub video: Option<PathBuf>,
}

/// Terminal report for one job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub outputs: JobOutputs,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// Receives progress and the terminal event. Implementations are called
/// from a forwarder task, never from inside the worker's blocking calls,
/// and must not assume any particular thread.
pub trait PipelineObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
    fn on_finished(&self, outcome: &JobOutcome);
}

/// Which pipeline stages a job runs. Transcription, translation and burning
/// are independently toggleable; audio extraction is implied by
/// transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSelection {
    pub transcribe: bool,
    pub translate: bool,
    pub burn: bool,
}

impl StageSelection {
    pub fn any(&self) -> bool {
        self.transcribe || self.translate || self.burn
    }
}

/// Everything the caller supplies for one run.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub video: PathBuf,
    /// Existing SRT input, required when transcription is not selected.
    pub subtitles: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub stages: StageSelection,
}

/// Run-time record of one job, exclusively owned by the orchestrator and
/// exposed to callers as a snapshot.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub id: Uuid,
    pub video: PathBuf,
    pub outputs: JobOutputs,
    pub stages: StageSelection,
    pub current_stage: Option<Stage>,
    pub stage_fraction: f64,
    pub status: JobStatus,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// Retry bound for per-entry translation failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

enum ObserverMessage {
    Progress(ProgressEvent),
    Finished(JobOutcome),
}

/// Per-stage progress emitter. Fractions are kept monotonic with an atomic
/// max over the f64 bit pattern (valid for non-negative values), so late or
/// out-of-order reports from adapter callbacks can never run backwards.
struct StageReporter {
    tx: mpsc::UnboundedSender<ObserverMessage>,
    state: Arc<Mutex<PipelineJob>>,
    stage: Stage,
    last: AtomicU64,
}

impl StageReporter {
    fn new(
        tx: mpsc::UnboundedSender<ObserverMessage>,
        state: Arc<Mutex<PipelineJob>>,
        stage: Stage,
    ) -> Self {
        Self {
            tx,
            state,
            stage,
            last: AtomicU64::new(0),
        }
    }

    fn report<S: Into<String>>(&self, fraction: f64, message: S) {
        let fraction = fraction.clamp(0.0, 1.0);
        let bits = fraction.to_bits();
        let prev = self.last.fetch_max(bits, Ordering::SeqCst);
        if bits < prev {
            return;
        }

        {
            let mut job = self.state.lock().expect("job state lock poisoned");
            job.stage_fraction = fraction;
        }

        let _ = self.tx.send(ObserverMessage::Progress(ProgressEvent {
            stage: self.stage,
            fraction,
            message: message.into(),
        }));
    }

    fn progress(&self, fraction: f64) {
        self.report(fraction, self.stage.to_string());
    }

    fn complete(&self) {
        if f64::from_bits(self.last.load(Ordering::SeqCst)) < 1.0 {
            self.report(1.0, format!("{} done", self.stage));
        }
    }
}

/// Orders stage transitions: completes the previous stage at 1.0 before the
/// next stage's first event goes out.
struct EventSink {
    tx: mpsc::UnboundedSender<ObserverMessage>,
    state: Arc<Mutex<PipelineJob>>,
    current: Option<Arc<StageReporter>>,
}

impl EventSink {
    fn enter_stage<S: Into<String>>(&mut self, stage: Stage, message: S) -> Arc<StageReporter> {
        if let Some(previous) = self.current.take() {
            previous.complete();
        }

        {
            let mut job = self.state.lock().expect("job state lock poisoned");
            job.current_stage = Some(stage);
            job.stage_fraction = 0.0;
        }

        let reporter = Arc::new(StageReporter::new(self.tx.clone(), self.state.clone(), stage));
        reporter.report(0.0, message);
        self.current = Some(reporter.clone());
        reporter
    }

    fn finish_current(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.complete();
        }
    }

    fn send_finished(&self, outcome: JobOutcome) {
        let _ = self.tx.send(ObserverMessage::Finished(outcome));
    }
}

struct ActiveJob {
    state: Arc<Mutex<PipelineJob>>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    outcome: Arc<Mutex<Option<JobOutcome>>>,
}

/// The processing pipeline orchestrator. Runs one job at a time on a
/// dedicated background task, sequencing model download, audio extraction,
/// transcription, subtitle writing, optional translation and burning, and
/// streams progress to the registered observer.
pub struct Pipeline {
    transcriber: Arc<dyn Transcriber>,
    translator: Arc<dyn Translator>,
    video: Arc<dyn VideoAdapter>,
    models: Arc<ModelCache>,
    observer: Arc<dyn PipelineObserver>,
    retry: RetryPolicy,
    active: Mutex<Option<ActiveJob>>,
}

impl Pipeline {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        translator: Arc<dyn Translator>,
        video: Arc<dyn VideoAdapter>,
        models: Arc<ModelCache>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            transcriber,
            translator,
            video,
            models,
            observer,
            retry: RetryPolicy::default(),
            active: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Begin a job on a background task and return its id. Input, stage
    /// selection and the settings snapshot are validated up front; a second
    /// call while a job is running is rejected without touching the running
    /// job. Must be called from within a tokio runtime.
    pub fn start(&self, request: JobRequest, settings: Settings) -> Result<Uuid> {
        let mut active = self.active.lock().expect("active job lock poisoned");
        if let Some(job) = active.as_ref() {
            let status = job.state.lock().expect("job state lock poisoned").status;
            if status == JobStatus::Running {
                return Err(SubburnError::JobAlreadyRunning);
            }
        }

        validate_request(&request, &settings)?;
        let outputs = resolve_outputs(&request, &settings)?;
        if let Some(dir) = &request.output_dir {
            std::fs::create_dir_all(dir)?;
        }

        let id = Uuid::new_v4();
        info!("Starting pipeline job {id} for {}", request.video.display());

        let state = Arc::new(Mutex::new(PipelineJob {
            id,
            video: request.video.clone(),
            outputs: outputs.clone(),
            stages: request.stages,
            current_stage: None,
            stage_fraction: 0.0,
            status: JobStatus::Running,
            warnings: Vec::new(),
            error: None,
        }));

        let cancel = CancelToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Observer calls happen on their own task so the worker never
        // re-enters caller code from inside a blocking stage.
        let observer = self.observer.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    ObserverMessage::Progress(event) => observer.on_progress(&event),
                    ObserverMessage::Finished(outcome) => observer.on_finished(&outcome),
                }
            }
        });

        let outcome_slot = Arc::new(Mutex::new(None));
        let context = JobContext {
            transcriber: self.transcriber.clone(),
            translator: self.translator.clone(),
            video: self.video.clone(),
            models: self.models.clone(),
            retry: self.retry,
            settings,
            request,
            outputs,
            state: state.clone(),
            events: EventSink {
                tx,
                state: state.clone(),
                current: None,
            },
            cancel: cancel.clone(),
            stage_artifact: None,
            outcome: outcome_slot.clone(),
        };
        let worker = tokio::spawn(drive(context));

        *active = Some(ActiveJob {
            state,
            cancel,
            worker: Some(worker),
            forwarder: Some(forwarder),
            outcome: outcome_slot,
        });

        Ok(id)
    }

    /// Request cancellation of the running job, if any. The worker unwinds
    /// at its next checkpoint; in-flight external processes are killed.
    pub fn cancel(&self) {
        let active = self.active.lock().expect("active job lock poisoned");
        if let Some(job) = active.as_ref() {
            info!("Cancellation requested");
            job.cancel.cancel();
        }
    }

    /// Snapshot of the current (or last) job's run-time record.
    pub fn status(&self) -> Option<PipelineJob> {
        let active = self.active.lock().expect("active job lock poisoned");
        active
            .as_ref()
            .map(|job| job.state.lock().expect("job state lock poisoned").clone())
    }

    /// Wait for the current job to finish and return its terminal report.
    pub async fn wait(&self) -> Result<JobOutcome> {
        let (worker, forwarder) = {
            let mut active = self.active.lock().expect("active job lock poisoned");
            match active.as_mut() {
                Some(job) => (job.worker.take(), job.forwarder.take()),
                None => (None, None),
            }
        };
        if let Some(handle) = worker {
            let _ = handle.await;
        }
        if let Some(handle) = forwarder {
            let _ = handle.await;
        }

        let active = self.active.lock().expect("active job lock poisoned");
        active
            .as_ref()
            .and_then(|job| job.outcome.lock().expect("outcome lock poisoned").clone())
            .ok_or_else(|| SubburnError::Config("no job has been started".to_string()))
    }
}

struct JobContext {
    transcriber: Arc<dyn Transcriber>,
    translator: Arc<dyn Translator>,
    video: Arc<dyn VideoAdapter>,
    models: Arc<ModelCache>,
    retry: RetryPolicy,
    settings: Settings,
    request: JobRequest,
    outputs: JobOutputs,
    state: Arc<Mutex<PipelineJob>>,
    events: EventSink,
    cancel: CancelToken,
    /// Output file of the stage in progress; removed if that stage is
    /// cancelled, cleared once the stage's output is durable.
    stage_artifact: Option<PathBuf>,
    outcome: Arc<Mutex<Option<JobOutcome>>>,
}

impl JobContext {
    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SubburnError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_artifact(&mut self, path: PathBuf) {
        self.stage_artifact = Some(path);
    }

    fn clear_artifact(&mut self) {
        self.stage_artifact = None;
    }

    fn record_warning(&self, warning: String) {
        warn!("{warning}");
        let mut job = self.state.lock().expect("job state lock poisoned");
        job.warnings.push(warning);
    }
}

/// Worker entry point: runs the stages, classifies the result and emits the
/// terminal event.
async fn drive(mut context: JobContext) {
    let result = run_stages(&mut context).await;

    let status = match &result {
        Ok(()) => {
            context.events.finish_current();
            JobStatus::Completed
        }
        Err(e) if e.is_cancellation() => {
            // Remove the in-progress stage's partial output; files from
            // completed stages stay on disk.
            if let Some(artifact) = context.stage_artifact.take() {
                if tokio::fs::remove_file(&artifact).await.is_ok() {
                    info!("Removed partial output {}", artifact.display());
                }
            }
            JobStatus::Cancelled
        }
        Err(_) => JobStatus::Failed,
    };

    let outcome = {
        let mut job = context.state.lock().expect("job state lock poisoned");
        job.status = status;
        if let Err(e) = &result {
            if !e.is_cancellation() {
                let stage = job
                    .current_stage
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "validation".to_string());
                job.error = Some(format!("{stage}: {e}"));
            }
        }
        JobOutcome {
            status,
            outputs: durable_outputs(&job.outputs),
            warnings: job.warnings.clone(),
            error: job.error.clone(),
        }
    };

    match status {
        JobStatus::Completed => info!("Pipeline job completed"),
        JobStatus::Cancelled => info!("Pipeline job cancelled"),
        _ => warn!(
            "Pipeline job failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }

    *context.outcome.lock().expect("outcome lock poisoned") = Some(outcome.clone());
    context.events.send_finished(outcome);
}

async fn run_stages(context: &mut JobContext) -> Result<()> {
    let mut document: SubtitleDocument;
    let mut srt_for_burn: PathBuf;

    if context.request.stages.transcribe {
        let model = context.settings.model;
        let model_asset = if context.models.is_present(model) {
            context.models.asset(model)
        } else {
            let reporter = context.events.enter_stage(
                Stage::DownloadingModel,
                format!("Downloading model '{}'", model.name()),
            );
            let progress = {
                let reporter = reporter.clone();
                move |fraction: f64| reporter.progress(fraction)
            };
            context.models.ensure_downloaded(model, &progress).await?
        };
        let model_path = model_asset.local_path.ok_or_else(|| {
            SubburnError::Download(format!("model '{}' missing after download", model.name()))
        })?;
        debug!("Using model at {}", model_path.display());

        context.check_cancelled()?;
        context
            .events
            .enter_stage(Stage::ExtractingAudio, "Extracting audio track");
        let work_dir = tempfile::tempdir()?;
        let audio_path = work_dir.path().join("audio.wav");
        context
            .video
            .extract_audio(&context.request.video, &audio_path, &context.cancel)
            .await?;

        context.check_cancelled()?;
        let reporter = context
            .events
            .enter_stage(Stage::Transcribing, "Transcribing audio");
        let language_hint = (context.settings.source_language != "auto")
            .then(|| context.settings.source_language.clone());
        let progress = {
            let reporter = reporter.clone();
            move |fraction: f64| reporter.progress(fraction)
        };
        let segments = context
            .transcriber
            .transcribe(
                &audio_path,
                language_hint.as_deref(),
                &progress,
                &context.cancel,
            )
            .await?;

        context.check_cancelled()?;
        context
            .events
            .enter_stage(Stage::WritingSrt, "Writing subtitle file");
        document = SubtitleDocument::from_segments(&segments)?;
        let srt_path = context
            .outputs
            .subtitles
            .clone()
            .expect("transcription output path resolved at start");
        context.set_artifact(srt_path.clone());
        document.save(&srt_path).await?;
        context.clear_artifact();
        srt_for_burn = srt_path;
    } else {
        let input = context
            .request
            .subtitles
            .clone()
            .expect("subtitle input validated at start");
        document = SubtitleDocument::load(&input).await?;
        srt_for_burn = input;
    }

    if context.request.stages.translate {
        context.check_cancelled()?;
        let reporter = context.events.enter_stage(
            Stage::Translating,
            format!("Translating to '{}'", context.settings.target_language),
        );
        let on_entry_done = {
            let reporter = reporter.clone();
            move |done: usize, total: usize| reporter.progress(done as f64 / total as f64)
        };
        let (translated, warnings) = translate_document(
            &document,
            context.translator.as_ref(),
            &context.settings.source_language,
            &context.settings.target_language,
            context.retry,
            &context.cancel,
            &on_entry_done,
        )
        .await?;
        for warning in warnings {
            context.record_warning(warning);
        }

        let path = context
            .outputs
            .translated_subtitles
            .clone()
            .expect("translation output path resolved at start");
        context.set_artifact(path.clone());
        translated.save(&path).await?;
        context.clear_artifact();

        document = translated;
        srt_for_burn = path;
    }

    if context.request.stages.burn {
        context.check_cancelled()?;
        context
            .events
            .enter_stage(Stage::Burning, "Burning subtitles into video");
        debug!("Burning document with {} entries", document.len());

        let output_path = context
            .outputs
            .video
            .clone()
            .expect("burn output path resolved at start");
        let style = context.settings.subtitle_style();
        let quality = context.settings.encoding_quality();

        context.set_artifact(output_path.clone());
        context
            .video
            .burn_subtitles(
                &context.request.video,
                &srt_for_burn,
                &output_path,
                &style,
                &quality,
                &context.cancel,
            )
            .await?;
        context.clear_artifact();
    }

    Ok(())
}

/// Translate every entry of a document, retrying individual failures up to
/// the policy bound. An entry whose retries are exhausted keeps its source
/// text and the failure becomes a returned warning rather than an error;
/// timestamps and numbering are untouched. Checks the cancel flag between
/// entries.
pub async fn translate_document(
    document: &SubtitleDocument,
    translator: &dyn Translator,
    source: &str,
    target: &str,
    retry: RetryPolicy,
    cancel: &CancelToken,
    on_entry_done: &(dyn Fn(usize, usize) + Send + Sync),
) -> Result<(SubtitleDocument, Vec<String>)> {
    let total = document.len();
    let mut texts = Vec::with_capacity(total);
    let mut warnings = Vec::new();

    for (position, entry) in document.entries().iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(SubburnError::Cancelled);
        }

        let mut translated = None;
        let mut last_error = None;
        for attempt in 1..=retry.attempts {
            match translator.translate(&entry.text, source, target).await {
                Ok(text) => {
                    translated = Some(text);
                    break;
                }
                Err(e) => {
                    debug!(
                        "Translation attempt {attempt}/{} for entry {} failed: {e}",
                        retry.attempts, entry.index
                    );
                    last_error = Some(e);
                    if attempt < retry.attempts && !retry.backoff.is_zero() {
                        tokio::time::sleep(retry.backoff * attempt).await;
                    }
                }
            }
        }

        match translated {
            Some(text) => texts.push(text),
            None => {
                let cause = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                warnings.push(format!(
                    "entry {}: translation failed after {} attempts ({cause}), kept source text",
                    entry.index, retry.attempts
                ));
                texts.push(entry.text.clone());
            }
        }

        on_entry_done(position + 1, total);
    }

    let translated = document.with_translated_text(&texts)?;
    Ok((translated, warnings))
}

/// Outputs that made it to disk. Completed stages keep their files even
/// when a later stage fails or is cancelled, and the terminal event only
/// reports what actually exists.
fn durable_outputs(outputs: &JobOutputs) -> JobOutputs {
    let keep = |path: &Option<PathBuf>| path.clone().filter(|p| p.exists());
    JobOutputs {
        subtitles: keep(&outputs.subtitles),
        translated_subtitles: keep(&outputs.translated_subtitles),
        video: keep(&outputs.video),
    }
}

fn validate_request(request: &JobRequest, settings: &Settings) -> Result<()> {
    if !request.stages.any() {
        return Err(SubburnError::Validation {
            key: "stages".to_string(),
            message: "at least one stage must be selected".to_string(),
        });
    }

    settings.validate()?;

    if !request.video.exists() {
        return Err(SubburnError::Validation {
            key: "video".to_string(),
            message: format!("file not found: {}", request.video.display()),
        });
    }
    let extension = request
        .video
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_CONTAINERS.contains(&extension.as_str()) {
        return Err(SubburnError::Validation {
            key: "video".to_string(),
            message: format!("unsupported container '.{extension}'"),
        });
    }

    if !request.stages.transcribe {
        match &request.subtitles {
            None => {
                return Err(SubburnError::Validation {
                    key: "subtitles".to_string(),
                    message: "an input subtitle file is required when transcription is disabled"
                        .to_string(),
                });
            }
            Some(path) if !path.exists() => {
                return Err(SubburnError::Validation {
                    key: "subtitles".to_string(),
                    message: format!("file not found: {}", path.display()),
                });
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Derive output paths from the source stem: `<stem>.srt`,
/// `<stem>_<lang>.srt` and `<stem>_subbed.mp4` next to the input unless an
/// output directory is given.
fn resolve_outputs(request: &JobRequest, settings: &Settings) -> Result<JobOutputs> {
    let stem = request
        .video
        .file_stem()
        .ok_or_else(|| SubburnError::Validation {
            key: "video".to_string(),
            message: "invalid video filename".to_string(),
        })?
        .to_string_lossy()
        .to_string();

    let dir = match &request.output_dir {
        Some(dir) => dir.clone(),
        None => request
            .video
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    Ok(JobOutputs {
        subtitles: request
            .stages
            .transcribe
            .then(|| dir.join(format!("{stem}.srt"))),
        translated_subtitles: request
            .stages
            .translate
            .then(|| dir.join(format!("{stem}_{}.srt", settings.target_language))),
        video: request
            .stages
            .burn
            .then(|| dir.join(format!("{stem}_subbed.mp4"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MockVideoAdapter;
    use crate::models::ModelSize;
    use crate::settings::{EncodingQuality, SubtitleStyle};
    use crate::transcribe::{TimedSegment, TranscribeProgress};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Semaphore;

    struct FakeTranscriber {
        segments: Vec<TimedSegment>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(
            &self,
            _audio_path: &Path,
            _language: Option<&str>,
            on_progress: TranscribeProgress<'_>,
            cancel: &CancelToken,
        ) -> Result<Vec<TimedSegment>> {
            if let Some(gate) = &self.gate {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SubburnError::Cancelled),
                    permit = gate.acquire() => permit.expect("gate closed").forget(),
                }
            }
            on_progress(0.5);
            on_progress(1.0);
            Ok(self.segments.clone())
        }
    }

    /// Uppercases every entry; entries matching `fail_on` fail on every
    /// attempt.
    struct FlakyTranslator {
        fail_on: String,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl FlakyTranslator {
        fn reliable() -> Self {
            Self::failing_on("")
        }

        fn failing_on<S: Into<String>>(text: S) -> Self {
            Self {
                fail_on: text.into(),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls_for(&self, text: &str) -> u32 {
            *self.calls.lock().unwrap().get(text).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl Translator for FlakyTranslator {
        async fn translate(&self, text: &str, _source: &str, _target: &str) -> Result<String> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(text.to_string())
                .or_insert(0) += 1;
            if text == self.fail_on {
                return Err(SubburnError::Translation("synthetic failure".to_string()));
            }
            Ok(text.to_uppercase())
        }
    }

    /// Extraction writes a stub WAV; burning writes the output file.
    struct StubVideoAdapter;

    #[async_trait]
    impl VideoAdapter for StubVideoAdapter {
        async fn extract_audio(
            &self,
            _video_path: &Path,
            audio_path: &Path,
            _cancel: &CancelToken,
        ) -> Result<()> {
            std::fs::write(audio_path, b"wav")?;
            Ok(())
        }

        async fn burn_subtitles(
            &self,
            _video_path: &Path,
            _subtitle_path: &Path,
            output_path: &Path,
            _style: &SubtitleStyle,
            _quality: &EncodingQuality,
            _cancel: &CancelToken,
        ) -> Result<()> {
            std::fs::write(output_path, b"video")?;
            Ok(())
        }

        fn check_availability(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Burn writes a partial output file and then parks until cancellation,
    /// like an external encoder that has to be killed.
    struct HangingBurnAdapter;

    #[async_trait]
    impl VideoAdapter for HangingBurnAdapter {
        async fn extract_audio(
            &self,
            _video_path: &Path,
            audio_path: &Path,
            _cancel: &CancelToken,
        ) -> Result<()> {
            std::fs::write(audio_path, b"wav")?;
            Ok(())
        }

        async fn burn_subtitles(
            &self,
            _video_path: &Path,
            _subtitle_path: &Path,
            output_path: &Path,
            _style: &SubtitleStyle,
            _quality: &EncodingQuality,
            cancel: &CancelToken,
        ) -> Result<()> {
            std::fs::write(output_path, b"partial")?;
            cancel.cancelled().await;
            Err(SubburnError::Cancelled)
        }

        fn check_availability(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingObserver {
        events: Mutex<Vec<ProgressEvent>>,
        finished: Mutex<Option<JobOutcome>>,
    }

    impl PipelineObserver for CollectingObserver {
        fn on_progress(&self, event: &ProgressEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn on_finished(&self, outcome: &JobOutcome) {
            *self.finished.lock().unwrap() = Some(outcome.clone());
        }
    }

    fn segment(start: f64, end: f64, text: &str) -> TimedSegment {
        TimedSegment {
            start,
            end,
            text: text.to_string(),
        }
    }

    fn seeded_models(dir: &Path) -> Arc<ModelCache> {
        let cache = ModelCache::new(dir.join("models")).unwrap();
        std::fs::write(cache.model_path(ModelSize::Base), b"stub").unwrap();
        Arc::new(cache)
    }

    fn video_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("movie.mp4");
        std::fs::write(&path, b"mp4").unwrap();
        path
    }

    fn stages(transcribe: bool, translate: bool, burn: bool) -> StageSelection {
        StageSelection {
            transcribe,
            translate,
            burn,
        }
    }

    fn request(video: PathBuf, selection: StageSelection) -> JobRequest {
        JobRequest {
            video,
            subtitles: None,
            output_dir: None,
            stages: selection,
        }
    }

    fn fast_retries() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_transcribe_and_burn_reaches_completed() {
        let dir = tempfile::tempdir().unwrap();
        let video_path = video_fixture(dir.path());
        let expected_srt = dir.path().join("movie.srt");

        let mut video = MockVideoAdapter::new();
        video
            .expect_extract_audio()
            .times(1)
            .returning(|_, audio_path, _| {
                std::fs::write(audio_path, b"wav").unwrap();
                Ok(())
            });
        let srt_check = expected_srt.clone();
        video
            .expect_burn_subtitles()
            .times(1)
            .withf(move |_, subtitle_path, _, _, _, _| subtitle_path == srt_check.as_path())
            .returning(|_, _, output_path, _, _, _| {
                std::fs::write(output_path, b"video").unwrap();
                Ok(())
            });

        let observer = Arc::new(CollectingObserver::default());
        let pipeline = Pipeline::new(
            Arc::new(FakeTranscriber {
                segments: vec![segment(0.0, 1.0, "hello")],
                gate: None,
            }),
            Arc::new(FlakyTranslator::reliable()),
            Arc::new(video),
            seeded_models(dir.path()),
            observer.clone(),
        );

        pipeline
            .start(
                request(video_path, stages(true, false, true)),
                Settings::default(),
            )
            .unwrap();
        let outcome = pipeline.wait().await.unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert!(outcome.warnings.is_empty());
        assert_eq!(
            std::fs::read_to_string(&expected_srt).unwrap(),
            "1\n00:00:00,000 --> 00:00:01,000\nhello\n\n"
        );
        let burned = outcome.outputs.video.unwrap();
        assert_eq!(burned, dir.path().join("movie_subbed.mp4"));
        assert!(burned.exists());

        // Fractions never decrease within a stage, and a stage reaches 1.0
        // before the next stage's first event.
        let events = observer.events.lock().unwrap();
        assert!(!events.is_empty());
        let mut previous: Option<(Stage, f64)> = None;
        for event in events.iter() {
            if let Some((stage, fraction)) = previous {
                if stage == event.stage {
                    assert!(event.fraction >= fraction);
                } else {
                    assert_eq!(fraction, 1.0, "stage {stage} ended below 1.0");
                }
            }
            previous = Some((event.stage, event.fraction));
        }
        assert!(observer.finished.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_entry_falls_back_to_source_text() {
        let dir = tempfile::tempdir().unwrap();
        let video_path = video_fixture(dir.path());

        let translator = Arc::new(FlakyTranslator::failing_on("two"));
        let pipeline = Pipeline::new(
            Arc::new(FakeTranscriber {
                segments: vec![
                    segment(0.0, 1.0, "one"),
                    segment(1.0, 2.0, "two"),
                    segment(2.0, 3.0, "three"),
                ],
                gate: None,
            }),
            translator.clone(),
            Arc::new(StubVideoAdapter),
            seeded_models(dir.path()),
            Arc::new(CollectingObserver::default()),
        )
        .with_retry_policy(fast_retries());

        pipeline
            .start(
                request(video_path, stages(true, true, false)),
                Settings::default(),
            )
            .unwrap();
        let outcome = pipeline.wait().await.unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("entry 2"));
        assert_eq!(translator.calls_for("two"), 3);

        let translated =
            std::fs::read_to_string(dir.path().join("movie_en.srt")).unwrap();
        let doc = SubtitleDocument::parse(&translated).unwrap();
        let texts: Vec<&str> = doc.entries().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["ONE", "two", "THREE"]);
    }

    #[tokio::test]
    async fn test_cancel_during_burning_keeps_earlier_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let video_path = video_fixture(dir.path());
        let srt_path = dir.path().join("movie.srt");
        let output_path = dir.path().join("movie_subbed.mp4");

        let pipeline = Pipeline::new(
            Arc::new(FakeTranscriber {
                segments: vec![segment(0.0, 1.0, "hello")],
                gate: None,
            }),
            Arc::new(FlakyTranslator::reliable()),
            Arc::new(HangingBurnAdapter),
            seeded_models(dir.path()),
            Arc::new(CollectingObserver::default()),
        );

        pipeline
            .start(
                request(video_path, stages(true, false, true)),
                Settings::default(),
            )
            .unwrap();

        wait_until(|| output_path.exists()).await;
        pipeline.cancel();
        let outcome = pipeline.wait().await.unwrap();

        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert!(!output_path.exists(), "partial output video must be removed");
        assert!(srt_path.exists(), "completed SRT must survive the cancel");
        assert!(outcome.outputs.video.is_none());
        assert_eq!(outcome.outputs.subtitles, Some(srt_path));
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let video_path = video_fixture(dir.path());

        let gate = Arc::new(Semaphore::new(0));
        let pipeline = Pipeline::new(
            Arc::new(FakeTranscriber {
                segments: vec![segment(0.0, 1.0, "hello")],
                gate: Some(gate.clone()),
            }),
            Arc::new(FlakyTranslator::reliable()),
            Arc::new(StubVideoAdapter),
            seeded_models(dir.path()),
            Arc::new(CollectingObserver::default()),
        );

        let id = pipeline
            .start(
                request(video_path.clone(), stages(true, false, false)),
                Settings::default(),
            )
            .unwrap();
        wait_until(|| {
            pipeline
                .status()
                .is_some_and(|job| job.current_stage == Some(Stage::Transcribing))
        })
        .await;

        let second = pipeline.start(
            request(video_path, stages(true, false, false)),
            Settings::default(),
        );
        assert!(matches!(second, Err(SubburnError::JobAlreadyRunning)));

        // The running job is untouched by the rejected start.
        let snapshot = pipeline.status().unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.status, JobStatus::Running);

        gate.add_permits(1);
        let outcome = pipeline.wait().await.unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_validates_request_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let video_path = video_fixture(dir.path());

        let build = || {
            Pipeline::new(
                Arc::new(FakeTranscriber {
                    segments: vec![segment(0.0, 1.0, "hello")],
                    gate: None,
                }),
                Arc::new(FlakyTranslator::reliable()),
                Arc::new(StubVideoAdapter),
                seeded_models(dir.path()),
                Arc::new(CollectingObserver::default()),
            )
        };

        // No stage selected.
        let err = build()
            .start(
                request(video_path.clone(), stages(false, false, false)),
                Settings::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SubburnError::Validation { ref key, .. } if key == "stages"));

        // Missing input file.
        let err = build()
            .start(
                request(dir.path().join("missing.mp4"), stages(true, false, false)),
                Settings::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SubburnError::Validation { ref key, .. } if key == "video"));

        // Unsupported container.
        let text_file = dir.path().join("notes.txt");
        std::fs::write(&text_file, b"x").unwrap();
        let err = build()
            .start(request(text_file, stages(true, false, false)), Settings::default())
            .unwrap_err();
        assert!(matches!(err, SubburnError::Validation { ref key, .. } if key == "video"));

        // Translation without transcription needs an input subtitle file.
        let err = build()
            .start(
                request(video_path, stages(false, true, false)),
                Settings::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SubburnError::Validation { ref key, .. } if key == "subtitles"));
    }

    #[tokio::test]
    async fn test_burn_existing_subtitles_without_transcription() {
        let dir = tempfile::tempdir().unwrap();
        let video_path = video_fixture(dir.path());
        let subtitles = dir.path().join("existing.srt");
        std::fs::write(&subtitles, "1\n00:00:00,000 --> 00:00:01,000\nhi\n\n").unwrap();

        let pipeline = Pipeline::new(
            Arc::new(FakeTranscriber {
                segments: Vec::new(),
                gate: None,
            }),
            Arc::new(FlakyTranslator::reliable()),
            Arc::new(StubVideoAdapter),
            seeded_models(dir.path()),
            Arc::new(CollectingObserver::default()),
        );

        pipeline
            .start(
                JobRequest {
                    video: video_path,
                    subtitles: Some(subtitles),
                    output_dir: None,
                    stages: stages(false, false, true),
                },
                Settings::default(),
            )
            .unwrap();
        let outcome = pipeline.wait().await.unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert!(dir.path().join("movie_subbed.mp4").exists());
        // No transcription ran, so no SRT output is reported.
        assert!(outcome.outputs.subtitles.is_none());
    }
}

