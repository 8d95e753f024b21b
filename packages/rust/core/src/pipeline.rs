//! End-to-end study pipeline: snapshot → extract → chunk → task → service → result.
//!
//! Every operation registers a task, checks service availability, drives the
//! service chunk by chunk while reporting progress, and lets the registry
//! release sessions when the task reaches a terminal state.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use studydeck_chunker::{Chunk, chunk};
use studydeck_extract::{
    ExtractionResult, PageSnapshot, SourceMode, ValidationWarning, extract, validate,
};
use studydeck_shared::{
    AppConfig, ChunkingConfig, CombineStrategy, ContentFingerprint, FlashcardSet, OperationType,
    PipelineConfig, ReportResult, ReportSource, Result, StudyDeckError, SummaryFormat,
    SummaryLength, SummaryOptions, SummaryResult, SummaryType, TaskId, TaskResult, TimingRecord,
};
use studydeck_storage::Storage;

use crate::flashcards;
use crate::registry::{CreateOutcome, TaskRegistry};
use crate::report;
use crate::service::{
    Availability, Capability, GenerationService, GenerationSession, SessionSpec,
};

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for pipeline operations.
pub trait ProgressReporter: Send + Sync {
    /// Called as work advances. `percent` is 0..=100.
    fn progress(&self, message: &str, percent: u8);
    /// Called once the task is running, with its duration estimate.
    fn task_started(&self, _task_id: &TaskId, _estimated_seconds: f64) {}
    /// Non-fatal notices: content warnings, model downloads.
    fn advisory(&self, _message: &str) {}
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn progress(&self, _message: &str, _percent: u8) {}
}

// ---------------------------------------------------------------------------
// Prepared content
// ---------------------------------------------------------------------------

/// Validated, fingerprinted, chunked content ready for an operation.
#[derive(Debug, Clone)]
pub struct PreparedContent {
    pub extraction: ExtractionResult,
    pub warnings: Vec<ValidationWarning>,
    pub fingerprint: ContentFingerprint,
    pub chunks: Vec<Chunk>,
}

impl PreparedContent {
    fn unit_count(&self) -> u32 {
        u32::try_from(self.chunks.len()).unwrap_or(u32::MAX)
    }

    fn advise(&self, progress: &dyn ProgressReporter) {
        for warning in &self.extraction.warnings {
            progress.advisory(&warning.to_string());
        }
        for warning in &self.warnings {
            progress.advisory(&warning.to_string());
        }
    }
}

/// Deduplication key for a set of report sources.
pub fn report_fingerprint(sources: &[ReportSource]) -> ContentFingerprint {
    ContentFingerprint::of_parts(
        sources
            .iter()
            .flat_map(|s| [s.title.as_str(), s.url.as_str(), s.text.as_str()]),
    )
}

// ---------------------------------------------------------------------------
// Task context
// ---------------------------------------------------------------------------

/// Handles for one running task.
struct TaskContext<'a> {
    id: TaskId,
    token: CancellationToken,
    registry: &'a TaskRegistry,
    service: &'a dyn GenerationService,
    progress: &'a dyn ProgressReporter,
}

impl TaskContext<'_> {
    fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(StudyDeckError::Cancelled);
        }
        Ok(())
    }

    fn report(&self, percent: f64, message: &str) {
        self.registry.update_progress(&self.id, percent, message);
        self.progress
            .progress(message, percent.clamp(0.0, 100.0).round() as u8);
    }

    /// Open a session owned by this task.
    async fn open(&self, spec: SessionSpec) -> Result<Arc<dyn GenerationSession>> {
        self.checkpoint()?;
        let session = self.service.open_session(spec).await?;
        if !self.registry.attach_session(&self.id, session.clone()) {
            return Err(StudyDeckError::Cancelled);
        }
        Ok(session)
    }

    /// Run one call; a result that arrives after cancellation is discarded.
    async fn run(&self, session: &dyn GenerationSession, input: &str) -> Result<String> {
        self.checkpoint()?;
        let outcome = session.run(input, &self.token).await;
        self.checkpoint()?;
        outcome
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    service: Arc<dyn GenerationService>,
    registry: Arc<TaskRegistry>,
    chunking: ChunkingConfig,
    config: PipelineConfig,
    storage: Option<Arc<Storage>>,
    /// Capabilities we already told the user are downloading.
    advised: Mutex<HashSet<Capability>>,
}

impl Orchestrator {
    pub fn new(
        service: Arc<dyn GenerationService>,
        registry: Arc<TaskRegistry>,
        config: &AppConfig,
    ) -> Self {
        Self {
            service,
            registry,
            chunking: config.chunking.clone(),
            config: config.pipeline.clone(),
            storage: None,
            advised: Mutex::new(HashSet::new()),
        }
    }

    /// Persist timing records to `storage` as tasks complete.
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Extract, validate, fingerprint, and chunk a snapshot.
    pub fn prepare(
        &self,
        snapshot: &PageSnapshot,
        mode: SourceMode,
        progress: &dyn ProgressReporter,
    ) -> Result<PreparedContent> {
        progress.progress("Extracting content", 0);
        let extraction = extract(snapshot, mode);
        let warnings = validate(&extraction)?;
        let fingerprint = extraction.fingerprint();
        let chunks = chunk(&extraction.text, &self.chunking);
        debug!(
            chars = extraction.char_count,
            chunks = chunks.len(),
            source = ?extraction.source_kind,
            "content prepared"
        );
        Ok(PreparedContent {
            extraction,
            warnings,
            fingerprint,
            chunks,
        })
    }

    // -----------------------------------------------------------------------
    // Summarize
    // -----------------------------------------------------------------------

    pub async fn summarize(
        &self,
        snapshot: &PageSnapshot,
        mode: SourceMode,
        options: &SummaryOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<SummaryResult> {
        let prepared = self.prepare(snapshot, mode, progress)?;
        self.summarize_prepared(&prepared, options, progress).await
    }

    #[instrument(skip_all, fields(chunks = prepared.chunks.len(), kind = %options.kind))]
    pub async fn summarize_prepared(
        &self,
        prepared: &PreparedContent,
        options: &SummaryOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<SummaryResult> {
        prepared.advise(progress);
        let ctx = self
            .begin(
                OperationType::Summarize,
                &prepared.fingerprint,
                prepared.unit_count(),
                &[Capability::Summarizer],
                progress,
            )
            .await?;
        let outcome = self
            .summarize_chunks(&ctx, &prepared.chunks, options, 5.0..90.0)
            .await;
        self.finish(&ctx, outcome).await
    }

    /// Summarize `chunks`, reporting per-part progress within `band` percent.
    async fn summarize_chunks(
        &self,
        ctx: &TaskContext<'_>,
        chunks: &[Chunk],
        options: &SummaryOptions,
        band: Range<f64>,
    ) -> Result<SummaryResult> {
        let [first, ..] = chunks else {
            return Err(StudyDeckError::invalid_input("nothing to summarize"));
        };
        let total = chunks.len();

        if total == 1 {
            ctx.report(band.start, "Summarizing");
            let session = ctx.open(SessionSpec::Summarizer(options.clone())).await?;
            let midpoint = (band.start + band.end) / 2.0;
            let text = self.run_summary(ctx, session.as_ref(), &first.text, midpoint).await?;
            return Ok(SummaryResult {
                text: text.trim().to_string(),
                chunk_count: 1,
                strategy: CombineStrategy::Single,
            });
        }

        let session = ctx
            .open(SessionSpec::Summarizer(options.with_length(SummaryLength::Short)))
            .await?;
        let mut partials = Vec::with_capacity(total);
        for (i, c) in chunks.iter().enumerate() {
            let percent = band.start + (band.end - band.start) * i as f64 / total as f64;
            ctx.report(percent, &format!("Summarizing part {} of {total}", i + 1));
            let text = ctx.run(session.as_ref(), &c.text).await?;
            partials.push(text.trim().to_string());
        }

        if options.kind == SummaryType::KeyPoints {
            return Ok(SummaryResult {
                text: sectioned(chunks, &partials, options.format),
                chunk_count: total,
                strategy: CombineStrategy::Sectioned,
            });
        }

        let joined = partials.join("\n\n");
        let joined_chars = joined.chars().count();
        if joined_chars >= self.config.summary_combine_limit {
            debug!(joined_chars, "chunk summaries too large to combine; concatenating");
            return Ok(SummaryResult {
                text: joined,
                chunk_count: total,
                strategy: CombineStrategy::Concatenated,
            });
        }

        ctx.report(band.end, "Combining summaries");
        let combiner = ctx.open(SessionSpec::Summarizer(options.clone())).await?;
        let text = self.run_summary(ctx, combiner.as_ref(), &joined, band.end).await?;
        Ok(SummaryResult {
            text: text.trim().to_string(),
            chunk_count: total,
            strategy: CombineStrategy::SummaryOfSummaries,
        })
    }

    /// Final summarization call, streamed when configured. Only the latest
    /// snapshot is kept.
    async fn run_summary(
        &self,
        ctx: &TaskContext<'_>,
        session: &dyn GenerationSession,
        input: &str,
        percent: f64,
    ) -> Result<String> {
        if !self.config.stream_summaries {
            return ctx.run(session, input).await;
        }

        ctx.checkpoint()?;
        let (tx, mut rx) = watch::channel(String::new());
        let run = session.run_streaming(input, &ctx.token, &tx);
        tokio::pin!(run);

        let outcome = loop {
            tokio::select! {
                biased;
                changed = rx.changed() => {
                    if changed.is_ok() {
                        let received = rx.borrow_and_update().chars().count();
                        ctx.report(percent, &format!("Receiving summary ({received} characters)"));
                    }
                }
                outcome = &mut run => break outcome,
            }
        };
        ctx.checkpoint()?;
        outcome
    }

    // -----------------------------------------------------------------------
    // Flashcards
    // -----------------------------------------------------------------------

    pub async fn generate_flashcards(
        &self,
        snapshot: &PageSnapshot,
        mode: SourceMode,
        count: usize,
        progress: &dyn ProgressReporter,
    ) -> Result<FlashcardSet> {
        if count == 0 {
            return Err(StudyDeckError::invalid_input("flashcard count must be at least 1"));
        }
        let prepared = self.prepare(snapshot, mode, progress)?;
        self.generate_flashcards_prepared(&prepared, count, progress)
            .await
    }

    #[instrument(skip_all, fields(chunks = prepared.chunks.len(), count = count))]
    pub async fn generate_flashcards_prepared(
        &self,
        prepared: &PreparedContent,
        count: usize,
        progress: &dyn ProgressReporter,
    ) -> Result<FlashcardSet> {
        if count == 0 {
            return Err(StudyDeckError::invalid_input("flashcard count must be at least 1"));
        }
        prepared.advise(progress);
        let ctx = self
            .begin(
                OperationType::Flashcards,
                &prepared.fingerprint,
                prepared.unit_count(),
                &[Capability::Structured],
                progress,
            )
            .await?;
        let outcome = self.flashcards_for_chunks(&ctx, &prepared.chunks, count).await;
        self.finish(&ctx, outcome).await
    }

    async fn flashcards_for_chunks(
        &self,
        ctx: &TaskContext<'_>,
        chunks: &[Chunk],
        count: usize,
    ) -> Result<FlashcardSet> {
        let total = chunks.len().max(1);
        let per_chunk = count.div_ceil(total);
        let session = ctx
            .open(SessionSpec::Structured {
                schema: flashcards::schema(),
            })
            .await?;

        let mut cards = Vec::with_capacity(count);
        for (i, c) in chunks.iter().enumerate() {
            if cards.len() >= count {
                break;
            }
            let percent = 5.0 + 90.0 * i as f64 / total as f64;
            ctx.report(
                percent,
                &format!("Writing flashcards for part {} of {total}", i + 1),
            );
            let raw = ctx
                .run(session.as_ref(), &flashcards::prompt(per_chunk, &c.text))
                .await?;
            let parsed = flashcards::parse(&raw)?;
            debug!(part = i + 1, parsed = parsed.len(), "flashcards parsed");
            cards.extend(parsed);
        }

        cards.truncate(count);
        if cards.is_empty() {
            return Err(StudyDeckError::format("the model returned no usable flashcards"));
        }
        Ok(FlashcardSet {
            cards,
            chunk_count: chunks.len(),
        })
    }

    // -----------------------------------------------------------------------
    // Report
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(sources = sources.len()))]
    pub async fn synthesize_report(
        &self,
        sources: &[ReportSource],
        progress: &dyn ProgressReporter,
    ) -> Result<ReportResult> {
        if sources.is_empty() {
            return Err(StudyDeckError::invalid_input("no report sources given"));
        }
        if sources.iter().all(|s| s.text.trim().is_empty()) {
            return Err(StudyDeckError::invalid_input("report sources contain no text"));
        }

        let limit = self.config.report_source_limit;
        let needs_condensing = sources.iter().any(|s| s.text.chars().count() > limit);
        let capabilities: &[Capability] = if needs_condensing {
            &[Capability::Text, Capability::Summarizer]
        } else {
            &[Capability::Text]
        };

        let ctx = self
            .begin(
                OperationType::Report,
                &report_fingerprint(sources),
                u32::try_from(sources.len()).unwrap_or(u32::MAX),
                capabilities,
                progress,
            )
            .await?;
        let outcome = self.report_for_sources(&ctx, sources).await;
        self.finish(&ctx, outcome).await
    }

    async fn report_for_sources(
        &self,
        ctx: &TaskContext<'_>,
        sources: &[ReportSource],
    ) -> Result<ReportResult> {
        let total = sources.len();
        let limit = self.config.report_source_limit;
        let share = 60.0 / total as f64;
        let mut texts = Vec::with_capacity(total);
        let mut presummarized = 0;

        for (i, source) in sources.iter().enumerate() {
            if source.text.trim().is_empty() || source.text.chars().count() <= limit {
                texts.push(source.text.clone());
                continue;
            }

            let start = 5.0 + share * i as f64;
            ctx.report(start, &format!("Condensing source {} of {total}", i + 1));
            // Long sources go through the chunker so no single run exceeds max_size.
            let chunks = chunk(&source.text, &self.chunking);
            debug!(source = i + 1, chunks = chunks.len(), "condensing report source");
            let condensed = self
                .summarize_chunks(ctx, &chunks, &condense_options(), start..start + share)
                .await?;
            texts.push(condensed.text);
            presummarized += 1;
        }

        ctx.report(70.0, "Writing report");
        let writer = ctx.open(SessionSpec::Text).await?;
        let narrative = ctx
            .run(writer.as_ref(), &report::prompt(sources, &texts))
            .await?;

        Ok(ReportResult {
            text: report::assemble(&narrative, sources),
            source_count: total,
            presummarized,
        })
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Register the task, check availability, and move it to `Running`.
    async fn begin<'a>(
        &'a self,
        operation: OperationType,
        fingerprint: &ContentFingerprint,
        unit_count: u32,
        capabilities: &[Capability],
        progress: &'a dyn ProgressReporter,
    ) -> Result<TaskContext<'a>> {
        let id = match self.registry.create_task(operation, fingerprint) {
            CreateOutcome::Created(id) => id,
            CreateOutcome::Duplicate(id) => {
                return Err(StudyDeckError::DuplicateTask {
                    task_id: id.to_string(),
                });
            }
        };

        for &capability in capabilities {
            if let Err(e) = self.ensure_available(capability, progress).await {
                self.registry.set_error(&id, e.to_string());
                return Err(e);
            }
        }

        let token = self
            .registry
            .cancellation_token(&id)
            .ok_or(StudyDeckError::Cancelled)?;
        let estimate = self
            .registry
            .start(&id, unit_count)
            .ok_or(StudyDeckError::Cancelled)?;

        info!(task_id = %id, %operation, unit_count, estimate, "task running");
        progress.task_started(&id, estimate);

        Ok(TaskContext {
            id,
            token,
            registry: &self.registry,
            service: self.service.as_ref(),
            progress,
        })
    }

    async fn ensure_available(
        &self,
        capability: Capability,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        match self.service.availability(capability).await {
            Ok(Availability::Ready) => Ok(()),
            Ok(Availability::NeedsDownload) => {
                let first_time = self
                    .advised
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(capability);
                if first_time {
                    progress.advisory(&format!(
                        "The on-device {capability} model is still downloading; the first run may be slow."
                    ));
                }
                Ok(())
            }
            Ok(Availability::Unsupported) => Err(StudyDeckError::unavailable(
                capability.as_str(),
                "not supported on this device",
            )),
            Err(e) => Err(StudyDeckError::unavailable(
                capability.as_str(),
                format!("availability check failed: {e}"),
            )),
        }
    }

    /// Move the task to its terminal state for `outcome`.
    async fn finish<T>(&self, ctx: &TaskContext<'_>, outcome: Result<T>) -> Result<T>
    where
        T: Clone + Into<TaskResult>,
    {
        match outcome {
            Ok(value) => {
                ctx.report(100.0, "Done");
                match self.registry.complete(&ctx.id, value.clone().into()) {
                    Some(record) => {
                        self.persist_timing(&record).await;
                        Ok(value)
                    }
                    None => Err(StudyDeckError::Cancelled),
                }
            }
            Err(e) if e.is_cancelled() || ctx.token.is_cancelled() => {
                self.registry.cancel(&ctx.id);
                Err(StudyDeckError::Cancelled)
            }
            Err(e) => {
                self.registry.set_error(&ctx.id, e.to_string());
                Err(e)
            }
        }
    }

    async fn persist_timing(&self, record: &TimingRecord) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.append_timing(record).await {
                warn!(error = %e, "failed to persist timing record");
            }
        }
    }
}

/// Options used to condense oversized report sources.
fn condense_options() -> SummaryOptions {
    SummaryOptions {
        kind: SummaryType::KeyPoints,
        length: SummaryLength::Short,
        format: SummaryFormat::PlainText,
        language: None,
    }
}

/// Chunk summaries grouped under their section headings.
fn sectioned(chunks: &[Chunk], partials: &[String], format: SummaryFormat) -> String {
    let mut out = String::new();
    let mut current: Option<String> = None;

    for (i, (c, summary)) in chunks.iter().zip(partials).enumerate() {
        let heading = c
            .primary_heading()
            .map(|h| h.trim_end_matches(':').trim().to_string())
            .unwrap_or_else(|| format!("Part {}", i + 1));

        if current.as_deref() == Some(heading.as_str()) {
            out.push('\n');
        } else {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            let _ = match format {
                SummaryFormat::Markdown => write!(out, "## {heading}\n\n"),
                SummaryFormat::PlainText => writeln!(out, "{heading}"),
            };
            current = Some(heading);
        }
        out.push_str(summary);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
