//
// pipeline.rs
// Study-Anonymizer-rs
//
// Drives one study run: pre-flight checks, scanning, parallel copy/anonymize per record, then the ledger append.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use dicom::core::Tag;
use dicom::object::open_file;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::anonymize::{self, AnonymizationPolicy};
use crate::classify::{self, ExclusionReason};
use crate::dicom_access::ElementAccess;
use crate::error::{LedgerError, RecordError, StudyError};
use crate::identifier::{self, Pseudonym};
use crate::ledger::SequenceLedger;
use crate::models::{
    PatientMatch, PipelineState, RunStatus, StudyMetadata, StudyPaths, StudyReport, StudyRow,
    UNKNOWN_STUDY_DATE,
};
use crate::scan;
use crate::storage::{self, OutputTree};

pub const STUDY_DATE: Tag = Tag(0x0008, 0x0020);

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub workers: usize,
    pub policy: AnonymizationPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            policy: AnonymizationPolicy::default(),
        }
    }
}

pub fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

/// Cooperative cancellation flag, checked before each record.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Polling view of a run. `fraction()` never decreases while a run is in flight.
#[derive(Debug)]
pub struct StudyProgress {
    state: Mutex<PipelineState>,
    claimed: AtomicUsize,
    processed: AtomicUsize,
    total: AtomicUsize,
}

impl Default for StudyProgress {
    fn default() -> Self {
        Self {
            state: Mutex::new(PipelineState::Idle),
            claimed: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }
}

impl StudyProgress {
    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return if self.state() == PipelineState::Done { 1.0 } else { 0.0 };
        }
        (self.processed().min(total) as f64) / (total as f64)
    }

    fn begin(&self, total: usize) {
        self.claimed.store(0, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    /// Count one finished record. The published count only ever moves up.
    fn advance(&self) {
        let done = self.claimed.fetch_add(1, Ordering::SeqCst) + 1;
        self.processed.fetch_max(done, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Status(String),
    Progress(f64),
}

/// Shared handles a run reports through.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub progress: Arc<StudyProgress>,
    pub cancel: CancelToken,
    events: Option<Arc<Mutex<Sender<StatusEvent>>>>,
}

impl RunControl {
    pub fn with_events(events: Sender<StatusEvent>) -> Self {
        Self {
            events: Some(Arc::new(Mutex::new(events))),
            ..Self::default()
        }
    }

    fn emit(&self, event: StatusEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send(event);
        }
    }

    fn status(&self, message: impl Into<String>) {
        self.emit(StatusEvent::Status(message.into()));
    }

    /// Count one record and publish the new fraction. Reading the fraction under the sender
    /// lock keeps the emitted values in non-decreasing order across workers.
    fn record_done(&self) {
        self.progress.advance();
        if let Some(events) = &self.events {
            let sender = events.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = sender.send(StatusEvent::Progress(self.progress.fraction()));
        }
    }
}

/// A run started on its own thread.
#[derive(Debug)]
pub struct StudyHandle {
    progress: Arc<StudyProgress>,
    cancel: CancelToken,
    events: Receiver<StatusEvent>,
    join: JoinHandle<Result<StudyReport, StudyError>>,
}

impl StudyHandle {
    pub fn progress(&self) -> &StudyProgress {
        &self.progress
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn events(&self) -> &Receiver<StatusEvent> {
        &self.events
    }

    pub fn join(self) -> Result<StudyReport, StudyError> {
        self.join
            .join()
            .unwrap_or_else(|_| Err(StudyError::Worker("pipeline thread panicked".into())))
    }
}

enum RecordOutcome {
    Skipped,
    Unreadable(String),
    Excluded(ExclusionReason),
    Processed {
        copied: bool,
        anonymized: bool,
        study_date: Option<String>,
        failures: Vec<String>,
    },
}

/// Everything a worker needs to handle one record.
struct RecordJob<'a> {
    source_root: &'a Path,
    originals: &'a OutputTree,
    anonymized: &'a OutputTree,
    pseudonym: &'a Pseudonym,
    policy: AnonymizationPolicy,
}

impl RecordJob<'_> {
    fn process(&self, relative: &Path) -> RecordOutcome {
        let source = self.source_root.join(relative);
        let record = match open_file(&source) {
            Ok(record) => record,
            Err(source_err) => {
                let err = RecordError::Read {
                    path: source.clone(),
                    source: source_err,
                };
                return RecordOutcome::Unreadable(err.to_string());
            }
        };

        if let Some(reason) = classify::exclusion_reason(&record) {
            return RecordOutcome::Excluded(reason);
        }

        let mut failures = Vec::new();

        let copied = match self.originals.copy_original(&source, relative) {
            Ok(_) => true,
            Err(io_err) => {
                let target = self.originals.base().join(relative);
                failures.push(
                    RecordError::Copy {
                        path: source.clone(),
                        target,
                        source: io_err,
                    }
                    .to_string(),
                );
                false
            }
        };

        let anonymized = match self.anonymized.target_for(relative) {
            Ok(target) => {
                match anonymize::anonymize_to(&record, self.pseudonym, self.policy, &target) {
                    Ok(()) => true,
                    Err(err) => {
                        failures.push(err.to_string());
                        false
                    }
                }
            }
            Err(io_err) => {
                failures.push(
                    RecordError::Anonymize {
                        target: self.anonymized.base().join(relative),
                        source: Box::new(io_err),
                    }
                    .to_string(),
                );
                false
            }
        };

        let study_date = record
            .element_str(STUDY_DATE)
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        RecordOutcome::Processed {
            copied,
            anonymized,
            study_date,
            failures,
        }
    }
}

/// Orchestrates study runs against one ledger directory.
#[derive(Debug)]
pub struct StudyPipeline {
    ledger: Arc<SequenceLedger>,
    options: PipelineOptions,
}

impl StudyPipeline {
    pub fn new(ledger: Arc<SequenceLedger>, options: PipelineOptions) -> Self {
        Self { ledger, options }
    }

    pub fn ledger(&self) -> &SequenceLedger {
        &self.ledger
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    pub fn suggest_next_patient_number(&self, project_id: &str) -> Result<String, LedgerError> {
        self.ledger.next_patient_number(project_id)
    }

    pub fn suggest_next_study_number(
        &self,
        project_id: &str,
        patient_seq: &str,
    ) -> Result<u32, LedgerError> {
        self.ledger.next_study_number(project_id, patient_seq)
    }

    pub fn search_patients(
        &self,
        project_id: &str,
        query: &str,
    ) -> Result<Vec<PatientMatch>, LedgerError> {
        self.ledger.search_by_surname(project_id, query)
    }

    /// Run on a background thread; poll or cancel through the returned handle.
    pub fn start_study(self: &Arc<Self>, metadata: StudyMetadata, paths: StudyPaths) -> StudyHandle {
        let (tx, rx) = mpsc::channel();
        let control = RunControl::with_events(tx);
        let progress = Arc::clone(&control.progress);
        let cancel = control.cancel.clone();

        let pipeline = Arc::clone(self);
        let join = thread::spawn(move || pipeline.run(&metadata, &paths, &control));

        StudyHandle {
            progress,
            cancel,
            events: rx,
            join,
        }
    }

    /// Run synchronously. Only pre-flight problems are returned as errors; record failures land in the report.
    pub fn run(
        &self,
        metadata: &StudyMetadata,
        paths: &StudyPaths,
        control: &RunControl,
    ) -> Result<StudyReport, StudyError> {
        let result = self.run_inner(metadata, paths, control);
        match &result {
            Ok(_) => control.progress.set_state(PipelineState::Done),
            Err(err) => {
                warn!(%err, "study run failed");
                control.status(format!("Study failed: {err}"));
                control.progress.set_state(PipelineState::Failed);
            }
        }
        result
    }

    fn run_inner(
        &self,
        metadata: &StudyMetadata,
        paths: &StudyPaths,
        control: &RunControl,
    ) -> Result<StudyReport, StudyError> {
        let started_at = Utc::now();
        control.progress.set_state(PipelineState::Scanning);

        if !paths.source_root.is_dir() {
            return Err(StudyError::InvalidInput(format!(
                "source directory {} is not readable",
                paths.source_root.display()
            )));
        }
        let output_roots = [&paths.originals_root, &paths.anonymized_root];
        for root in output_roots {
            if !storage::is_creatable_dir(root) {
                return Err(StudyError::InvalidInput(format!(
                    "output directory {} cannot be created",
                    root.display()
                )));
            }
        }

        let project_id = metadata.project_id();
        let patient_seq = metadata.patient_seq();
        self.ledger.ledger_path(project_id)?;

        // Held until the ledger row is written so concurrent runs get distinct numbers.
        let reservation = self.ledger.reserve_study_number(project_id, patient_seq)?;
        let study_number = reservation.number();
        if let Some(requested) = metadata.requested_study_number() {
            if requested != study_number {
                warn!(
                    requested,
                    study_number, "requested study number is stale, using the ledger's next number"
                );
                control.status(format!(
                    "Study number {requested} is no longer free, using {study_number}"
                ));
            }
        }

        let pseudonym =
            identifier::build(project_id, metadata.modality(), study_number, patient_seq)?;
        let folder_name = pseudonym.folder_name();
        let originals = OutputTree::new(&paths.originals_root, &folder_name);
        let anonymized = OutputTree::new(&paths.anonymized_root, &folder_name);

        info!(
            source = %paths.source_root.display(),
            pseudonym = %pseudonym,
            "scanning for records"
        );
        control.status("Scanning for DICOM files...");
        let summary = scan::scan(&paths.source_root)?;
        if summary.records.is_empty() {
            return Err(StudyError::NoRecordsFound(paths.source_root.clone()));
        }
        for rejected in &summary.rejected {
            control.status(format!("Skipping unparseable file {}", rejected.display()));
        }
        for unreadable in &summary.unreadable {
            control.status(format!("Skipping unreadable entry {}", unreadable.display()));
        }

        for root in output_roots {
            std::fs::create_dir_all(root).map_err(|e| {
                StudyError::InvalidInput(format!("cannot create {}: {e}", root.display()))
            })?;
        }

        let discovered = summary.records.len();
        control.progress.begin(discovered);
        control.progress.set_state(PipelineState::Processing);
        control.status(format!("Found {discovered} records. Starting processing..."));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers.max(1))
            .build()
            .map_err(|e| StudyError::Worker(e.to_string()))?;

        let job = RecordJob {
            source_root: &paths.source_root,
            originals: &originals,
            anonymized: &anonymized,
            pseudonym: &pseudonym,
            policy: self.options.policy,
        };

        let outcomes: Vec<RecordOutcome> = pool.install(|| {
            summary
                .records
                .par_iter()
                .map(|relative| {
                    let outcome = if control.cancel.is_cancelled() {
                        RecordOutcome::Skipped
                    } else {
                        job.process(relative)
                    };
                    report_outcome(control, relative, &outcome);
                    control.record_done();
                    outcome
                })
                .collect()
        });

        control.progress.set_state(PipelineState::Finalizing);

        let mut excluded = 0;
        let mut copied = 0;
        let mut anonymized_count = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut failures = Vec::new();
        let mut study_date: Option<String> = None;

        for outcome in outcomes {
            match outcome {
                RecordOutcome::Skipped => skipped += 1,
                RecordOutcome::Excluded(_) => excluded += 1,
                RecordOutcome::Unreadable(message) => {
                    failed += 1;
                    failures.push(message);
                }
                RecordOutcome::Processed {
                    copied: was_copied,
                    anonymized: was_anonymized,
                    study_date: date,
                    failures: record_failures,
                } => {
                    copied += usize::from(was_copied);
                    anonymized_count += usize::from(was_anonymized);
                    if !record_failures.is_empty() {
                        failed += 1;
                        failures.extend(record_failures);
                    }
                    if study_date.is_none() {
                        study_date = date;
                    }
                }
            }
        }
        let study_date = study_date.unwrap_or_else(|| UNKNOWN_STUDY_DATE.to_string());

        let cancelled = control.cancel.is_cancelled() && skipped > 0;
        let (ledger_written, ledger_error) = if cancelled {
            info!("run cancelled, leaving the ledger untouched");
            (false, None)
        } else {
            let row = StudyRow {
                patient_id: pseudonym.to_string(),
                first_name: metadata.first_name().to_string(),
                last_name: metadata.last_name().to_string(),
                study_date: study_date.clone(),
                project_id: project_id.to_string(),
                modality: metadata.modality().to_string(),
                patient_seq: patient_seq.to_string(),
                study_number,
            };
            match self.ledger.append(&row) {
                Ok(path) => {
                    control.status(format!("Ledger updated: {}", path.display()));
                    (true, None)
                }
                Err(err) => {
                    warn!(%err, "ledger append failed");
                    control.status(format!("Ledger write failed: {err}"));
                    (false, Some(err.to_string()))
                }
            }
        };
        drop(reservation);

        let status = if cancelled {
            RunStatus::Cancelled
        } else if failed == 0 && ledger_written {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };

        let report = StudyReport {
            status,
            pseudonym: pseudonym.to_string(),
            folder_name,
            study_number,
            study_date,
            discovered,
            excluded,
            copied,
            anonymized: anonymized_count,
            failed,
            skipped,
            failures,
            ledger_written,
            ledger_error,
            originals_dir: originals.base().to_path_buf(),
            anonymized_dir: anonymized.base().to_path_buf(),
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            discovered,
            excluded = report.excluded,
            copied = report.copied,
            anonymized = report.anonymized,
            failed = report.failed,
            status = ?report.status,
            "study run finished"
        );
        control.status(format!(
            "Processed {discovered} records: {} copied, {} anonymized, {} excluded, {} failed.",
            report.copied, report.anonymized, report.excluded, report.failed
        ));
        Ok(report)
    }
}

fn report_outcome(control: &RunControl, relative: &Path, outcome: &RecordOutcome) {
    match outcome {
        RecordOutcome::Skipped => debug!(path = %relative.display(), "skipped after cancellation"),
        RecordOutcome::Excluded(reason) => {
            debug!(path = %relative.display(), %reason, "excluded");
            control.status(format!("Excluded {} ({reason})", relative.display()));
        }
        RecordOutcome::Unreadable(message) => {
            warn!(path = %relative.display(), "{message}");
            control.status(format!("Failed: {message}"));
        }
        RecordOutcome::Processed { failures, .. } => {
            for message in failures {
                warn!(path = %relative.display(), "{message}");
                control.status(format!("Failed: {message}"));
            }
            if failures.is_empty() {
                debug!(path = %relative.display(), "processed");
            }
        }
    }
}
