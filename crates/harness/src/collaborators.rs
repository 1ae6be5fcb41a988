//! External collaborators of the state machine.
//!
//! Input retrieval, status reporting, failure archival and result transfer
//! sit behind narrow traits. The filesystem implementations here are what
//! the CLI wires up; tests substitute recording doubles.

use crate::context::{relative_to, JobContext};
use chrono::Utc;
use harness_core::artifacts;
use harness_core::events::{EventPayload, EventRecord, StatusUpdatePayload};
use harness_core::Config;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Spectra layouts the tools consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectraKind {
    /// `<dataset>.raw` instrument file.
    Raw,
    /// `<dataset>_scans/` folder of per-scan CSV peak lists.
    ScanCsvFolder,
    /// `<dataset>_dta.txt` concatenated DTA file.
    DtaText,
}

impl SpectraKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::ScanCsvFolder => "scan_csv_folder",
            Self::DtaText => "dta_text",
        }
    }

    /// File or directory name for `dataset`.
    pub fn file_name(&self, dataset: &str) -> String {
        match self {
            Self::Raw => format!("{dataset}.raw"),
            Self::ScanCsvFolder => format!("{dataset}_scans"),
            Self::DtaText => format!("{dataset}_dta.txt"),
        }
    }
}

/// Supplies input files into the working directory.
pub trait ResourceProvider: Send + Sync {
    fn retrieve_file(&self, name: &str, source_dir: &Path, dest_dir: &Path) -> bool;
    fn retrieve_spectra(&self, kind: SpectraKind, ctx: &JobContext) -> bool;
}

/// Fire-and-forget telemetry sink.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, percent_complete: f32, units_processed: u64, state_label: &str);

    /// Lifecycle events (run started, checkpoint saved, run closed).
    fn record_event(&self, _event: &EventPayload) {}
}

/// Keeps partial output of failed runs for postmortem.
pub trait ArchiveOnFailure: Send + Sync {
    fn copy_partial_results(&self, working_dir: &Path);
}

/// Moves final results out of the working directory.
pub trait ResultTransfer: Send + Sync {
    fn copy_results_to_durable_storage(&self, working_dir: &Path, manifest: &[PathBuf]) -> bool;
}

/// Last two components of a working directory, e.g. `Dataset/Job1_Step1`.
fn job_tail(working_dir: &Path) -> PathBuf {
    let mut parts: Vec<_> = working_dir
        .components()
        .rev()
        .take(2)
        .map(|c| c.as_os_str().to_os_string())
        .collect();
    parts.reverse();
    parts.iter().collect()
}

/// Copies inputs from a local or mounted source tree.
#[derive(Debug, Clone, Default)]
pub struct LocalResourceProvider;

impl ResourceProvider for LocalResourceProvider {
    fn retrieve_file(&self, name: &str, source_dir: &Path, dest_dir: &Path) -> bool {
        let src = source_dir.join(name);
        let dest = dest_dir.join(name);
        if dest.is_file() {
            debug!(path = %dest.display(), "input already present");
            return true;
        }
        match artifacts::copy_atomic(&src, &dest) {
            Ok(bytes) => {
                debug!(file = name, bytes, "input retrieved");
                true
            }
            Err(err) => {
                warn!(file = name, source = %src.display(), error = %err, "failed to retrieve input");
                false
            }
        }
    }

    fn retrieve_spectra(&self, kind: SpectraKind, ctx: &JobContext) -> bool {
        let name = kind.file_name(ctx.dataset());
        if kind != SpectraKind::ScanCsvFolder {
            return self.retrieve_file(&name, &ctx.input_dir(), &ctx.working_dir);
        }

        let src = ctx.input_dir().join(&name);
        if !src.is_dir() {
            warn!(dataset = ctx.dataset(), path = %src.display(), "scan folder not found");
            return false;
        }
        match artifacts::copy_dir(&src, &ctx.working_dir.join(&name)) {
            Ok(0) => {
                warn!(dataset = ctx.dataset(), "scan folder is empty");
                false
            }
            Ok(files) => {
                debug!(dataset = ctx.dataset(), files, "scan folder retrieved");
                true
            }
            Err(err) => {
                warn!(dataset = ctx.dataset(), error = %err, "failed to copy scan folder");
                false
            }
        }
    }
}

/// Reports status through tracing only.
#[derive(Debug, Clone, Default)]
pub struct TracingStatusPublisher;

impl StatusPublisher for TracingStatusPublisher {
    fn publish(&self, percent_complete: f32, units_processed: u64, state_label: &str) {
        info!(
            percent = percent_complete,
            units = units_processed,
            state = state_label,
            "status"
        );
    }

    fn record_event(&self, event: &EventPayload) {
        debug!(event = event.event_type().as_str(), "run event");
    }
}

/// Appends one JSON record per status update or event to a log file.
#[derive(Debug)]
pub struct JsonlStatusPublisher {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlStatusPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

impl StatusPublisher for JsonlStatusPublisher {
    fn publish(&self, percent_complete: f32, units_processed: u64, state_label: &str) {
        self.record_event(&EventPayload::StatusUpdate(StatusUpdatePayload::new(
            percent_complete,
            units_processed,
            state_label,
        )));
    }

    fn record_event(&self, event: &EventPayload) {
        let result = EventRecord::new(event)
            .to_json_line()
            .map_err(std::io::Error::other)
            .and_then(|line| self.append(&line));
        if let Err(err) = result {
            warn!(path = %self.path.display(), error = %err, "failed to write status log");
        }
    }
}

/// Copies the working directory into `<root>/<dataset>/<job dir>_<timestamp>`.
#[derive(Debug, Clone)]
pub struct DirectoryFailureArchive {
    root: PathBuf,
}

impl DirectoryFailureArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArchiveOnFailure for DirectoryFailureArchive {
    fn copy_partial_results(&self, working_dir: &Path) {
        if !working_dir.is_dir() {
            warn!(path = %working_dir.display(), "nothing to archive");
            return;
        }
        let tail = job_tail(working_dir);
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut dest = self.root.join(&tail);
        dest.set_file_name(format!(
            "{}_{stamp}",
            tail.file_name().map_or_else(String::new, |n| n.to_string_lossy().to_string())
        ));

        match artifacts::copy_dir(working_dir, &dest) {
            Ok(files) => info!(dest = %dest.display(), files, "partial results archived"),
            Err(err) => warn!(dest = %dest.display(), error = %err, "failed to archive partial results"),
        }
    }
}

/// Copies manifest files into `<root>/<dataset>/<job dir>/`.
#[derive(Debug, Clone)]
pub struct DirectoryResultTransfer {
    root: PathBuf,
}

impl DirectoryResultTransfer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn destination(&self, working_dir: &Path) -> PathBuf {
        self.root.join(job_tail(working_dir))
    }
}

impl ResultTransfer for DirectoryResultTransfer {
    fn copy_results_to_durable_storage(&self, working_dir: &Path, manifest: &[PathBuf]) -> bool {
        let dest_dir = self.destination(working_dir);
        for entry in manifest {
            let src = if entry.is_absolute() {
                entry.clone()
            } else {
                working_dir.join(entry)
            };
            let dest = dest_dir.join(relative_to(&src, working_dir));
            if let Err(err) = artifacts::copy_atomic(&src, &dest) {
                warn!(file = %src.display(), error = %err, "failed to transfer result");
                return false;
            }
        }
        info!(dest = %dest_dir.display(), files = manifest.len(), "results transferred");
        true
    }
}

/// The collaborator set handed to a state machine.
#[derive(Clone)]
pub struct Collaborators {
    pub resources: Arc<dyn ResourceProvider>,
    pub status: Arc<dyn StatusPublisher>,
    pub archive: Arc<dyn ArchiveOnFailure>,
    pub transfer: Arc<dyn ResultTransfer>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Filesystem collaborators rooted at the configured directories.
    pub fn from_config(config: &Config) -> Self {
        let status: Arc<dyn StatusPublisher> = match &config.status_log {
            Some(path) => Arc::new(JsonlStatusPublisher::new(path)),
            None => Arc::new(TracingStatusPublisher),
        };
        Self {
            resources: Arc::new(LocalResourceProvider),
            status,
            archive: Arc::new(DirectoryFailureArchive::new(&config.failure_archive_dir)),
            transfer: Arc::new(DirectoryResultTransfer::new(&config.results_dir)),
        }
    }

    pub fn with_status(mut self, status: Arc<dyn StatusPublisher>) -> Self {
        self.status = status;
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveOnFailure>) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_transfer(mut self, transfer: Arc<dyn ResultTransfer>) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceProvider>) -> Self {
        self.resources = resources;
        self
    }
}
