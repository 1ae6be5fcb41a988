//! Core types for the tool harness.
//!
//! Requests, run status, closeout codes and parsed console events shared by
//! the runner, the state machine and the tool integrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Identity of one job step. Keys checkpoints in the transfer area.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub dataset: String,
    pub job: u32,
    pub step: u32,
}

impl JobKey {
    pub fn new(dataset: impl Into<String>, job: u32, step: u32) -> Self {
        Self {
            dataset: dataset.into(),
            job,
            step,
        }
    }

    /// Directory for this key under a transfer root: `<dataset>/Job<job>_Step<step>`.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(&self.dataset).join(format!("Job{}_Step{}", self.job, self.step))
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} job {} step {}", self.dataset, self.job, self.step)
    }
}

/// Inclusive range of units (scans, spectra, files) a run should process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRange {
    pub first: u64,
    /// `None` means "through the last unit".
    pub last: Option<u64>,
}

impl UnitRange {
    pub fn new(first: u64, last: Option<u64>) -> Self {
        Self { first, last }
    }

    /// Narrow the range so that it starts after `completed`.
    ///
    /// Returns `None` when every unit in the range is already done.
    pub fn resume_after(self, completed: u64) -> Option<Self> {
        let first = self.first.max(completed.saturating_add(1));
        match self.last {
            Some(last) if first > last => None,
            _ => Some(Self {
                first,
                last: self.last,
            }),
        }
    }

    pub fn contains(&self, unit: u64) -> bool {
        unit >= self.first && self.last.map_or(true, |last| unit <= last)
    }
}

impl Default for UnitRange {
    fn default() -> Self {
        Self::new(1, None)
    }
}

/// Expected output artifact of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    /// File name pattern; `*` and `?` are wildcards, matching is case-insensitive.
    pub pattern: String,
    /// Minimum size in bytes for a file to count as non-trivial.
    pub min_size: u64,
    /// Minimum number of matching files.
    pub min_count: usize,
    /// Also search one level of subdirectories (tools that write into dated folders).
    pub search_subdirs: bool,
}

impl OutputDescriptor {
    /// A single named file of at least one byte.
    pub fn file(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            min_size: 1,
            min_count: 1,
            search_subdirs: false,
        }
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_min_count(mut self, min_count: usize) -> Self {
        self.min_count = min_count;
        self
    }

    pub fn in_subdirs(mut self) -> Self {
        self.search_subdirs = true;
        self
    }
}

/// How the runner captures the child's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Stream to the console log as output arrives, so partial output is visible.
    #[default]
    File,
    /// Buffer in memory and flush to the console log when the process exits.
    Memory,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Memory => "memory",
        }
    }
}

/// One tool invocation.
///
/// Built once by an integration and never mutated afterwards; resuming from a
/// checkpoint builds a new request with a narrowed `unit_range`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub expected_output: OutputDescriptor,
    /// Wall-clock limit for the tool (`None` = unlimited).
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub checkpoint_key: JobKey,
    pub unit_range: Option<UnitRange>,
    /// File the tool's console output is written to.
    pub console_log: PathBuf,
}

impl RunRequest {
    pub fn new(
        executable: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        checkpoint_key: JobKey,
        expected_output: OutputDescriptor,
    ) -> Self {
        let working_dir = working_dir.into();
        Self {
            executable: executable.into(),
            args: Vec::new(),
            console_log: working_dir.join("console_output.txt"),
            working_dir,
            expected_output,
            timeout: None,
            poll_interval: Duration::from_secs(4),
            checkpoint_key,
            unit_range: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_unit_range(mut self, range: UnitRange) -> Self {
        self.unit_range = Some(range);
        self
    }

    pub fn with_console_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.console_log = path.into();
        self
    }
}

// --- Enumerations ---

/// Lifecycle state of the run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Idle,
    Validating,
    Launching,
    Running,
    Finalizing,
    Succeeded,
    Failed,
    NoData,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Validating => "VALIDATING",
            Self::Launching => "LAUNCHING",
            Self::Running => "RUNNING",
            Self::Finalizing => "FINALIZING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::NoData => "NO_DATA",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::NoData)
    }
}

/// Validated form of the free-text state label a tool reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    #[default]
    Unknown,
    Starting,
    Processing,
    Finishing,
    Complete,
    Error,
    NoData,
}

impl ToolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Finishing => "finishing",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::NoData => "no_data",
        }
    }

    /// Map a tool's free-text label onto the enumeration.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "starting" | "initializing" | "loading" | "idle" => Self::Starting,
            "processing" | "running" | "analyzing" | "calibrating" | "searching" => {
                Self::Processing
            }
            "finishing" | "writing" | "saving" => Self::Finishing,
            "complete" | "completed" | "done" | "finished" | "success" => Self::Complete,
            "error" | "failed" | "failure" | "aborted" => Self::Error,
            "no data" | "no_data" | "nodata" | "nothing to align" => Self::NoData,
            _ => Self::Unknown,
        }
    }
}

/// Terminal status code handed to the job orchestration framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseoutCode {
    Success,
    Failed,
    NoData,
    FileNotFound,
    ParamFileMissing,
}

impl CloseoutCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::NoData => "NO_DATA",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::ParamFileMissing => "PARAM_FILE_MISSING",
        }
    }

    /// Whether the code counts as a failure for archival and cleanup purposes.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Success | Self::NoData)
    }

    /// Terminal run state for this code.
    pub fn run_state(&self) -> RunState {
        match self {
            Self::Success => RunState::Succeeded,
            Self::NoData => RunState::NoData,
            Self::Failed | Self::FileNotFound | Self::ParamFileMissing => RunState::Failed,
        }
    }
}

/// Error taxonomy attached to a closeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    #[default]
    None,
    /// Missing required input; fixed by the operator, never retried automatically.
    ValidationFailure,
    /// Executable missing or misconfigured.
    LaunchFailure,
    /// Tool crashed, timed out, was cancelled or printed fatal error text.
    RuntimeFailure,
    /// Tool finished but produced nothing scientifically usable.
    NoUsableOutput,
    /// Some units failed; the run still succeeded.
    PartialDataWarning,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ValidationFailure => "validation_failure",
            Self::LaunchFailure => "launch_failure",
            Self::RuntimeFailure => "runtime_failure",
            Self::NoUsableOutput => "no_usable_output",
            Self::PartialDataWarning => "partial_data_warning",
        }
    }
}

/// Terminal classification of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseoutResult {
    pub code: CloseoutCode,
    pub category: FailureCategory,
    pub message: String,
    /// Distinguishes "succeeded with caveats" from a clean success.
    pub evaluation_message: Option<String>,
}

impl CloseoutResult {
    pub fn success() -> Self {
        Self {
            code: CloseoutCode::Success,
            category: FailureCategory::None,
            message: String::new(),
            evaluation_message: None,
        }
    }

    pub fn success_with_warning(evaluation_message: impl Into<String>) -> Self {
        Self {
            code: CloseoutCode::Success,
            category: FailureCategory::PartialDataWarning,
            message: String::new(),
            evaluation_message: Some(evaluation_message.into()),
        }
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self {
            code: CloseoutCode::NoData,
            category: FailureCategory::NoUsableOutput,
            message: message.into(),
            evaluation_message: None,
        }
    }

    pub fn failed(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            code: CloseoutCode::Failed,
            category,
            message: message.into(),
            evaluation_message: None,
        }
    }

    pub fn file_not_found(message: impl Into<String>) -> Self {
        Self {
            code: CloseoutCode::FileNotFound,
            category: FailureCategory::ValidationFailure,
            message: message.into(),
            evaluation_message: None,
        }
    }

    pub fn param_file_missing(message: impl Into<String>) -> Self {
        Self {
            code: CloseoutCode::ParamFileMissing,
            category: FailureCategory::ValidationFailure,
            message: message.into(),
            evaluation_message: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.code.is_failure()
    }
}

impl std::fmt::Display for CloseoutResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code.as_str())?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(eval) = &self.evaluation_message {
            write!(f, " ({eval})")?;
        }
        Ok(())
    }
}

/// Wording used when summarising unit-level failures, e.g. "3 / 10 scans had no peaks".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitLabels {
    /// Plural noun for a unit ("scans", "spectra").
    pub noun: String,
    /// Predicate describing a failed unit ("had no peaks").
    pub failure_phrase: String,
}

impl UnitLabels {
    pub fn new(noun: impl Into<String>, failure_phrase: impl Into<String>) -> Self {
        Self {
            noun: noun.into(),
            failure_phrase: failure_phrase.into(),
        }
    }

    pub fn summarize(&self, failed: u64, total: u64) -> String {
        format!("{failed} / {total} {} {}", self.noun, self.failure_phrase)
    }
}

impl Default for UnitLabels {
    fn default() -> Self {
        Self::new("units", "failed")
    }
}

/// A parsed console line.
///
/// Produced and consumed within one poll tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConsoleEvent {
    ProgressUpdate(f32),
    Warning(String),
    /// Error line plus every line that followed it.
    Error(String),
    StateChange(ToolState),
    UnitProcessed(u64),
    UnitFailed(String),
    Unrecognized(String),
}

/// Mutable status of a run, owned by the state machine.
///
/// `percent_complete` never decreases once set; tools that report a
/// regression are clamped to the highest value seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub tool_state: ToolState,
    /// Last raw state label the tool printed.
    pub state_label: String,
    percent_complete: f32,
    pub units_processed: u64,
    pub units_total: Option<u64>,
    pub units_failed: u64,
    pub warnings: Vec<String>,
    /// Accumulated error text.
    pub error_message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percent_complete(&self) -> f32 {
        self.percent_complete
    }

    /// Raise progress to `percent` if it is higher than the current value.
    ///
    /// Returns the value after clamping.
    pub fn update_progress(&mut self, percent: f32) -> f32 {
        if percent.is_finite() {
            let clamped = percent.clamp(0.0, 100.0);
            if clamped > self.percent_complete {
                self.percent_complete = clamped;
            }
        }
        self.percent_complete
    }

    /// Record the tool's state, keeping its raw label when it printed one.
    pub fn set_tool_state(&mut self, state: ToolState, label: Option<&str>) {
        self.tool_state = state;
        self.state_label = label.map_or_else(|| state.as_str().to_string(), str::to_string);
    }

    pub fn append_error(&mut self, message: &str) {
        if message.is_empty() || self.error_message.contains(message) {
            return;
        }
        if !self.error_message.is_empty() {
            self.error_message.push_str("; ");
        }
        self.error_message.push_str(message);
    }

    pub fn add_warning(&mut self, warning: &str) {
        if !self.warnings.iter().any(|w| w == warning) {
            self.warnings.push(warning.to_string());
        }
    }
}
