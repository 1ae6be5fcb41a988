//! Run state machine.
//!
//! One job step moves through
//! `IDLE -> VALIDATING -> LAUNCHING -> RUNNING -> FINALIZING` and ends in
//! `SUCCEEDED`, `FAILED` or `NO_DATA`. Validation and launch failures skip
//! straight to the end state. The tool integration supplies everything
//! tool-specific; this module owns progress, checkpoints, classification
//! and cleanup.

use crate::checkpoint::CheckpointStore;
use crate::collaborators::{Collaborators, StatusPublisher};
use crate::context::JobContext;
use crate::integrations::{InputKind, Integration, StatusSource};
use crate::postprocess::check_artifact;
use crate::runner::{
    ExternalProcessRunner, Invocation, ProcessExit, ProcessHandle, ProcessOutcome, RunnerConfig,
    TickControl,
};
use crate::watch::FileWatcher;
use chrono::Utc;
use harness_core::artifacts;
use harness_core::config::clamp_poll_interval;
use harness_core::events::{CheckpointPayload, EventPayload, RunClosedPayload, RunStartedPayload};
use harness_core::{
    classify, CloseoutCode, CloseoutResult, Config, ConsoleEvent, FailureCategory, FinalizeFacts,
    JobKey, MarkerTable, ParseState, ProcessVerdict, ResumePoint, RunRequest, RunState, RunStatus,
    ToolState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Written to the working directory when a run closes.
pub const CLOSEOUT_FILE: &str = "closeout.json";

/// Everything a finished run reports back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub closeout: CloseoutResult,
    pub status: RunStatus,
    /// Every state entered, starting with `Idle`.
    pub transitions: Vec<RunState>,
    pub resumed_from: Option<ResumePoint>,
    pub invocation: Option<Invocation>,
    /// Result files handed to the transfer collaborator.
    pub manifest: Vec<PathBuf>,
    pub marked_safe_to_delete: bool,
}

pub struct RunStateMachine {
    integration: Arc<dyn Integration>,
    collaborators: Collaborators,
    config: Config,
    poll_override: Option<Duration>,
    cancel: CancellationToken,
    status: RunStatus,
    transitions: Vec<RunState>,
}

impl std::fmt::Debug for RunStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStateMachine")
            .field("tool", &self.integration.name())
            .field("state", &self.status.state)
            .finish_non_exhaustive()
    }
}

struct Launched {
    request: RunRequest,
    runner: ExternalProcessRunner,
    store: CheckpointStore,
    checkpoint_file: Option<PathBuf>,
    resumed_from: Option<ResumePoint>,
    /// Failed units recorded with the restored checkpoint.
    carried_failed: u64,
    invocation: Invocation,
}

#[derive(Default)]
struct Closing {
    manifest: Vec<PathBuf>,
    resumed_from: Option<ResumePoint>,
    invocation: Option<Invocation>,
    marked_safe_to_delete: bool,
}

impl RunStateMachine {
    pub fn new(
        integration: Arc<dyn Integration>,
        collaborators: Collaborators,
        config: Config,
    ) -> Self {
        Self {
            integration,
            collaborators,
            config,
            poll_override: None,
            cancel: CancellationToken::new(),
            status: RunStatus::new(),
            transitions: vec![RunState::Idle],
        }
    }

    /// Poll interval that wins over both the tool's and the configured one.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_override = Some(interval);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> RunState {
        self.status.state
    }

    fn poll_interval(&self) -> Duration {
        self.poll_override.unwrap_or_else(|| {
            self.integration
                .poll_interval()
                .map_or_else(|| self.config.poll_interval(), clamp_poll_interval)
        })
    }

    fn transition(&mut self, key: &JobKey, next: RunState) {
        enter(self.integration.name(), key, &mut self.status, &mut self.transitions, next);
    }

    /// Drive one job step to a closeout. Never panics on tool misbehavior;
    /// every failure ends up in the returned closeout.
    pub async fn run(mut self, ctx: &JobContext) -> RunOutcome {
        self.status.started_at = Some(Utc::now());

        self.transition(&ctx.key, RunState::Validating);
        if let Err(closeout) = self.validate(ctx) {
            return self.close(ctx, closeout, Closing::default());
        }

        self.transition(&ctx.key, RunState::Launching);
        let (launched, handle) = match self.launch(ctx) {
            Ok(launched) => launched,
            Err(closeout) => return self.close(ctx, closeout, Closing::default()),
        };

        self.transition(&ctx.key, RunState::Running);
        let Launched {
            request,
            runner,
            store,
            checkpoint_file,
            resumed_from,
            carried_failed,
            invocation,
        } = launched;

        let mut monitor = Monitor::new(
            ctx.key.clone(),
            std::mem::take(&mut self.status),
            self.integration.console_markers().clone(),
            request.console_log.clone(),
            self.integration.status_source(ctx),
            checkpoint_file.clone(),
            store,
            Arc::clone(&self.collaborators.status),
            self.config.status_interval(),
        )
        .with_carried_failures(carried_failed);
        monitor.watch(request.poll_interval);

        let waited = runner
            .wait(handle, &self.cancel, |_tick| monitor.on_tick())
            .await;

        enter(
            self.integration.name(),
            &ctx.key,
            &mut monitor.status,
            &mut self.transitions,
            RunState::Finalizing,
        );
        let closeout = match waited {
            Ok(exit) => self.finalize(&mut monitor, &request, &exit).await,
            Err(err) => {
                error!(job = ctx.key.job, error = %err, "lost track of tool process");
                CloseoutResult::failed(FailureCategory::RuntimeFailure, err.to_string())
            }
        };

        let mut closing = Closing {
            resumed_from,
            invocation: Some(invocation),
            ..Closing::default()
        };
        let closeout = if closeout.is_failure() {
            Self::preserve_partial_results(&mut monitor, ctx, checkpoint_file.as_deref());
            self.collaborators.archive.copy_partial_results(&ctx.working_dir);
            closeout
        } else {
            self.deliver(
                ctx,
                &request,
                &mut monitor,
                checkpoint_file.as_deref(),
                closeout,
                &mut closing,
            )
        };

        self.status = monitor.into_status();
        self.close(ctx, closeout, closing)
    }

    fn validate(&self, ctx: &JobContext) -> Result<(), CloseoutResult> {
        std::fs::create_dir_all(&ctx.working_dir).map_err(|err| {
            CloseoutResult::failed(
                FailureCategory::ValidationFailure,
                format!(
                    "cannot create working directory {}: {err}",
                    ctx.working_dir.display()
                ),
            )
        })?;

        self.integration.validate(ctx).map_err(|f| f.closeout())?;

        let inputs = self
            .integration
            .required_inputs(ctx)
            .map_err(|f| f.closeout())?;
        for input in &inputs {
            let source_dir = match input.kind {
                InputKind::ParamFile => ctx.param_source_dir.clone(),
                InputKind::DataFile => ctx.input_dir(),
            };
            if !self
                .collaborators
                .resources
                .retrieve_file(&input.name, &source_dir, &ctx.working_dir)
            {
                return Err(input.missing().closeout());
            }
        }

        if let Some(kind) = self.integration.spectra_kind() {
            if !self.collaborators.resources.retrieve_spectra(kind, ctx) {
                return Err(CloseoutResult::file_not_found(format!(
                    "{} not found for dataset {}",
                    kind.file_name(ctx.dataset()),
                    ctx.dataset()
                )));
            }
        }

        debug!(job = ctx.key.job, inputs = inputs.len(), "inputs validated");
        Ok(())
    }

    fn launch(&self, ctx: &JobContext) -> Result<(Launched, ProcessHandle), CloseoutResult> {
        let mut store =
            CheckpointStore::new(&self.config.transfer_dir, self.config.checkpoint_interval());
        if let Some(scanner) = self.integration.resume_scanner() {
            store = store.with_scanner(scanner);
        }

        let checkpoint_file = self.integration.checkpoint_file(ctx);
        let mut resumed_from = None;
        let mut carried_failed = 0;
        if let Some(local) = &checkpoint_file {
            match store.try_restore_checkpoint(&ctx.key, local) {
                Ok(Some(restored)) => {
                    resumed_from = restored.point;
                    carried_failed = restored.meta.as_ref().map_or(0, |meta| meta.units_failed);
                    self.collaborators
                        .status
                        .record_event(&EventPayload::CheckpointRestored(CheckpointPayload {
                            key: ctx.key.clone(),
                            path: restored.local_file.display().to_string(),
                            last_completed_unit: restored.point.map(|p| p.last_completed_unit),
                        }));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        job = ctx.key.job,
                        error = %err,
                        "checkpoint unusable; starting from the beginning"
                    );
                }
            }
        }

        if let Some(source) = self.integration.status_source(ctx) {
            if source.path.is_file() {
                if let Err(err) = artifacts::remove_with_retry(&source.path) {
                    debug!(path = %source.path.display(), error = %err, "stale status file kept");
                }
            }
        }

        let request = self
            .integration
            .build_request(ctx, resumed_from.as_ref())
            .map_err(|f| f.closeout())?;
        let timeout = request.timeout.or_else(|| self.config.tool_timeout());
        let request = request
            .with_poll_interval(self.poll_interval())
            .with_timeout(timeout);

        let runner = ExternalProcessRunner::new(
            RunnerConfig::from_config(&self.config)
                .with_args_file_switch(self.integration.args_file_switch()),
        );
        let handle = runner.launch(&request).map_err(|err| {
            error!(job = ctx.key.job, error = %err, "tool launch failed");
            CloseoutResult::failed(FailureCategory::LaunchFailure, err.to_string())
        })?;

        self.collaborators
            .status
            .record_event(&EventPayload::RunStarted(RunStartedPayload {
                key: ctx.key.clone(),
                tool: self.integration.name().to_string(),
                executable: request.executable.display().to_string(),
                resumed_after_unit: resumed_from.map(|p| p.last_completed_unit),
            }));

        let invocation = handle.invocation().clone();
        Ok((
            Launched {
                request,
                runner,
                store,
                checkpoint_file,
                resumed_from,
                carried_failed,
                invocation,
            },
            handle,
        ))
    }

    async fn finalize(
        &self,
        monitor: &mut Monitor,
        request: &RunRequest,
        exit: &ProcessExit,
    ) -> CloseoutResult {
        monitor.finish().await;

        let process = match &exit.outcome {
            ProcessOutcome::Exited(code) if self.integration.accepts_exit_code(*code) => {
                ProcessVerdict::Succeeded
            }
            ProcessOutcome::Exited(code) => ProcessVerdict::ExitCode(*code),
            ProcessOutcome::TimedOut(limit) => ProcessVerdict::TimedOut {
                after_sec: limit.as_secs(),
            },
            ProcessOutcome::Cancelled => ProcessVerdict::Cancelled,
            ProcessOutcome::Aborted(reason) => ProcessVerdict::Aborted(reason.clone()),
        };

        let facts = FinalizeFacts {
            process,
            artifact: check_artifact(&request.working_dir, &request.expected_output),
            fatal_error: monitor.fatal_error().map(str::to_string),
            units_failed: monitor.status.units_failed,
            units_total: monitor.status.units_total.unwrap_or(0),
            no_data_marker: monitor.saw_no_data(),
            unit_labels: self.integration.unit_labels(),
        };
        let closeout = classify(&facts);
        info!(
            job = monitor.key.job,
            closeout = %closeout,
            artifact = ?facts.artifact,
            units_failed = facts.units_failed,
            units_total = facts.units_total,
            duration_ms = exit.duration.as_millis() as u64,
            "run classified"
        );
        closeout
    }

    /// Post-process, transfer and release the checkpoint of a non-failed run.
    ///
    /// A `NoData` run goes through the same steps, but a tool that wrote
    /// nothing to post-process does not turn it into a failure.
    fn deliver(
        &self,
        ctx: &JobContext,
        request: &RunRequest,
        monitor: &mut Monitor,
        checkpoint_file: Option<&Path>,
        closeout: CloseoutResult,
        closing: &mut Closing,
    ) -> CloseoutResult {
        let no_data = closeout.code == CloseoutCode::NoData;
        match self.integration.post_process(ctx, request) {
            Ok(manifest) => closing.manifest = manifest,
            Err(err) if no_data => {
                warn!(job = ctx.key.job, error = %err, "nothing to post-process for a no-data run");
            }
            Err(err) => {
                error!(job = ctx.key.job, error = %err, "post-processing failed");
                let failed = CloseoutResult::failed(
                    FailureCategory::RuntimeFailure,
                    format!("post-processing failed: {err}"),
                );
                Self::preserve_partial_results(monitor, ctx, checkpoint_file);
                self.collaborators.archive.copy_partial_results(&ctx.working_dir);
                return failed;
            }
        }

        let transfer_needed = !no_data || !closing.manifest.is_empty();
        if transfer_needed
            && !self
                .collaborators
                .transfer
                .copy_results_to_durable_storage(&ctx.working_dir, &closing.manifest)
        {
            Self::preserve_partial_results(monitor, ctx, checkpoint_file);
            self.collaborators.archive.copy_partial_results(&ctx.working_dir);
            return CloseoutResult::failed(
                FailureCategory::RuntimeFailure,
                "failed to transfer results",
            );
        }

        if let Some(local) = checkpoint_file {
            if self.config.keep_checkpoints {
                debug!(job = ctx.key.job, "keeping checkpoint");
            } else {
                match monitor.store.mark_safe_to_delete(&ctx.key, local) {
                    Ok(()) => closing.marked_safe_to_delete = true,
                    Err(err) => warn!(job = ctx.key.job, error = %err, "could not mark checkpoint"),
                }
            }
        }
        closeout
    }

    /// Last checkpoint of a failed run, so a retry can resume.
    fn preserve_partial_results(monitor: &mut Monitor, ctx: &JobContext, checkpoint_file: Option<&Path>) {
        let Some(local) = checkpoint_file.filter(|path| path.is_file()) else {
            return;
        };
        monitor.store.record_units_failed(monitor.status.units_failed);
        match off_runtime(|| monitor.store.save_now(&ctx.key, local)) {
            Ok(true) => monitor.record_checkpoint(local),
            Ok(false) => {}
            Err(err) => warn!(job = ctx.key.job, error = %err, "final checkpoint failed"),
        }
    }

    fn close(mut self, ctx: &JobContext, closeout: CloseoutResult, closing: Closing) -> RunOutcome {
        self.transition(&ctx.key, closeout.code.run_state());
        self.status.ended_at = Some(Utc::now());
        if closeout.is_failure() {
            self.status.append_error(&closeout.message);
        }

        let label = if self.status.state_label.is_empty() {
            self.status.state.as_str()
        } else {
            self.status.state_label.as_str()
        };
        self.collaborators.status.publish(
            self.status.percent_complete(),
            self.status.units_processed,
            label,
        );

        let payload = RunClosedPayload {
            key: ctx.key.clone(),
            tool: self.integration.name().to_string(),
            closeout: closeout.clone(),
            status: self.status.clone(),
        };
        match serde_json::to_vec_pretty(&payload) {
            Ok(json) => {
                if let Err(err) =
                    artifacts::write_atomic(&ctx.working_dir.join(CLOSEOUT_FILE), &json)
                {
                    warn!(job = ctx.key.job, error = %err, "could not write closeout file");
                }
            }
            Err(err) => warn!(job = ctx.key.job, error = %err, "could not serialize closeout"),
        }
        self.collaborators
            .status
            .record_event(&EventPayload::RunClosed(payload));

        info!(
            job = ctx.key.job,
            dataset = %ctx.key.dataset,
            tool = self.integration.name(),
            code = closeout.code.as_str(),
            category = closeout.category.as_str(),
            "run closed"
        );

        RunOutcome {
            closeout,
            status: self.status,
            transitions: self.transitions,
            resumed_from: closing.resumed_from,
            invocation: closing.invocation,
            manifest: closing.manifest,
            marked_safe_to_delete: closing.marked_safe_to_delete,
        }
    }
}

/// Per-tick bookkeeping while the tool runs.
struct Monitor {
    key: JobKey,
    status: RunStatus,
    console: MarkerTable,
    console_log: PathBuf,
    console_state: ParseState,
    status_source: Option<StatusSource>,
    status_state: ParseState,
    status_dirty: bool,
    checkpoint_file: Option<PathBuf>,
    checkpoint_dirty: bool,
    store: CheckpointStore,
    watcher: Option<FileWatcher>,
    publisher: Arc<dyn StatusPublisher>,
    status_interval: Duration,
    last_publish: Option<Instant>,
    /// Failed units from the run this one resumed.
    carried_failed: u64,
}

impl Monitor {
    fn new(
        key: JobKey,
        status: RunStatus,
        console: MarkerTable,
        console_log: PathBuf,
        status_source: Option<StatusSource>,
        checkpoint_file: Option<PathBuf>,
        store: CheckpointStore,
        publisher: Arc<dyn StatusPublisher>,
        status_interval: Duration,
    ) -> Self {
        Self {
            key,
            status,
            console,
            console_log,
            console_state: ParseState::default(),
            status_source,
            status_state: ParseState::default(),
            status_dirty: true,
            checkpoint_file,
            checkpoint_dirty: true,
            store,
            watcher: None,
            publisher,
            status_interval,
            last_publish: None,
            carried_failed: 0,
        }
    }

    fn with_carried_failures(mut self, carried_failed: u64) -> Self {
        self.carried_failed = carried_failed;
        self.status.units_failed = self.status.units_failed.max(carried_failed);
        self
    }

    /// Watch the status and checkpoint files instead of rereading them every tick.
    fn watch(&mut self, interval: Duration) {
        let paths: Vec<PathBuf> = self
            .status_source
            .iter()
            .map(|source| source.path.clone())
            .chain(self.checkpoint_file.iter().cloned())
            .collect();
        if !paths.is_empty() {
            self.status_dirty = false;
            self.checkpoint_dirty = false;
            self.watcher = Some(FileWatcher::spawn(paths, interval));
        }
    }

    fn on_tick(&mut self) -> TickControl {
        self.drain_watcher();

        let text = read_lossy(&self.console_log);
        self.observe_console(&text, false);
        if self.status_dirty {
            self.refresh_status_file(false);
        }
        self.maybe_checkpoint();
        self.maybe_publish();

        match self.fatal_error() {
            Some(error) => TickControl::Abort(error.lines().next().unwrap_or_default().to_string()),
            None => TickControl::Continue,
        }
    }

    fn drain_watcher(&mut self) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        for event in watcher.drain() {
            let path = event.path();
            if self.status_source.as_ref().is_some_and(|s| s.path == path) {
                self.status_dirty = true;
            }
            if self.checkpoint_file.as_deref() == Some(path) {
                self.checkpoint_dirty = true;
            }
        }
    }

    fn observe_console(&mut self, text: &str, at_exit: bool) {
        let (events, parsed) = if at_exit {
            self.console.parse_final(text, &self.console_state)
        } else {
            self.console.parse(text, &self.console_state)
        };
        for event in &events {
            match event {
                ConsoleEvent::Warning(line) => warn!(job = self.key.job, line = %line, "tool warning"),
                ConsoleEvent::UnitFailed(line) => debug!(job = self.key.job, line = %line, "unit failed"),
                ConsoleEvent::Error(message) => {
                    error!(job = self.key.job, message = %message, "tool reported an error");
                }
                _ => {}
            }
        }
        self.console_state = parsed;
        absorb(&mut self.status, &self.console_state, self.carried_failed);
    }

    /// Status files are rewritten in place, so every line is reparsed.
    fn refresh_status_file(&mut self, at_exit: bool) {
        self.status_dirty = self.watcher.is_none();
        let Some(source) = &self.status_source else {
            return;
        };
        if !source.path.is_file() {
            return;
        }
        let text = read_lossy(&source.path);
        let previous = ParseState {
            lines_seen: 0,
            ..self.status_state.clone()
        };
        let (_, parsed) = if at_exit {
            source.markers.parse_final(&text, &previous)
        } else {
            source.markers.parse(&text, &previous)
        };
        self.status_state = parsed;
        absorb(&mut self.status, &self.status_state, self.carried_failed);
    }

    fn maybe_checkpoint(&mut self) {
        let Some(local) = self.checkpoint_file.clone() else {
            return;
        };
        if !self.checkpoint_dirty || !self.store.save_due() {
            return;
        }
        self.checkpoint_dirty = self.watcher.is_none();
        self.store.record_units_failed(self.status.units_failed);
        let key = &self.key;
        let store = &mut self.store;
        match off_runtime(|| store.try_save_checkpoint(key, &local)) {
            Ok(true) => self.record_checkpoint(&local),
            Ok(false) => {}
            Err(err) => warn!(job = self.key.job, error = %err, "checkpoint save failed"),
        }
    }

    fn record_checkpoint(&self, local: &Path) {
        let path = self
            .store
            .checkpoint_path(&self.key, local)
            .unwrap_or_else(|_| local.to_path_buf());
        self.publisher
            .record_event(&EventPayload::CheckpointSaved(CheckpointPayload {
                key: self.key.clone(),
                path: path.display().to_string(),
                last_completed_unit: self
                    .store
                    .last_saved()
                    .and_then(|meta| meta.last_completed_unit),
            }));
    }

    fn maybe_publish(&mut self) {
        let due = self
            .last_publish
            .map_or(true, |at| at.elapsed() >= self.status_interval);
        if !due {
            return;
        }
        let label = if self.status.state_label.is_empty() {
            self.status.state.as_str().to_string()
        } else {
            self.status.state_label.clone()
        };
        self.publisher.publish(
            self.status.percent_complete(),
            self.status.units_processed,
            &label,
        );
        self.last_publish = Some(Instant::now());
    }

    /// Final parse once the process has exited and output capture is complete.
    async fn finish(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        let text = read_lossy(&self.console_log);
        self.observe_console(&text, true);
        self.refresh_status_file(true);
    }

    fn fatal_error(&self) -> Option<&str> {
        self.console_state
            .error
            .as_deref()
            .or(self.status_state.error.as_deref())
    }

    fn saw_no_data(&self) -> bool {
        self.console_state.terminal == Some(ToolState::NoData)
            || self.status_state.terminal == Some(ToolState::NoData)
            || self.status.tool_state == ToolState::NoData
    }

    fn into_status(self) -> RunStatus {
        self.status
    }
}

fn enter(
    tool: &str,
    key: &JobKey,
    status: &mut RunStatus,
    transitions: &mut Vec<RunState>,
    next: RunState,
) {
    info!(
        job = key.job,
        dataset = %key.dataset,
        tool,
        from = status.state.as_str(),
        to = next.as_str(),
        "run state changed"
    );
    status.state = next;
    transitions.push(next);
}

/// Fold one parse result into the run status. Progress and counters only
/// move forward; `carried_failed` counts failures before a resume.
fn absorb(status: &mut RunStatus, parsed: &ParseState, carried_failed: u64) {
    status.update_progress(parsed.percent_complete);
    status.units_processed = status.units_processed.max(parsed.units_processed);
    status.units_failed = status
        .units_failed
        .max(carried_failed + parsed.units_failed);
    if parsed.units_total.is_some() {
        status.units_total = parsed.units_total;
    }
    for warning in &parsed.warnings {
        status.add_warning(warning);
    }
    if let Some(error) = &parsed.error {
        status.append_error(error);
    }
    if parsed.tool_state != ToolState::Unknown {
        let label = parsed.state_label.as_deref();
        let relabelled = label.is_some_and(|l| l != status.state_label);
        if parsed.tool_state != status.tool_state || relabelled {
            status.set_tool_state(parsed.tool_state, label);
            debug!(tool_state = parsed.tool_state.as_str(), label = %status.state_label, "tool state changed");
        }
    }
}

/// Run blocking file work (checkpoint copies retry with sleeps) without
/// stalling other tasks on a multi-threaded runtime.
fn off_runtime<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

fn read_lossy(path: &Path) -> String {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::{Effect, Matcher};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<f32>>,
    }

    impl StatusPublisher for Recorder {
        fn publish(&self, percent_complete: f32, _units: u64, _label: &str) {
            self.published.lock().unwrap().push(percent_complete);
        }
    }

    fn table() -> MarkerTable {
        MarkerTable::new()
            .with(
                Matcher::regex(r"(?i)^percent complete:\s*([\d.]+)").unwrap(),
                Effect::ProgressFromGroup(1),
            )
            .with(
                Matcher::regex(r"(?i)no data points found").unwrap(),
                Effect::UnitFailed,
            )
    }

    fn monitor(dir: &Path, publisher: Arc<dyn StatusPublisher>, interval: Duration) -> Monitor {
        Monitor::new(
            JobKey::new("DS", 1, 1),
            RunStatus::new(),
            table(),
            dir.join("console_output.txt"),
            None,
            None,
            CheckpointStore::new(dir.join("transfer"), Duration::ZERO),
            publisher,
            interval,
        )
    }

    #[test]
    fn observed_progress_never_regresses() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(dir.path(), Arc::new(Recorder::default()), Duration::ZERO);
        let mut text = String::new();
        let mut observed = Vec::new();
        for percent in [5, 3, 8, 8, 12] {
            text.push_str(&format!("Percent complete: {percent}\n"));
            monitor.observe_console(&text, false);
            observed.push(monitor.status.percent_complete());
        }
        assert_eq!(observed, vec![5.0, 5.0, 8.0, 8.0, 12.0]);
    }

    #[test]
    fn tick_publishes_and_aborts_on_fatal_error() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let publisher: Arc<dyn StatusPublisher> = Arc::<Recorder>::clone(&recorder);
        let mut monitor = monitor(dir.path(), publisher, Duration::ZERO);

        std::fs::write(dir.path().join("console_output.txt"), "Percent complete: 40\n").unwrap();
        assert_eq!(monitor.on_tick(), TickControl::Continue);

        std::fs::write(
            dir.path().join("console_output.txt"),
            "Percent complete: 40\nError: raw file is corrupt\n  at Reader.Open\n",
        )
        .unwrap();
        assert_eq!(
            monitor.on_tick(),
            TickControl::Abort("Error: raw file is corrupt".to_string())
        );
        assert_eq!(*recorder.published.lock().unwrap(), vec![40.0, 40.0]);
        assert!(monitor.status.error_message.contains("raw file is corrupt"));
    }

    #[test]
    fn publishing_is_throttled() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let publisher: Arc<dyn StatusPublisher> = Arc::<Recorder>::clone(&recorder);
        let mut monitor = monitor(dir.path(), publisher, Duration::from_secs(3600));
        for _ in 0..5 {
            monitor.on_tick();
        }
        assert_eq!(recorder.published.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tick_checkpoints_with_carried_failures() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("DS.pek.tmp");
        std::fs::write(&local, "Scan = 1\n1000.1\t50\n").unwrap();
        std::fs::write(
            dir.path().join("console_output.txt"),
            "Percent complete: 10\nScan 3: no data points found\n",
        )
        .unwrap();
        let mut monitor = Monitor::new(
            JobKey::new("DS", 1, 1),
            RunStatus::new(),
            table(),
            dir.path().join("console_output.txt"),
            None,
            Some(local.clone()),
            CheckpointStore::new(dir.path().join("transfer"), Duration::ZERO),
            Arc::new(Recorder::default()),
            Duration::ZERO,
        )
        .with_carried_failures(2);
        assert_eq!(monitor.status.units_failed, 2);

        assert_eq!(monitor.on_tick(), TickControl::Continue);

        assert_eq!(monitor.status.units_failed, 3);
        assert_eq!(monitor.store.last_saved().unwrap().units_failed, 3);
        let durable = monitor.store.checkpoint_path(&monitor.key, &local).unwrap();
        assert!(durable.is_file());
    }

    #[test]
    fn absorb_keeps_counters_and_state_labels() {
        let mut status = RunStatus::new();
        let parsed = ParseState {
            percent_complete: 30.0,
            units_processed: 3,
            units_total: Some(10),
            units_failed: 1,
            tool_state: ToolState::Processing,
            state_label: Some("Analyzing".to_string()),
            ..ParseState::default()
        };
        absorb(&mut status, &parsed, 0);
        absorb(
            &mut status,
            &ParseState {
                units_processed: 2,
                ..parsed.clone()
            },
            0,
        );
        assert_eq!(status.units_processed, 3);
        assert_eq!(status.units_total, Some(10));
        assert_eq!(status.units_failed, 1);
        assert_eq!(status.state_label, "Analyzing");
        assert_eq!(status.tool_state, ToolState::Processing);
    }
}
