//! Data-package runs.
//!
//! A data package is a list of sub-jobs run one after another with the same
//! tool and parameters, each in its own `Job<N>` subdirectory. Result tables
//! of the sub-jobs that succeeded are concatenated into one table for the
//! package.

use crate::collaborators::Collaborators;
use crate::context::JobContext;
use crate::integrations::Integration;
use crate::machine::{RunOutcome, RunStateMachine, CLOSEOUT_FILE};
use chrono::Utc;
use harness_core::artifacts;
use harness_core::events::{EventPayload, RunClosedPayload};
use harness_core::{
    classify_aggregate, concatenate_results, CloseoutCode, CloseoutResult, ConcatSummary, Config,
    FailureCategory, RunStatus, SubJobFile,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug)]
pub struct AggregateOutcome {
    pub closeout: CloseoutResult,
    /// Outcome of every sub-job that was started, in package order.
    pub sub_jobs: Vec<(u32, RunOutcome)>,
    pub combined: Option<PathBuf>,
    pub summary: Option<ConcatSummary>,
}

/// Name of the combined table in the package working directory.
pub fn combined_table_name(dataset: &str, tool: &str) -> String {
    format!("{dataset}_{tool}_combined.txt")
}

pub async fn run_data_package(
    integration: Arc<dyn Integration>,
    collaborators: &Collaborators,
    config: &Config,
    ctx: &JobContext,
    cancel: &CancellationToken,
) -> AggregateOutcome {
    let started_at = Utc::now();
    let tool = integration.name();

    if integration.result_table(ctx).is_none() {
        let closeout = CloseoutResult::failed(
            FailureCategory::ValidationFailure,
            format!("{tool} does not produce a result table for data packages"),
        );
        return finish(ctx, tool, collaborators, closeout, Vec::new(), None, None, started_at);
    }

    info!(
        job = ctx.key.job,
        tool,
        sub_jobs = ctx.sub_jobs.len(),
        "data package started"
    );

    let mut sub_jobs = Vec::with_capacity(ctx.sub_jobs.len());
    let mut tables = Vec::new();
    for sub in &ctx.sub_jobs {
        if cancel.is_cancelled() {
            warn!(job = ctx.key.job, next_sub_job = sub.job, "data package cancelled");
            break;
        }

        let sub_ctx = ctx.for_sub_job(sub);
        let outcome = RunStateMachine::new(
            Arc::clone(&integration),
            collaborators.clone(),
            config.clone(),
        )
        .with_cancel(cancel.clone())
        .run(&sub_ctx)
        .await;

        if outcome.closeout.code == CloseoutCode::Success {
            match integration.result_table(&sub_ctx).filter(|path| path.is_file()) {
                Some(table) => tables.push(SubJobFile::new(sub.job, table)),
                None => warn!(sub_job = sub.job, "sub-job succeeded without a result table"),
            }
        }
        sub_jobs.push((sub.job, outcome));
    }

    let results: Vec<(u32, CloseoutResult)> = sub_jobs
        .iter()
        .map(|(job, outcome)| (*job, outcome.closeout.clone()))
        .collect();
    let mut closeout = classify_aggregate(&results);
    if sub_jobs.len() < ctx.sub_jobs.len() {
        closeout = CloseoutResult::failed(
            FailureCategory::RuntimeFailure,
            format!(
                "data package cancelled after {} of {} jobs",
                sub_jobs.len(),
                ctx.sub_jobs.len()
            ),
        );
    }

    let mut combined = None;
    let mut summary = None;
    if !closeout.is_failure() && !tables.is_empty() {
        let output = ctx.working_file(&combined_table_name(ctx.dataset(), tool));
        match concatenate_results(&tables, &output) {
            Ok(concat) => {
                info!(
                    path = %output.display(),
                    files = concat.files,
                    rows = concat.rows,
                    job_column_synthesized = concat.job_column_synthesized,
                    "result tables combined"
                );
                if collaborators
                    .transfer
                    .copy_results_to_durable_storage(&ctx.working_dir, std::slice::from_ref(&output))
                {
                    combined = Some(output);
                    summary = Some(concat);
                } else {
                    closeout = CloseoutResult::failed(
                        FailureCategory::RuntimeFailure,
                        "failed to transfer combined results",
                    );
                }
            }
            Err(err) => {
                closeout = CloseoutResult::failed(
                    FailureCategory::RuntimeFailure,
                    format!("failed to combine result tables: {err}"),
                );
            }
        }
    }

    finish(ctx, tool, collaborators, closeout, sub_jobs, combined, summary, started_at)
}

fn finish(
    ctx: &JobContext,
    tool: &str,
    collaborators: &Collaborators,
    closeout: CloseoutResult,
    sub_jobs: Vec<(u32, RunOutcome)>,
    combined: Option<PathBuf>,
    summary: Option<ConcatSummary>,
    started_at: chrono::DateTime<Utc>,
) -> AggregateOutcome {
    let mut status = RunStatus::new();
    status.state = closeout.code.run_state();
    status.units_total = Some(ctx.sub_jobs.len() as u64);
    status.units_processed = sub_jobs.len() as u64;
    status.units_failed = sub_jobs
        .iter()
        .filter(|(_, outcome)| outcome.closeout.is_failure())
        .count() as u64;
    status.started_at = Some(started_at);
    status.ended_at = Some(Utc::now());
    if closeout.is_failure() {
        status.append_error(&closeout.message);
    }

    let payload = RunClosedPayload {
        key: ctx.key.clone(),
        tool: tool.to_string(),
        closeout: closeout.clone(),
        status,
    };
    let written = serde_json::to_vec_pretty(&payload)
        .map_err(|err| err.to_string())
        .and_then(|json| {
            artifacts::write_atomic(&ctx.working_file(CLOSEOUT_FILE), &json)
                .map_err(|err| err.to_string())
        });
    if let Err(err) = written {
        warn!(job = ctx.key.job, error = %err, "could not write closeout file");
    }
    collaborators
        .status
        .record_event(&EventPayload::RunClosed(payload));

    info!(
        job = ctx.key.job,
        tool,
        code = closeout.code.as_str(),
        sub_jobs = sub_jobs.len(),
        "data package closed"
    );

    AggregateOutcome {
        closeout,
        sub_jobs,
        combined,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ArchiveOnFailure, ResultTransfer};
    use crate::context::SubJob;
    use crate::integrations::Icr2ls;
    use harness_core::JobKey;
    use std::path::Path;
    use tempfile::TempDir;

    struct Nowhere;

    impl ArchiveOnFailure for Nowhere {
        fn copy_partial_results(&self, _working_dir: &Path) {}
    }

    impl ResultTransfer for Nowhere {
        fn copy_results_to_durable_storage(&self, _dir: &Path, _manifest: &[PathBuf]) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn tool_without_result_table_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let collaborators = Collaborators::from_config(&config)
            .with_archive(Arc::new(Nowhere))
            .with_transfer(Arc::new(Nowhere));
        let ctx = JobContext::new(JobKey::new("Package", 500, 1), dir.path(), dir.path())
            .with_sub_jobs(vec![SubJob::new(1, "A"), SubJob::new(2, "B")]);

        let outcome = run_data_package(
            Arc::new(Icr2ls::new("ICR2LS.exe").unwrap()),
            &collaborators,
            &config,
            &ctx,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.closeout.code, CloseoutCode::Failed);
        assert_eq!(outcome.closeout.category, FailureCategory::ValidationFailure);
        assert!(outcome.sub_jobs.is_empty());
        assert!(dir.path().join(CLOSEOUT_FILE).is_file());
    }

    #[test]
    fn combined_table_is_named_after_package_and_tool() {
        assert_eq!(
            combined_table_name("Package", "ascore"),
            "Package_ascore_combined.txt"
        );
    }
}
