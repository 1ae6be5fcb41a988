//! ICR-2LS deisotoping.
//!
//! The tool writes `<dataset>.pek.tmp` scan by scan and renames it to
//! `<dataset>.pek` when it finishes. Progress comes from two places: the
//! console (`Processing scan N of M`) and a status file it rewrites in place.
//! An interrupted run resumes from the last scan block closed by
//! `Number of isotopic distributions detected`, via the `/SF:` start-scan
//! switch.

use crate::collaborators::SpectraKind;
use crate::context::JobContext;
use crate::integrations::{Integration, RequiredInput, StatusSource, ValidationFailure};
use crate::postprocess::{require_artifact, PostProcessError};
use harness_core::markers::MarkerError;
use harness_core::{
    Effect, MarkerTable, Matcher, OutputDescriptor, ResumePoint, ResumeScanner, RunRequest,
    ToolState, UnitLabels, UnitRange,
};
use std::path::PathBuf;
use std::time::Duration;

pub const NAME: &str = "icr2ls";

const STATUS_FILE: &str = "ICR2LS_Status.txt";
const SCAN_START: &str = r"(?i)^scan\s*=\s*(\d+)";
const CLOSING_PHRASE: &str = "Number of isotopic distributions detected";

#[derive(Debug, Clone)]
pub struct Icr2ls {
    executable: PathBuf,
    console: MarkerTable,
    status: MarkerTable,
    scanner: ResumeScanner,
}

impl Icr2ls {
    pub fn new(executable: impl Into<PathBuf>) -> Result<Self, MarkerError> {
        let console = MarkerTable::new()
            .with(
                Matcher::regex(r"(?i)^Processing scan (\d+) of (\d+)")?,
                Effect::ProgressFraction { done: 1, total: 2 },
            )
            .with(
                Matcher::regex(r"(?i)^Scan \d+: no data points found")?,
                Effect::UnitFailed,
            )
            .with(
                Matcher::contains("Processing complete"),
                Effect::Terminal(ToolState::Complete),
            )
            .with(Matcher::regex(r"(?i)^warning\b")?, Effect::Warning);

        let status = MarkerTable::new()
            .with(
                Matcher::regex(r"(?i)^Status\s*=\s*(.+)$")?,
                Effect::StateFromGroup(1),
            )
            .with(
                Matcher::regex(r"(?i)^PercentComplete\s*=\s*([\d.]+)")?,
                Effect::ProgressFromGroup(1),
            )
            .with(
                Matcher::regex(r"(?i)^ScansProcessed\s*=\s*(\d+)\s*/\s*(\d+)")?,
                Effect::ProgressFraction { done: 1, total: 2 },
            )
            .with(Matcher::regex(r"(?i)^ErrorMessage\s*=\s*\S")?, Effect::Error);

        Ok(Self {
            executable: executable.into(),
            console,
            status,
            scanner: ResumeScanner::new(SCAN_START, CLOSING_PHRASE)?,
        })
    }

    fn output_name(ctx: &JobContext) -> String {
        format!("{}.pek", ctx.dataset())
    }

    /// Scan range from the `scan_start` / `scan_end` job parameters.
    fn scan_range(ctx: &JobContext) -> Result<UnitRange, ValidationFailure> {
        let first = ctx.param_u64("scan_start")?.unwrap_or(1).max(1);
        let last = ctx.param_u64("scan_end")?.filter(|&end| end > 0);
        if let Some(last) = last {
            if last < first {
                return Err(ValidationFailure::InvalidParameter {
                    name: "scan_end".to_string(),
                    value: last.to_string(),
                });
            }
        }
        Ok(UnitRange::new(first, last))
    }
}

impl Integration for Icr2ls {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, ctx: &JobContext) -> Result<(), ValidationFailure> {
        Self::scan_range(ctx).map(|_| ())
    }

    fn spectra_kind(&self) -> Option<SpectraKind> {
        Some(SpectraKind::Raw)
    }

    fn required_inputs(&self, ctx: &JobContext) -> Result<Vec<RequiredInput>, ValidationFailure> {
        Ok(vec![RequiredInput::param_file(ctx.require_param_file()?)])
    }

    fn build_request(
        &self,
        ctx: &JobContext,
        resume: Option<&ResumePoint>,
    ) -> Result<RunRequest, ValidationFailure> {
        let param_file = ctx.require_param_file()?;
        let mut range = Self::scan_range(ctx)?;
        if let Some(point) = resume {
            range = range.resume_after(point.last_completed_unit).ok_or(
                ValidationFailure::RangeExhausted {
                    last_completed: point.last_completed_unit,
                    end: range.last.unwrap_or_default(),
                },
            )?;
        }

        let output = Self::output_name(ctx);
        let raw = SpectraKind::Raw.file_name(ctx.dataset());
        let mut args = vec![
            format!("/I:{}", ctx.working_file(&raw).display()),
            format!("/P:{}", ctx.working_file(param_file).display()),
            format!("/O:{}", ctx.working_file(&output).display()),
            format!("/L:{}", ctx.working_file(STATUS_FILE).display()),
        ];
        if range.first > 1 {
            args.push(format!("/SF:{}", range.first));
        }
        if let Some(last) = range.last {
            args.push(format!("/EF:{last}"));
        }

        Ok(RunRequest::new(
            &self.executable,
            &ctx.working_dir,
            ctx.key.clone(),
            OutputDescriptor::file(output),
        )
        .with_args(args)
        .with_unit_range(range))
    }

    fn console_markers(&self) -> &MarkerTable {
        &self.console
    }

    fn status_source(&self, ctx: &JobContext) -> Option<StatusSource> {
        Some(StatusSource {
            path: ctx.working_file(STATUS_FILE),
            markers: self.status.clone(),
        })
    }

    fn checkpoint_file(&self, ctx: &JobContext) -> Option<PathBuf> {
        Some(ctx.working_file(&format!("{}.tmp", Self::output_name(ctx))))
    }

    fn resume_scanner(&self) -> Option<ResumeScanner> {
        Some(self.scanner.clone())
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(15))
    }

    fn unit_labels(&self) -> UnitLabels {
        UnitLabels::new("scans", "had no peaks")
    }

    fn post_process(
        &self,
        ctx: &JobContext,
        request: &RunRequest,
    ) -> Result<Vec<PathBuf>, PostProcessError> {
        Ok(vec![require_artifact(
            &ctx.working_dir,
            &request.expected_output,
        )?])
    }
}
