//! Formularity (CIA) formula assignment.
//!
//! Consumes a folder of per-scan peak lists. Each scan file is one unit;
//! scans without peaks are reported with `no data points found` and a run
//! where nothing could be aligned ends with `Nothing to align`. The report
//! lands in a dated subdirectory and is renamed to
//! `<dataset>_formularity.csv`.

use crate::collaborators::SpectraKind;
use crate::context::JobContext;
use crate::integrations::{Integration, RequiredInput, ValidationFailure};
use crate::postprocess::{newest_dated_subdir, rename_to_canonical, require_artifact, PostProcessError};
use harness_core::markers::MarkerError;
use harness_core::{
    Effect, MarkerTable, Matcher, OutputDescriptor, ResumePoint, RunRequest, ToolState,
    UnitLabels,
};
use std::path::PathBuf;

pub const NAME: &str = "formularity";

const REPORT_PATTERN: &str = "*Report*.csv";

#[derive(Debug, Clone)]
pub struct Formularity {
    executable: PathBuf,
    console: MarkerTable,
}

impl Formularity {
    pub fn new(executable: impl Into<PathBuf>) -> Result<Self, MarkerError> {
        let console = MarkerTable::new()
            .with(
                Matcher::regex(r"(?i)^Processing scan file (\d+)\s*/\s*(\d+)")?,
                Effect::ProgressFraction { done: 1, total: 2 },
            )
            .with(
                Matcher::regex(r"(?i)no data points found")?,
                Effect::UnitFailed,
            )
            .with(
                Matcher::regex(r"(?i)nothing to align")?,
                Effect::Terminal(ToolState::NoData),
            )
            .with(
                Matcher::regex(r"(?i)^(processing|analysis) complete")?,
                Effect::Terminal(ToolState::Complete),
            )
            .with(Matcher::regex(r"(?i)^warning\b")?, Effect::Warning);

        Ok(Self {
            executable: executable.into(),
            console,
        })
    }

    pub fn canonical_name(ctx: &JobContext) -> String {
        format!("{}_formularity.csv", ctx.dataset())
    }
}

impl Integration for Formularity {
    fn name(&self) -> &'static str {
        NAME
    }

    fn spectra_kind(&self) -> Option<SpectraKind> {
        Some(SpectraKind::ScanCsvFolder)
    }

    fn required_inputs(&self, ctx: &JobContext) -> Result<Vec<RequiredInput>, ValidationFailure> {
        Ok(vec![RequiredInput::param_file(ctx.require_param_file()?)])
    }

    fn build_request(
        &self,
        ctx: &JobContext,
        _resume: Option<&ResumePoint>,
    ) -> Result<RunRequest, ValidationFailure> {
        let param_file = ctx.require_param_file()?;
        let scans = SpectraKind::ScanCsvFolder.file_name(ctx.dataset());
        let args = vec![
            ctx.working_file(param_file).display().to_string(),
            ctx.working_file(&scans).display().to_string(),
        ];

        Ok(RunRequest::new(
            &self.executable,
            &ctx.working_dir,
            ctx.key.clone(),
            OutputDescriptor::file(REPORT_PATTERN).in_subdirs(),
        )
        .with_args(args))
    }

    fn console_markers(&self) -> &MarkerTable {
        &self.console
    }

    fn args_file_switch(&self) -> &str {
        "@"
    }

    fn unit_labels(&self) -> UnitLabels {
        UnitLabels::new("scans", "had no peaks")
    }

    fn post_process(
        &self,
        ctx: &JobContext,
        _request: &RunRequest,
    ) -> Result<Vec<PathBuf>, PostProcessError> {
        let search_dir = newest_dated_subdir(&ctx.working_dir).unwrap_or_else(|| ctx.working_dir.clone());
        let report = require_artifact(&search_dir, &OutputDescriptor::file(REPORT_PATTERN))?;
        let dest = ctx.working_file(&Self::canonical_name(ctx));
        Ok(vec![rename_to_canonical(&report, &dest)?])
    }
}
