//! AScore phosphosite localization.
//!
//! Scores a search engine's synopsis file against the dataset's DTA
//! spectra. The search type picks the synopsis file and is validated up
//! front; an unknown type is a `ValidationFailure`, not a launch attempt.

use crate::collaborators::SpectraKind;
use crate::context::JobContext;
use crate::integrations::{Integration, RequiredInput, ValidationFailure};
use crate::postprocess::{locate_artifacts, rename_to_canonical, PostProcessError};
use harness_core::markers::MarkerError;
use harness_core::{
    Effect, MarkerTable, Matcher, OutputDescriptor, ResumePoint, RunRequest, UnitLabels,
};
use std::path::PathBuf;

pub const NAME: &str = "ascore";

const OUTPUT_PATTERN: &str = "*_ascore.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    Sequest,
    XTandem,
    Inspect,
    MsgfPlus,
}

impl SearchType {
    pub fn parse(value: &str) -> Result<Self, ValidationFailure> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequest" => Ok(Self::Sequest),
            "xtandem" | "x!tandem" => Ok(Self::XTandem),
            "inspect" => Ok(Self::Inspect),
            "msgfplus" | "msgf+" | "msgfdb" => Ok(Self::MsgfPlus),
            _ => Err(ValidationFailure::UnsupportedSearchType(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequest => "sequest",
            Self::XTandem => "xtandem",
            Self::Inspect => "inspect",
            Self::MsgfPlus => "msgfplus",
        }
    }

    pub fn synopsis_file(&self, dataset: &str) -> String {
        match self {
            Self::Sequest => format!("{dataset}_syn.txt"),
            Self::XTandem => format!("{dataset}_xt.txt"),
            Self::Inspect => format!("{dataset}_inspect_syn.txt"),
            Self::MsgfPlus => format!("{dataset}_msgfplus_syn.txt"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AScore {
    executable: PathBuf,
    console: MarkerTable,
}

impl AScore {
    pub fn new(executable: impl Into<PathBuf>) -> Result<Self, MarkerError> {
        let console = MarkerTable::new()
            .with(
                Matcher::regex(r"(?i)^Percent complete:\s*([\d.]+)\s*%?")?,
                Effect::ProgressFromGroup(1),
            )
            .with(
                Matcher::regex(r"(?i)^Processed (\d+) of (\d+) spectra")?,
                Effect::ProgressFraction { done: 1, total: 2 },
            )
            .with(Matcher::regex(r"(?i)skipping spectrum")?, Effect::UnitFailed)
            .with(Matcher::regex(r"(?i)^warning\b")?, Effect::Warning);

        Ok(Self {
            executable: executable.into(),
            console,
        })
    }

    fn search_type(ctx: &JobContext) -> Result<SearchType, ValidationFailure> {
        SearchType::parse(ctx.require_param("search_type")?)
    }

    pub fn canonical_name(ctx: &JobContext) -> String {
        format!("{}_ascore.txt", ctx.dataset())
    }
}

impl Integration for AScore {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, ctx: &JobContext) -> Result<(), ValidationFailure> {
        Self::search_type(ctx).map(|_| ())
    }

    fn spectra_kind(&self) -> Option<SpectraKind> {
        Some(SpectraKind::DtaText)
    }

    fn required_inputs(&self, ctx: &JobContext) -> Result<Vec<RequiredInput>, ValidationFailure> {
        let search_type = Self::search_type(ctx)?;
        Ok(vec![
            RequiredInput::param_file(ctx.require_param_file()?),
            RequiredInput::data_file(search_type.synopsis_file(ctx.dataset())),
        ])
    }

    fn build_request(
        &self,
        ctx: &JobContext,
        _resume: Option<&ResumePoint>,
    ) -> Result<RunRequest, ValidationFailure> {
        let search_type = Self::search_type(ctx)?;
        let param_file = ctx.require_param_file()?;
        let synopsis = search_type.synopsis_file(ctx.dataset());
        let dta = SpectraKind::DtaText.file_name(ctx.dataset());
        let args = vec![
            format!("-T:{}", search_type.as_str()),
            format!("-F:{}", ctx.working_file(&synopsis).display()),
            format!("-D:{}", ctx.working_file(&dta).display()),
            format!("-P:{}", ctx.working_file(param_file).display()),
            format!("-O:{}", ctx.working_dir.display()),
        ];

        Ok(RunRequest::new(
            &self.executable,
            &ctx.working_dir,
            ctx.key.clone(),
            OutputDescriptor::file(OUTPUT_PATTERN),
        )
        .with_args(args))
    }

    fn console_markers(&self) -> &MarkerTable {
        &self.console
    }

    fn unit_labels(&self) -> UnitLabels {
        UnitLabels::new("spectra", "could not be scored")
    }

    fn post_process(
        &self,
        ctx: &JobContext,
        request: &RunRequest,
    ) -> Result<Vec<PathBuf>, PostProcessError> {
        let dest = ctx.working_file(&Self::canonical_name(ctx));
        if dest.is_file() {
            return Ok(vec![dest]);
        }
        let produced = locate_artifacts(&ctx.working_dir, &request.expected_output)?;
        let Some(src) = produced.first() else {
            return Err(PostProcessError::ArtifactNotFound {
                dir: ctx.working_dir.clone(),
                pattern: OUTPUT_PATTERN.to_string(),
            });
        };
        Ok(vec![rename_to_canonical(src, &dest)?])
    }

    fn result_table(&self, ctx: &JobContext) -> Option<PathBuf> {
        Some(ctx.working_file(&Self::canonical_name(ctx)))
    }
}
