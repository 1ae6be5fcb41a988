//! harness - external tool execution and progress monitoring
//!
//! Runs one analysis tool per job step: stage inputs, launch the executable,
//! follow its console and status files, checkpoint partial results, classify
//! the outcome and hand results on. Data packages run the same tool over a
//! list of sub-jobs and combine their result tables.

pub mod aggregate;
pub mod checkpoint;
pub mod collaborators;
pub mod context;
pub mod integrations;
pub mod machine;
pub mod postprocess;
pub mod runner;
pub mod watch;

use aggregate::AggregateOutcome;
use collaborators::Collaborators;
use context::JobContext;
use harness_core::{CloseoutResult, Config};
use integrations::IntegrationError;
use machine::{RunOutcome, RunStateMachine};
use tokio_util::sync::CancellationToken;

/// Result of [`Harness::run_tool`].
#[derive(Debug)]
pub enum HarnessOutcome {
    Single(RunOutcome),
    Package(AggregateOutcome),
}

impl HarnessOutcome {
    pub fn closeout(&self) -> &CloseoutResult {
        match self {
            Self::Single(outcome) => &outcome.closeout,
            Self::Package(outcome) => &outcome.closeout,
        }
    }
}

/// Entry point tying configuration, collaborators and cancellation together.
#[derive(Debug)]
pub struct Harness {
    config: Config,
    collaborators: Collaborators,
    cancel: CancellationToken,
}

impl Harness {
    /// Harness with the filesystem collaborators from `config`.
    pub fn new(config: Config) -> Self {
        Self {
            collaborators: Collaborators::from_config(&config),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancelling this token kills a running tool and fails the run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `tool` for one job step, or for each sub-job of a data package.
    pub async fn run_tool(
        &self,
        tool: &str,
        ctx: &JobContext,
    ) -> Result<HarnessOutcome, IntegrationError> {
        let integration = integrations::from_name(tool, &self.config)?;

        if ctx.is_data_package() {
            let outcome = aggregate::run_data_package(
                integration,
                &self.collaborators,
                &self.config,
                ctx,
                &self.cancel,
            )
            .await;
            return Ok(HarnessOutcome::Package(outcome));
        }

        let outcome = RunStateMachine::new(integration, self.collaborators.clone(), self.config.clone())
            .with_cancel(self.cancel.clone())
            .run(ctx)
            .await;
        Ok(HarnessOutcome::Single(outcome))
    }
}
