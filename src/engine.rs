//! Execution engine.
//!
//! Runs a [`StepRegistry`] strictly in order, one step at a time, applying
//! the same policy to every step:
//!
//! 1. idempotence check: if satisfied, record `ok` and skip the action
//! 2. action
//! 3. on failure: the declared recovery (if any), then exactly one retry
//! 4. still failing: advisory steps record `warned` and the run continues;
//!    fatal steps record `failed` and the run stops
//!
//! Every step that is reached produces exactly one [`Outcome`], in registry
//! order. Nothing is persisted: re-running the program is the resumption
//! mechanism, and the idempotence checks are what make re-running safe.

use crate::command::CommandRunner;
use crate::context::ExecutionContext;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::registry::{Step, StepRegistry};
use crate::types::Criticality;
use std::fmt::Write as _;
use strum::Display;
use tracing::{debug, error, info, warn};

pub const ALREADY_SATISFIED: &str = "already satisfied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutcomeStatus {
    Ok,
    Warned,
    Failed,
}

/// Result of one step, as shown in the final summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub step: String,
    pub status: OutcomeStatus,
    pub message: String,
}

impl Outcome {
    fn new(step: &Step, status: OutcomeStatus, message: impl Into<String>) -> Self {
        Self {
            step: step.name().to_string(),
            status,
            message: message.into(),
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<Outcome>,
    /// Set when a fatal step stopped the run
    pub aborted: Option<ProvisionError>,
}

impl RunReport {
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn warned(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Warned)
    }

    /// 0 = completed (possibly with warnings), 1 = aborted
    pub fn exit_code(&self) -> i32 {
        if self.is_aborted() { 1 } else { 0 }
    }

    /// Operator-facing table of every outcome.
    pub fn summary(&self) -> String {
        let width = self
            .outcomes
            .iter()
            .map(|o| o.step.len())
            .max()
            .unwrap_or(0);

        let mut out = String::from("Provisioning summary\n");
        for outcome in &self.outcomes {
            let marker = match outcome.status {
                OutcomeStatus::Ok => "ok",
                OutcomeStatus::Warned => "WARN",
                OutcomeStatus::Failed => "FAILED",
            };
            let _ = writeln!(
                out,
                "  {:<6}  {:<width$}  {}",
                marker,
                outcome.step,
                outcome.message,
                width = width
            );
        }
        let _ = writeln!(
            out,
            "{} ok, {} warned, {} failed",
            self.count(OutcomeStatus::Ok),
            self.count(OutcomeStatus::Warned),
            self.count(OutcomeStatus::Failed)
        );
        if let Some(reason) = &self.aborted {
            let _ = writeln!(out, "Aborted: {}", reason);
        }
        out
    }
}

/// Sequential step executor.
pub struct Engine<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> Engine<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Run every step in registry order.
    pub fn run(&self, registry: &StepRegistry, ctx: &ExecutionContext) -> RunReport {
        let host = Host::new(ctx, &self.runner);
        let total = registry.len();
        let mut report = RunReport::default();

        info!("Running {} provisioning step(s)", total);

        for (index, step) in registry.all().iter().enumerate() {
            if step.description().is_empty() {
                info!("[{}/{}] {}", index + 1, total, step.name());
            } else {
                info!("[{}/{}] {}: {}", index + 1, total, step.name(), step.description());
            }
            let outcome = execute_step(step, &host);

            if outcome.status == OutcomeStatus::Failed {
                error!("{}: {}; aborting remaining steps", step.name(), outcome.message);
                report.aborted = Some(ProvisionError::step(step.name(), &outcome.message));
                report.outcomes.push(outcome);
                break;
            }
            report.outcomes.push(outcome);
        }

        info!(
            "Provisioning finished: {} ok, {} warned{}",
            report.count(OutcomeStatus::Ok),
            report.count(OutcomeStatus::Warned),
            if report.is_aborted() { ", aborted" } else { "" }
        );
        report
    }
}

fn execute_step(step: &Step, host: &Host<'_>) -> Outcome {
    match step.run_check(host) {
        Some(Ok(true)) => {
            info!("{}: {}", step.name(), ALREADY_SATISFIED);
            return Outcome::new(step, OutcomeStatus::Ok, ALREADY_SATISFIED);
        }
        Some(Ok(false)) => {}
        Some(Err(e)) => debug!("{}: check errored, treating as unsatisfied: {:#}", step.name(), e),
        None => {}
    }

    let first = match step.run_action(host) {
        Ok(()) => return Outcome::new(step, OutcomeStatus::Ok, "done"),
        Err(e) => e,
    };
    warn!("{}: {:#}", step.name(), first);

    let recovered = match step.run_recovery(host) {
        Some(Ok(())) => {
            info!("{}: recovery completed, retrying", step.name());
            true
        }
        Some(Err(e)) => {
            warn!("{}: recovery failed: {:#}", step.name(), e);
            false
        }
        None => {
            debug!("{}: retrying", step.name());
            false
        }
    };

    match step.run_action(host) {
        Ok(()) => {
            let message = if recovered {
                "succeeded after recovery"
            } else {
                "succeeded on retry"
            };
            Outcome::new(step, OutcomeStatus::Ok, message)
        }
        Err(e) => {
            let message = format!("{:#}", e);
            match step.criticality() {
                Criticality::Advisory => {
                    warn!("{}: giving up: {}", step.name(), message);
                    Outcome::new(step, OutcomeStatus::Warned, message)
                }
                Criticality::Fatal => Outcome::new(step, OutcomeStatus::Failed, message),
            }
        }
    }
}
