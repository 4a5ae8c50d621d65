//! Task registry: the ordered catalog of provisioning steps.
//!
//! Steps are listed declaratively and executed in registration order. There
//! is no dependency graph; ordering is the author's judgment (refresh package
//! lists before installing, create the SSH key before tools that expect it).
//!
//! Registration performs no I/O. Names must be unique and non-empty, which
//! is checked at registration time so a bad catalog fails before anything
//! touches the machine.

use crate::error::{ProvisionError, Result};
use crate::host::Host;
use crate::types::{Criticality, StepGroup};
use std::collections::HashSet;
use std::fmt;

/// Effectful body of a step
pub type StepAction = Box<dyn Fn(&Host<'_>) -> anyhow::Result<()>>;

/// "Is the desired end state already present?"
pub type StepCheck = Box<dyn Fn(&Host<'_>) -> anyhow::Result<bool>>;

/// One named, idempotent unit of provisioning work.
pub struct Step {
    name: String,
    description: String,
    group: StepGroup,
    criticality: Criticality,
    requires_target: bool,
    action: StepAction,
    check: Option<StepCheck>,
    recovery: Option<StepAction>,
}

impl Step {
    pub fn builder<F>(name: impl Into<String>, action: F) -> StepBuilder
    where
        F: Fn(&Host<'_>) -> anyhow::Result<()> + 'static,
    {
        StepBuilder::new(name, action)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn group(&self) -> StepGroup {
        self.group
    }

    pub fn criticality(&self) -> Criticality {
        self.criticality
    }

    pub fn requires_target(&self) -> bool {
        self.requires_target
    }

    pub fn has_check(&self) -> bool {
        self.check.is_some()
    }

    pub fn has_recovery(&self) -> bool {
        self.recovery.is_some()
    }

    pub(crate) fn run_action(&self, host: &Host<'_>) -> anyhow::Result<()> {
        (self.action)(host)
    }

    /// `None` when the step declares no check
    pub(crate) fn run_check(&self, host: &Host<'_>) -> Option<anyhow::Result<bool>> {
        self.check.as_ref().map(|check| check(host))
    }

    pub(crate) fn run_recovery(&self, host: &Host<'_>) -> Option<anyhow::Result<()>> {
        self.recovery.as_ref().map(|recovery| recovery(host))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("criticality", &self.criticality)
            .field("requires_target", &self.requires_target)
            .field("check", &self.check.is_some())
            .field("recovery", &self.recovery.is_some())
            .finish()
    }
}

/// Builder for [`Step`]
pub struct StepBuilder {
    name: String,
    description: String,
    group: StepGroup,
    criticality: Criticality,
    requires_target: bool,
    action: StepAction,
    check: Option<StepCheck>,
    recovery: Option<StepAction>,
}

impl StepBuilder {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&Host<'_>) -> anyhow::Result<()> + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            group: StepGroup::Core,
            criticality: Criticality::Advisory,
            requires_target: false,
            action: Box::new(action),
            check: None,
            recovery: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn group(mut self, group: StepGroup) -> Self {
        self.group = group;
        self
    }

    /// Failure aborts the whole run
    pub fn fatal(mut self) -> Self {
        self.criticality = Criticality::Fatal;
        self
    }

    pub fn criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    /// The step writes to, or runs as, the target user
    pub fn needs_target_user(mut self) -> Self {
        self.requires_target = true;
        self
    }

    pub fn check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Host<'_>) -> anyhow::Result<bool> + 'static,
    {
        self.check = Some(Box::new(check));
        self
    }

    /// Runs once after a failed action, before the single retry
    pub fn recovery<F>(mut self, recovery: F) -> Self
    where
        F: Fn(&Host<'_>) -> anyhow::Result<()> + 'static,
    {
        self.recovery = Some(Box::new(recovery));
        self
    }

    pub fn build(self) -> Result<Step> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ProvisionError::config("step name must not be empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(ProvisionError::config(format!(
                "step name '{}' must not contain whitespace",
                name
            )));
        }
        Ok(Step {
            name,
            description: self.description,
            group: self.group,
            criticality: self.criticality,
            requires_target: self.requires_target,
            action: self.action,
            check: self.check,
            recovery: self.recovery,
        })
    }
}

/// Ordered, name-unique sequence of steps.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: Vec<Step>,
    names: HashSet<String>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step. Duplicate names are a configuration error.
    pub fn register(&mut self, step: Step) -> Result<()> {
        if !self.names.insert(step.name.clone()) {
            return Err(ProvisionError::config(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Build and append in one call.
    pub fn add(&mut self, builder: StepBuilder) -> Result<()> {
        self.register(builder.build()?)
    }

    /// All steps in execution order
    pub fn all(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether identity resolution must produce a target user
    pub fn requires_target_user(&self) -> bool {
        self.steps.iter().any(|s| s.requires_target)
    }
}
