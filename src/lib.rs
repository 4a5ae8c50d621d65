//! vmsetup Library
//!
//! Idempotent provisioning of a Kali VM: an ordered registry of named steps,
//! each with an optional "already done?" check, executed by an engine that
//! applies one retry/recovery policy and classifies every failure as
//! advisory or fatal.

pub mod catalog;
pub mod cli;
pub mod collaborators;
pub mod command;
pub mod config_file;
pub mod context;
pub mod engine;
pub mod error;
pub mod files;
pub mod host;
pub mod process_guard;
pub mod registry;
pub mod sanity;
pub mod types;

// Re-export main types for convenience
pub use catalog::{GroupSelection, build_registry};
pub use command::{
    CommandArgs, CommandOutput, CommandRunner, CommandSpec, DryRunRunner, SystemRunner,
};
pub use config_file::ProvisionConfig;
pub use context::{ExecutionContext, IdentitySource, OsIdentitySource, TargetUser, resolve};
pub use engine::{Engine, Outcome, OutcomeStatus, RunReport};
pub use error::{ProvisionError, Result};
pub use files::{ReplaceOptions, ReplaceOutcome, secure_replace};
pub use host::Host;
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use registry::{Step, StepBuilder, StepRegistry};
pub use types::{Criticality, DesktopBackend, StepGroup};
