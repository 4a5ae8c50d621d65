//! The handle every step action receives.
//!
//! `Host` pairs the immutable [`ExecutionContext`] with the run's
//! [`CommandRunner`], and is the only way a step reaches the machine. Keeping
//! both behind one borrowed value is what lets tests drive the whole catalog
//! with a recording runner.

use crate::command::{CommandArgs, CommandOutput, CommandRunner, CommandSpec};
use crate::context::ExecutionContext;
use crate::error::Result;
use tracing::debug;

#[derive(Clone, Copy)]
pub struct Host<'a> {
    ctx: &'a ExecutionContext,
    runner: &'a dyn CommandRunner,
}

impl<'a> Host<'a> {
    pub fn new(ctx: &'a ExecutionContext, runner: &'a dyn CommandRunner) -> Self {
        Self { ctx, runner }
    }

    pub fn ctx(&self) -> &'a ExecutionContext {
        self.ctx
    }

    /// True when mutating commands are only being logged
    pub fn is_dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }

    fn with_overrides(&self, spec: &CommandSpec) -> CommandSpec {
        let mut spec = spec.clone();
        let mut env = self.ctx.env_overrides().to_vec();
        env.append(&mut spec.env);
        spec.env = env;
        spec
    }

    /// Run as the acting (possibly elevated) identity
    pub fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.runner.run(&self.with_overrides(spec))
    }

    /// Run under the target user's identity and environment
    pub fn run_as_target(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let spec = self.ctx.as_target(&self.with_overrides(spec))?;
        self.runner.run(&spec)
    }

    /// Run typed arguments and require success
    pub fn exec<A: CommandArgs>(&self, args: &A) -> Result<()> {
        self.run(&args.to_spec())?.ensure_success(args.program())
    }

    pub fn exec_as_target<A: CommandArgs>(&self, args: &A) -> Result<()> {
        self.run_as_target(&args.to_spec())?
            .ensure_success(args.program())
    }

    /// Run typed arguments and return the raw output, success or not
    pub fn output<A: CommandArgs>(&self, args: &A) -> Result<CommandOutput> {
        self.run(&args.to_spec())
    }

    pub fn output_as_target<A: CommandArgs>(&self, args: &A) -> Result<CommandOutput> {
        self.run_as_target(&args.to_spec())
    }

    /// True when the command exits zero. A command that cannot run at all
    /// counts as false.
    pub fn probe<A: CommandArgs>(&self, args: &A) -> bool {
        match self.run(&args.to_spec().read_only()) {
            Ok(output) => output.success,
            Err(e) => {
                debug!("probe {} errored: {}", args.program(), e);
                false
            }
        }
    }

    pub fn probe_as_target<A: CommandArgs>(&self, args: &A) -> bool {
        match self.run_as_target(&args.to_spec().read_only()) {
            Ok(output) => output.success,
            Err(e) => {
                debug!("probe {} errored: {}", args.program(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TargetUser;
    use std::cell::RefCell;
    use std::path::PathBuf;

    #[derive(Default)]
    struct Recorder {
        seen: RefCell<Vec<CommandSpec>>,
    }

    impl CommandRunner for Recorder {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.seen.borrow_mut().push(spec.clone());
            Ok(CommandOutput {
                success: spec.program != "false",
                exit_code: Some(if spec.program == "false" { 1 } else { 0 }),
                ..CommandOutput::ok()
            })
        }
    }

    struct Tool(&'static str);

    impl CommandArgs for Tool {
        fn program(&self) -> &'static str {
            self.0
        }
        fn to_cli_args(&self) -> Vec<String> {
            vec![]
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "root",
            true,
            Some(TargetUser {
                name: "kali".to_string(),
                uid: 1000,
                gid: 1000,
                home: PathBuf::from("/home/kali"),
            }),
        )
        .with_env_overrides([("DEBIAN_FRONTEND", "noninteractive")])
    }

    #[test]
    fn test_env_overrides_applied_first() {
        let ctx = ctx();
        let runner = Recorder::default();
        let host = Host::new(&ctx, &runner);

        host.run(&CommandSpec::new("apt-get").env("DEBIAN_FRONTEND", "readline"))
            .unwrap();

        let seen = runner.seen.borrow();
        // Step-specific env comes later and wins when the child reads it
        assert_eq!(
            seen[0].env,
            vec![
                ("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()),
                ("DEBIAN_FRONTEND".to_string(), "readline".to_string()),
            ]
        );
    }

    #[test]
    fn test_probe_is_read_only_and_reports_exit() {
        let ctx = ctx();
        let runner = Recorder::default();
        let host = Host::new(&ctx, &runner);

        assert!(host.probe(&Tool("true")));
        assert!(!host.probe(&Tool("false")));
        assert!(host.probe_as_target(&Tool("true")));

        let seen = runner.seen.borrow();
        assert!(seen.iter().all(|s| s.read_only));
        assert_eq!(seen[2].program, "runuser");
    }

    #[test]
    fn test_exec_surfaces_failure() {
        let ctx = ctx();
        let runner = Recorder::default();
        let host = Host::new(&ctx, &runner);

        assert!(host.exec(&Tool("true")).is_ok());
        assert!(host.exec(&Tool("false")).is_err());
    }
}
