//! vmsetup - Main entry point
//!
//! Resolves who is being provisioned, builds the step registry from the
//! configuration and runs it. Exit codes: 0 completed (possibly with
//! warnings), 1 aborted or no target user, 2 invalid configuration.

use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vmsetup::catalog::{GroupSelection, build_registry};
use vmsetup::cli::Cli;
use vmsetup::command::{CommandRunner, DryRunRunner, SystemRunner, dry_run_requested};
use vmsetup::config_file::ProvisionConfig;
use vmsetup::context::{self, ExecutionContext, OsIdentitySource};
use vmsetup::engine::Engine;
use vmsetup::process_guard::{self, ProcessGuard};
use vmsetup::registry::StepRegistry;
use vmsetup::sanity;

const EXIT_ABORTED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// Initialize the logger; `RUST_LOG` overrides the default `info` level
fn init_logger() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(layer).with(filter).init();
}

fn main() -> ExitCode {
    init_logger();

    // Children are terminated if we are interrupted mid-apt
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    let groups = GroupSelection::from(&cli);
    info!("vmsetup starting (optional groups: {:?})", groups.selected());

    let config = match ProvisionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    if !sanity::run_preflight_checks() {
        return ExitCode::from(EXIT_ABORTED);
    }

    let registry = match build_registry(&config, groups) {
        Ok(registry) => registry,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let ctx = match context::resolve(&OsIdentitySource, registry.requires_target_user()) {
        Ok(ctx) => ctx.with_env_overrides(config.environment.clone()),
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_ABORTED);
        }
    };

    let runner = SystemRunner::new(config.command_timeout());
    if dry_run_requested() {
        info!("Dry run: mutating commands are logged, not executed");
        execute(DryRunRunner::new(runner), &registry, &ctx)
    } else {
        execute(runner, &registry, &ctx)
    }
}

fn execute<R: CommandRunner>(runner: R, registry: &StepRegistry, ctx: &ExecutionContext) -> ExitCode {
    let report = Engine::new(runner).run(registry, ctx);
    println!("{}", report.summary());

    for outcome in report.warned() {
        warn!("{} needs attention: {}", outcome.step, outcome.message);
    }

    match u8::try_from(report.exit_code()) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}
