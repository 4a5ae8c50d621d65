//! End-to-end provisioning runs against a simulated machine
//!
//! `FakeMachine` implements `CommandRunner` and keeps just enough state
//! (installed packages, enabled units, desktop settings, files on disk) for
//! every idempotence check in the catalog to observe the effect of its
//! action. Nothing here touches the real package manager.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use vmsetup::catalog::{GroupSelection, build_registry};
use vmsetup::command::{CommandOutput, CommandRunner, CommandSpec, DryRunRunner};
use vmsetup::config_file::{ProvisionConfig, SudoersDropIn};
use vmsetup::context::{self, ExecutionContext, IdentitySource, TargetUser};
use vmsetup::engine::{ALREADY_SATISFIED, Engine, OutcomeStatus};
use vmsetup::error::{ProvisionError, Result};
use vmsetup::registry::{Step, StepRegistry};

const ORIGINAL_SUDOERS: &str = "user ALL=(ALL) NOPASSWD:ALL\n";

#[derive(Default)]
struct MachineState {
    installed: HashSet<String>,
    upgraded: bool,
    enabled: HashSet<String>,
    xfconf: HashMap<(String, String), String>,
    mutations: Vec<String>,
}

struct FakeMachine {
    state: RefCell<MachineState>,
    visudo_accepts: bool,
}

impl FakeMachine {
    fn new() -> Self {
        Self {
            state: RefCell::new(MachineState::default()),
            visudo_accepts: true,
        }
    }

    fn mutations(&self) -> Vec<String> {
        self.state.borrow().mutations.clone()
    }

    fn clear_mutations(&self) {
        self.state.borrow_mut().mutations.clear();
    }

    fn exit(success: bool, stdout: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            stdout: stdout.to_string(),
            stderr: if success { String::new() } else { "simulated failure".to_string() },
            exit_code: Some(if success { 0 } else { 1 }),
            success,
        })
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let i = args.iter().position(|a| a == flag)?;
        args.get(i + 1).map(String::as_str)
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"simulated").unwrap();
    }
}

impl CommandRunner for FakeMachine {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        // Strip `runuser -u <user> --` so the simulated tool sees its own argv
        let (program, args) = if spec.program == "runuser" {
            let sep = spec.args.iter().position(|a| a == "--").unwrap();
            (spec.args[sep + 1].clone(), spec.args[sep + 2..].to_vec())
        } else {
            (spec.program.clone(), spec.args.clone())
        };

        if !spec.read_only {
            self.state
                .borrow_mut()
                .mutations
                .push(format!("{} {}", program, args.join(" ")));
        }

        let mut state = self.state.borrow_mut();
        match program.as_str() {
            "dpkg-query" => {
                let package = args.last().unwrap();
                let installed = state.installed.contains(package);
                Self::exit(installed, if installed { "install ok installed" } else { "" })
            }
            // Unchanged lists: apt rewrites nothing the provisioner could stat
            "apt-get" if args.contains(&"update".to_string()) => Self::exit(true, ""),
            "apt-get" if args.first().map(String::as_str) == Some("-s") => {
                let plan = if state.upgraded { "" } else { "Inst libc6 [2.36-9] (2.37-1 kali-rolling)\n" };
                Self::exit(true, plan)
            }
            "apt-get" if args.contains(&"full-upgrade".to_string()) => {
                state.upgraded = true;
                Self::exit(true, "")
            }
            "apt-get" if args.contains(&"-f".to_string()) => Self::exit(true, ""),
            "apt-get" => {
                let at = args.iter().position(|a| a == "install").unwrap();
                state.installed.extend(args[at + 1..].iter().cloned());
                Self::exit(true, "")
            }
            "dpkg" | "chown" => Self::exit(true, ""),
            "git" => {
                fs::create_dir_all(Path::new(args.last().unwrap()).join(".git")).unwrap();
                Self::exit(true, "")
            }
            "curl" => {
                Self::touch(Path::new(Self::value_after(&args, "-o").unwrap()));
                Self::exit(true, "")
            }
            "ssh-keygen" => {
                let key = PathBuf::from(Self::value_after(&args, "-f").unwrap());
                Self::touch(&key);
                Self::touch(&key.with_extension("pub"));
                Self::exit(true, "")
            }
            "systemctl" => {
                let unit = args.last().unwrap().clone();
                match args[0].as_str() {
                    "is-enabled" => Self::exit(state.enabled.contains(&unit), ""),
                    _ => {
                        state.enabled.insert(unit);
                        Self::exit(true, "")
                    }
                }
            }
            "xfconf-query" => {
                let key = (
                    Self::value_after(&args, "-c").unwrap().to_string(),
                    Self::value_after(&args, "-p").unwrap().to_string(),
                );
                match Self::value_after(&args, "-s") {
                    Some(value) => {
                        state.xfconf.insert(key, value.to_string());
                        Self::exit(true, "")
                    }
                    None => match state.xfconf.get(&key) {
                        Some(value) => Self::exit(true, &format!("{}\n", value)),
                        None => Self::exit(false, ""),
                    },
                }
            }
            "visudo" => {
                let file = Self::value_after(&args, "-cf").unwrap();
                let parses = fs::read_to_string(file).is_ok_and(|c| c.contains("NOPASSWD"));
                Self::exit(self.visudo_accepts && parses, "")
            }
            other => panic!("unexpected command: {}", other),
        }
    }
}

struct Fixture {
    dir: TempDir,
    config: ProvisionConfig,
    ctx: ExecutionContext,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home/kali");
        fs::create_dir_all(&home).unwrap();

        let config = ProvisionConfig {
            base_packages: vec!["git".to_string(), "curl".to_string(), "zsh".to_string()],
            sudoers: Some(SudoersDropIn {
                path: dir.path().join("etc/sudoers.d/vmsetup-nopasswd"),
                template: "{user} ALL=(ALL:ALL) NOPASSWD: ALL\n".to_string(),
            }),
            apt_cache_stamp: dir.path().join("var/lib/apt/periodic/update-success-stamp"),
            ..ProvisionConfig::default()
        };

        // Same identity on both sides: no runuser wrapping, no chown
        let target = TargetUser {
            name: "kali".to_string(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            home,
        };
        let ctx = ExecutionContext::new("kali", false, Some(target));

        Self { dir, config, ctx }
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("home/kali")
    }

    fn machine(&self) -> FakeMachine {
        FakeMachine::new()
    }

    fn registry(&self, groups: GroupSelection) -> StepRegistry {
        self.config.validate().unwrap();
        build_registry(&self.config, groups).unwrap()
    }
}

#[test]
fn test_first_run_provisions_everything() {
    let fixture = Fixture::new();
    let registry = fixture.registry(GroupSelection {
        web: true,
        ..GroupSelection::default()
    });
    let machine = fixture.machine();

    let report = Engine::new(&machine).run(&registry, &fixture.ctx);

    assert!(!report.is_aborted(), "{}", report.summary());
    assert_eq!(report.outcomes.len(), registry.len());
    assert_eq!(report.warned().count(), 0, "{}", report.summary());

    let home = fixture.home();
    assert!(home.join(".ssh/id_ed25519").is_file());
    assert!(home.join("tools/PEASS-ng/.git").is_dir());
    assert!(home.join("tools/PayloadsAllTheThings/.git").is_dir());
    assert!(home.join("tools/bin/pspy64").is_file());
    let zshrc = fs::read_to_string(home.join(".zshrc")).unwrap();
    assert!(zshrc.contains("export HISTSIZE=100000"));

    let sudoers = fixture.config.sudoers.as_ref().unwrap();
    assert_eq!(
        fs::read_to_string(&sudoers.path).unwrap(),
        "kali ALL=(ALL:ALL) NOPASSWD: ALL\n"
    );

    let mutations = machine.mutations();
    assert!(mutations.iter().any(|m| m.starts_with("apt-get update")));
    assert!(mutations.iter().any(|m| m.contains("install git curl zsh")));
    assert!(mutations.iter().any(|m| m == "systemctl enable --now postgresql"));
}

#[test]
fn test_second_run_is_all_already_satisfied() {
    let fixture = Fixture::new();
    let registry = fixture.registry(GroupSelection::all());
    let machine = fixture.machine();

    let first = Engine::new(&machine).run(&registry, &fixture.ctx);
    assert!(!first.is_aborted(), "{}", first.summary());
    machine.clear_mutations();

    let zshrc_before = fs::read_to_string(fixture.home().join(".zshrc")).unwrap();
    let second = Engine::new(&machine).run(&registry, &fixture.ctx);

    assert_eq!(second.outcomes.len(), registry.len());
    for (step, outcome) in registry.all().iter().zip(&second.outcomes) {
        assert_eq!(outcome.status, OutcomeStatus::Ok, "{}", outcome.step);
        if step.has_check() {
            assert_eq!(outcome.message, ALREADY_SATISFIED, "{}", outcome.step);
        }
    }
    assert!(machine.mutations().is_empty(), "{:?}", machine.mutations());
    assert_eq!(
        fs::read_to_string(fixture.home().join(".zshrc")).unwrap(),
        zshrc_before
    );
}

#[test]
fn test_rejected_sudoers_is_restored_and_warned() {
    let fixture = Fixture::new();
    let sudoers = fixture.config.sudoers.clone().unwrap();
    fs::create_dir_all(sudoers.path.parent().unwrap()).unwrap();
    fs::write(&sudoers.path, ORIGINAL_SUDOERS).unwrap();

    let registry = fixture.registry(GroupSelection::default());
    let mut machine = fixture.machine();
    machine.visudo_accepts = false;

    let report = Engine::new(&machine).run(&registry, &fixture.ctx);

    let outcome = report
        .outcomes
        .iter()
        .find(|o| o.step == "sudoers-nopasswd")
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Warned);
    assert!(outcome.message.contains("rolled back"), "{}", outcome.message);
    assert!(!report.is_aborted());
    assert_eq!(fs::read_to_string(&sudoers.path).unwrap(), ORIGINAL_SUDOERS);

    // Only the original and its backups; no rejected candidate left behind
    for entry in fs::read_dir(sudoers.path.parent().unwrap()).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        assert!(
            name == "vmsetup-nopasswd" || name.starts_with("vmsetup-nopasswd.bak."),
            "unexpected {}",
            name
        );
    }
}

#[test]
fn test_refresh_is_recorded_when_apt_leaves_caches_alone() {
    let fixture = Fixture::new();
    let registry = fixture.registry(GroupSelection::default());
    let machine = fixture.machine();

    let first = Engine::new(&machine).run(&registry, &fixture.ctx);
    assert!(!first.is_aborted(), "{}", first.summary());
    assert!(fixture.config.apt_cache_stamp.is_file());

    machine.clear_mutations();
    let second = Engine::new(&machine).run(&registry, &fixture.ctx);
    let refresh = second.outcomes.iter().find(|o| o.step == "apt-update").unwrap();
    assert_eq!(refresh.message, ALREADY_SATISFIED);
    assert!(!machine.mutations().iter().any(|m| m.starts_with("apt-get update")));
}

#[test]
fn test_missing_home_aborts_before_anything_else() {
    let fixture = Fixture::new();
    fs::remove_dir_all(fixture.home()).unwrap();
    let registry = fixture.registry(GroupSelection::all());
    let machine = fixture.machine();

    let report = Engine::new(&machine).run(&registry, &fixture.ctx);

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].step, "target-user");
    assert_eq!(report.outcomes[0].status, OutcomeStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert!(machine.mutations().is_empty());
    assert!(report.summary().contains("Aborted:"));
}

#[test]
fn test_flaky_step_recovers_on_retry() {
    let fixture = Fixture::new();
    let machine = fixture.machine();
    let mut registry = StepRegistry::new();
    let attempts = std::rc::Rc::new(std::cell::Cell::new(0));
    let a = std::rc::Rc::clone(&attempts);
    registry
        .add(
            Step::builder("apt-lock", move |host| {
                a.set(a.get() + 1);
                if a.get() == 1 {
                    anyhow::bail!("could not get lock /var/lib/dpkg/lock-frontend");
                }
                host.exec(&vmsetup::collaborators::AptUpdate)?;
                Ok(())
            })
            .recovery(vmsetup::collaborators::package::repair),
        )
        .unwrap();

    let report = Engine::new(&machine).run(&registry, &fixture.ctx);

    assert_eq!(attempts.get(), 2);
    assert_eq!(report.outcomes[0].message, "succeeded after recovery");
    let mutations = machine.mutations();
    assert_eq!(mutations[0], "dpkg --configure -a");
    assert!(mutations[1].starts_with("apt-get -y -f install"));
}

#[test]
fn test_dry_run_sends_only_probes() {
    let fixture = Fixture::new();
    let mut config = fixture.config.clone();
    // Direct file edits are not commands; keep the preview command-only
    config.shell_profile = None;
    config.sudoers = None;
    config.ssh_key = false;
    let registry = build_registry(&config, GroupSelection::default()).unwrap();
    let machine = fixture.machine();

    let dry = DryRunRunner::new(&machine);
    let report = Engine::new(dry).run(&registry, &fixture.ctx);

    assert!(!report.is_aborted());
    assert!(machine.mutations().is_empty(), "{:?}", machine.mutations());
    assert!(!fixture.home().join("tools/PEASS-ng/.git").exists());
    assert!(!fixture.config.apt_cache_stamp.exists());
}

#[test]
fn test_duplicate_step_is_configuration_error() {
    let mut config = ProvisionConfig::default();
    config.services = vec!["postgresql".to_string(), "postgresql".to_string()];
    assert!(matches!(config.validate(), Err(ProvisionError::Configuration(_))));

    let err = build_registry(&config, GroupSelection::default()).unwrap_err();
    assert!(matches!(err, ProvisionError::Configuration(_)));
    assert!(err.to_string().contains("service:postgresql"));
}

#[derive(Default)]
struct Ids {
    override_user: Option<&'static str>,
    invoking: Option<&'static str>,
    current: Option<&'static str>,
}

impl IdentitySource for Ids {
    fn override_user(&self) -> Option<String> {
        self.override_user.map(str::to_string)
    }

    fn invoking_user(&self) -> Option<String> {
        self.invoking.map(str::to_string)
    }

    fn current_user(&self) -> Option<String> {
        self.current.map(str::to_string)
    }

    fn lookup(&self, name: &str) -> Option<TargetUser> {
        let uid = match name {
            "root" => 0,
            "alice" => 1001,
            "bob" => 1002,
            _ => return None,
        };
        Some(TargetUser {
            name: name.to_string(),
            uid,
            gid: uid,
            home: PathBuf::from(format!("/home/{}", name)),
        })
    }

    fn is_elevated(&self) -> bool {
        self.current == Some("root")
    }
}

#[test]
fn test_identity_precedence() {
    let all = Ids {
        override_user: Some("alice"),
        invoking: Some("bob"),
        current: Some("root"),
    };
    let ctx = context::resolve(&all, true).unwrap();
    assert_eq!(ctx.target_user(), Some("alice"));

    let invoked = Ids {
        invoking: Some("bob"),
        current: Some("root"),
        ..Ids::default()
    };
    assert_eq!(context::resolve(&invoked, true).unwrap().target_user(), Some("bob"));

    let plain = Ids {
        current: Some("root"),
        ..Ids::default()
    };
    assert_eq!(context::resolve(&plain, true).unwrap().target_user(), Some("root"));
}

#[test]
fn test_unknown_target_is_identity_error_only_when_needed() {
    let ghost = Ids {
        override_user: Some("mallory"),
        current: Some("root"),
        ..Ids::default()
    };
    assert!(matches!(
        context::resolve(&ghost, true),
        Err(ProvisionError::Identity(_))
    ));
    assert!(context::resolve(&ghost, false).unwrap().target_user().is_none());
}
