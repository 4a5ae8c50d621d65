//! Typed arguments for the external tools the steps depend on.
//!
//! Each struct implements [`CommandArgs`](crate::command::CommandArgs) and maps
//! its fields to the exact argument vector of one tool. Helpers next to them
//! answer the "is this already done?" questions the idempotence checks need.

pub mod desktop;
pub mod http;
pub mod package;
pub mod service;
pub mod system;
pub mod vcs;

pub use desktop::DesktopSetting;
pub use http::CurlDownload;
pub use package::{AptFixBroken, AptInstall, AptUpdate, AptUpgrade, DpkgConfigure, DpkgQuery};
pub use service::{ServiceAction, Systemctl};
pub use system::{Chown, SshKeygen, Visudo};
pub use vcs::GitClone;
