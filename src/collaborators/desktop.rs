//! Desktop configuration store (gsettings / xfconf).
//!
//! Both stores live in the target user's session, so every call runs as the
//! target user with the session bus address of that user.

use crate::command::{CommandArgs, CommandOutput};
use crate::host::Host;
use crate::types::DesktopBackend;
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// `gsettings get <schema> <key>`
#[derive(Debug, Clone)]
pub struct GsettingsGet {
    pub schema: String,
    pub key: String,
}

impl CommandArgs for GsettingsGet {
    fn program(&self) -> &'static str {
        "gsettings"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["get".to_string(), self.schema.clone(), self.key.clone()]
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// `gsettings set <schema> <key> <value>`
#[derive(Debug, Clone)]
pub struct GsettingsSet {
    pub schema: String,
    pub key: String,
    pub value: String,
}

impl CommandArgs for GsettingsSet {
    fn program(&self) -> &'static str {
        "gsettings"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "set".to_string(),
            self.schema.clone(),
            self.key.clone(),
            self.value.clone(),
        ]
    }
}

/// `gsettings list-keys <schema>`
#[derive(Debug, Clone)]
pub struct GsettingsListKeys {
    pub schema: String,
}

impl CommandArgs for GsettingsListKeys {
    fn program(&self) -> &'static str {
        "gsettings"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["list-keys".to_string(), self.schema.clone()]
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// `xfconf-query -c <channel> -p <property>`
#[derive(Debug, Clone)]
pub struct XfconfGet {
    pub channel: String,
    pub property: String,
}

impl CommandArgs for XfconfGet {
    fn program(&self) -> &'static str {
        "xfconf-query"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-c".to_string(),
            self.channel.clone(),
            "-p".to_string(),
            self.property.clone(),
        ]
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// `xfconf-query -c <channel> -p <property> --create -t <type> -s <value>`
#[derive(Debug, Clone)]
pub struct XfconfSet {
    pub channel: String,
    pub property: String,
    pub value: String,
}

impl XfconfSet {
    fn value_type(&self) -> &'static str {
        match self.value.as_str() {
            "true" | "false" => "bool",
            v if v.parse::<i64>().is_ok() => "int",
            _ => "string",
        }
    }
}

impl CommandArgs for XfconfSet {
    fn program(&self) -> &'static str {
        "xfconf-query"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-c".to_string(),
            self.channel.clone(),
            "-p".to_string(),
            self.property.clone(),
            "--create".to_string(),
            "-t".to_string(),
            self.value_type().to_string(),
            "-s".to_string(),
            self.value.clone(),
        ]
    }
}

/// Strip GVariant decoration so `'foo'`, `uint32 0` and `foo`/`0` compare equal.
pub fn normalize_value(raw: &str) -> String {
    let value = raw.trim();
    let value = ["uint32 ", "int32 ", "uint64 ", "int64 ", "double "]
        .iter()
        .find_map(|prefix| value.strip_prefix(prefix))
        .unwrap_or(value);
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value)
        .to_string()
}

/// One key/value pair in the desktop configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopSetting {
    #[serde(default)]
    pub backend: DesktopBackend,
    /// gsettings schema or xfconf channel
    pub schema: String,
    /// gsettings key or xfconf property path
    pub key: String,
    pub value: String,
}

impl DesktopSetting {
    pub fn new(
        backend: DesktopBackend,
        schema: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            schema: schema.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Short identifier used in step names
    pub fn label(&self) -> String {
        let key = self.key.trim_start_matches('/').replace('/', ".");
        format!("{}.{}", self.schema, key)
    }

    fn session_env(host: &Host<'_>) -> Vec<(String, String)> {
        match host.ctx().target() {
            Ok(target) => vec![(
                "DBUS_SESSION_BUS_ADDRESS".to_string(),
                format!("unix:path=/run/user/{}/bus", target.uid),
            )],
            Err(_) => Vec::new(),
        }
    }

    fn read(&self, host: &Host<'_>) -> crate::error::Result<CommandOutput> {
        let mut spec = match self.backend {
            DesktopBackend::Gsettings => GsettingsGet {
                schema: self.schema.clone(),
                key: self.key.clone(),
            }
            .to_spec(),
            DesktopBackend::Xfconf => XfconfGet {
                channel: self.schema.clone(),
                property: self.key.clone(),
            }
            .to_spec(),
        };
        spec.env.extend(Self::session_env(host));
        host.run_as_target(&spec)
    }

    /// Current value, normalized; `None` if the key cannot be read.
    pub fn current(&self, host: &Host<'_>) -> Option<String> {
        self.read(host)
            .ok()
            .filter(|o| o.success)
            .map(|o| normalize_value(&o.stdout))
    }

    pub fn is_applied(&self, host: &Host<'_>) -> bool {
        self.current(host)
            .is_some_and(|v| v == normalize_value(&self.value))
    }

    pub fn apply(&self, host: &Host<'_>) -> anyhow::Result<()> {
        let mut spec = match self.backend {
            DesktopBackend::Gsettings => GsettingsSet {
                schema: self.schema.clone(),
                key: self.key.clone(),
                value: self.value.clone(),
            }
            .to_spec(),
            DesktopBackend::Xfconf => XfconfSet {
                channel: self.schema.clone(),
                property: self.key.clone(),
                value: self.value.clone(),
            }
            .to_spec(),
        };
        spec.env.extend(Self::session_env(host));
        host.run_as_target(&spec)?
            .ensure_success(&format!("setting {}", self.label()))
            .with_context(|| format!("{} = {}", self.label(), self.value))?;
        Ok(())
    }
}

/// Whether `schema` exposes `key`; used to skip settings a desktop lacks.
pub fn has_key(host: &Host<'_>, schema: &str, key: &str) -> bool {
    host.output_as_target(&GsettingsListKeys {
        schema: schema.to_string(),
    })
    .map(|o| o.success && o.stdout.lines().any(|l| l.trim() == key))
    .unwrap_or(false)
}
