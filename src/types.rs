//! Type-safe enums shared across the registry, catalog and CLI.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// How the engine treats a step that still fails after its retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Criticality {
    /// Logged as a warning; the run continues
    #[default]
    Advisory,
    /// Aborts the remainder of the run
    Fatal,
}

/// Step groups. `Core` always runs; the rest are opt-in topic tool sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepGroup {
    #[default]
    Core,
    Mobile,
    Web,
    Internal,
    Wifi,
}

impl StepGroup {
    pub const fn is_optional(self) -> bool {
        !matches!(self, Self::Core)
    }
}

/// Desktop configuration store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DesktopBackend {
    /// GNOME/GTK `gsettings`
    #[default]
    Gsettings,
    /// Xfce `xfconf-query`
    Xfconf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_group_parse() {
        assert_eq!("wifi".parse::<StepGroup>().unwrap(), StepGroup::Wifi);
        assert_eq!(StepGroup::Internal.to_string(), "internal");
        assert!("bluetooth".parse::<StepGroup>().is_err());
    }

    #[test]
    fn test_only_core_is_mandatory() {
        let optional: Vec<StepGroup> = StepGroup::iter().filter(|g| g.is_optional()).collect();
        assert_eq!(
            optional,
            vec![
                StepGroup::Mobile,
                StepGroup::Web,
                StepGroup::Internal,
                StepGroup::Wifi
            ]
        );
    }

    #[test]
    fn test_criticality_defaults_to_advisory() {
        assert_eq!(Criticality::default(), Criticality::Advisory);
        let json = serde_json::to_string(&Criticality::Fatal).unwrap();
        assert_eq!(json, "\"fatal\"");
    }
}
