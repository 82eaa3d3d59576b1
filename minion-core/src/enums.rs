//! Enum types for minion entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an enum from its database string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub input: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} value: '{}'", self.kind, self.input)
    }
}

impl std::error::Error for EnumParseError {}

macro_rules! db_str_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($(#[$vmeta:meta])* $variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Convert to the database string representation.
            pub fn as_db_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }

            /// Parse from the database string representation.
            pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    _ => Err(EnumParseError { kind: $kind, input: s.to_string() }),
                }
            }

            /// All variants, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_db_str())
            }
        }

        impl FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_db_str(s)
            }
        }
    };
}

db_str_enum! {
    /// Fixed role identifier for an agent. Bundles capabilities and a
    /// context-staleness window.
    AgentClass, "agent class", {
        Lead => "lead",
        Coder => "coder",
        Builder => "builder",
        Oracle => "oracle",
        Recon => "recon",
        Planner => "planner",
        Auditor => "auditor",
    }
}

db_str_enum! {
    /// A named permission. Classes bundle capabilities; commands require them.
    ///
    /// `HpWrite` is deliberately not part of any class bundle - it is granted
    /// to the daemon identity alone so HP telemetry writes never require
    /// promoting an agent's class.
    Capability, "capability", {
        Manage => "manage",
        Code => "code",
        Build => "build",
        Review => "review",
        Test => "test",
        Investigate => "investigate",
        Plan => "plan",
        HpWrite => "hp_write",
    }
}

db_str_enum! {
    /// How an agent participates: a managed daemon subprocess or a human
    /// terminal session.
    Transport, "transport", {
        Daemon => "daemon",
        Terminal => "terminal",
    }
}

db_str_enum! {
    /// Where HP telemetry comes from for an agent.
    HpMode, "hp mode", {
        /// The daemon writes HP observed from the provider stream.
        Daemon => "daemon",
        /// The agent supplied --hp via set-context; daemon telemetry is
        /// ignored until the next provider turn.
        SelfReported => "self_reported",
        /// No telemetry source; HP is reported as unknown.
        None => "none",
    }
}

impl Default for HpMode {
    fn default() -> Self {
        HpMode::None
    }
}

db_str_enum! {
    /// Computed liveness derived from last_seen.
    Liveness, "liveness", {
        Active => "active",
        Idle => "idle",
        Dead => "dead",
    }
}

db_str_enum! {
    /// Battle plan lifecycle status.
    PlanStatus, "plan status", {
        Active => "active",
        Completed => "completed",
        Superseded => "superseded",
        Canceled => "canceled",
    }
}

db_str_enum! {
    /// Raid-log entry priority.
    LogPriority, "log priority", {
        Low => "low",
        Normal => "normal",
        High => "high",
    }
}

db_str_enum! {
    /// Process-wide emergency flags stored in the datastore.
    FlagKey, "flag key", {
        /// Emergency stop: blocks task assignment and non-lead sends.
        MoonCrash => "moon_crash",
        /// Dismissal: daemons exit after the current turn.
        StandDown => "stand_down",
    }
}

db_str_enum! {
    /// Brevity codes detected in outgoing message content.
    ///
    /// `MoonCrash` and `StandDown` are active: detection flips the
    /// corresponding flag inside the send transaction. The rest are advisory.
    Trigger, "trigger", {
        MoonCrash => "moon_crash",
        StandDown => "stand_down",
        FenixDown => "fenix_down",
        Sitrep => "sitrep",
        Rally => "rally",
        Retreat => "retreat",
        HotZone => "hot_zone",
        Recon => "recon",
    }
}

impl Trigger {
    /// Whether detection has a flag side effect.
    pub fn is_active(&self) -> bool {
        matches!(self, Trigger::MoonCrash | Trigger::StandDown)
    }

    /// Short meaning for the codebook display.
    pub fn meaning(&self) -> &'static str {
        match self {
            Trigger::MoonCrash => "Emergency shutdown. Everyone fenix_down NOW. No new task assignments.",
            Trigger::StandDown => "Stop work, prepare to deregister.",
            Trigger::FenixDown => "Dump all knowledge to disk before context death. Revival protocol.",
            Trigger::Sitrep => "Request status report from target agent.",
            Trigger::Rally => "All agents focus on the specified target/zone.",
            Trigger::Retreat => "Pull back from current approach, reassess.",
            Trigger::HotZone => "Area is dangerous/complex, proceed with caution.",
            Trigger::Recon => "Investigate before acting. Gather intel first.",
        }
    }
}

/// Scan message content for deliberate `!!trigger!!` brevity codes.
///
/// Bare mentions of a code word do not count.
pub fn scan_triggers(content: &str) -> Vec<Trigger> {
    let lower = content.to_lowercase();
    Trigger::ALL
        .iter()
        .copied()
        .filter(|t| lower.contains(&format!("!!{}!!", t.as_db_str())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_strings_round_trip() {
        for class in AgentClass::ALL {
            assert_eq!(AgentClass::from_db_str(class.as_db_str()).unwrap(), *class);
        }
        for cap in Capability::ALL {
            assert_eq!(Capability::from_db_str(cap.as_db_str()).unwrap(), *cap);
        }
        assert!(AgentClass::from_db_str("wizard").is_err());
    }

    #[test]
    fn trigger_scan_requires_wrapping() {
        let found = scan_triggers("heads up: !!moon_crash!! and also rally over there");
        assert_eq!(found, vec![Trigger::MoonCrash]);
        assert!(scan_triggers("we should stand_down eventually").is_empty());
    }

    #[test]
    fn active_triggers() {
        assert!(Trigger::MoonCrash.is_active());
        assert!(Trigger::StandDown.is_active());
        assert!(!Trigger::Sitrep.is_active());
    }
}
