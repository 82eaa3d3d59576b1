//! Identity types for minion entities
//!
//! Rowid-backed entities get strongly-typed ID newtypes so a `TaskId` can
//! never be passed where a `MessageId` is expected. Agents are keyed by name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trait for type-safe rowid-backed entity IDs.
pub trait RowIdType:
    Copy + Clone + Eq + PartialEq + Ord + std::hash::Hash + fmt::Debug + fmt::Display + Send + Sync
{
    /// The name of the entity type (e.g., "task", "message").
    const ENTITY_NAME: &'static str;

    /// Wrap a raw rowid.
    fn new(raw: i64) -> Self;

    /// The underlying rowid.
    fn as_i64(&self) -> i64;
}

/// Error type for parsing entity IDs from strings.
#[derive(Debug, Clone)]
pub struct IdParseError {
    pub entity_name: &'static str,
    pub input: String,
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to parse {} id from '{}'",
            self.entity_name, self.input
        )
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_row_id {
    ($name:ident, $entity:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl RowIdType for $name {
            const ENTITY_NAME: &'static str = $entity;

            fn new(raw: i64) -> Self {
                Self(raw)
            }

            fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<i64>().map(Self).map_err(|_| IdParseError {
                    entity_name: Self::ENTITY_NAME,
                    input: s.to_string(),
                })
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> i64 {
                id.0
            }
        }
    };
}

define_row_id!(TaskId, "task", "Unique identifier for a task.");
define_row_id!(MessageId, "message", "Unique identifier for a message.");
define_row_id!(PlanId, "plan", "Unique identifier for a battle plan.");
define_row_id!(LogEntryId, "log_entry", "Unique identifier for a raid-log entry.");
define_row_id!(FenixRecordId, "fenix_record", "Unique identifier for a fenix-down record.");

/// Agent identity - a unique, human-chosen name.
///
/// Names are the primary key of the registry; there is no surrogate id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentName(String);

impl AgentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentName({})", self.0)
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for AgentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_ids_do_not_cross() {
        let t = TaskId::new(7);
        let m = MessageId::new(7);
        assert_eq!(t.as_i64(), m.as_i64());
        assert_eq!(t.to_string(), "7");
        assert_eq!("42".parse::<TaskId>().unwrap(), TaskId::new(42));
        assert!("x".parse::<TaskId>().is_err());
    }

    #[test]
    fn agent_name_round_trips() {
        let a = AgentName::from("gamma-1");
        assert_eq!(a.as_str(), "gamma-1");
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"gamma-1\"");
    }
}
