//! Caller classification and the per-origin deny table.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Who issued a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// A human driving the agent directly.
    Interactive,
    /// Internally triggered work: timers, recovery, heartbeats.
    Scheduler,
    /// A message from another agent.
    Comm,
    /// An externally loaded app plugin.
    Plugin,
    /// A matched skill template.
    Skill,
}

impl Default for Origin {
    fn default() -> Self {
        Origin::Interactive
    }
}

impl Origin {
    pub const ALL: [Origin; 5] = [
        Origin::Interactive,
        Origin::Scheduler,
        Origin::Comm,
        Origin::Plugin,
        Origin::Skill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Interactive => "interactive",
            Origin::Scheduler => "scheduler",
            Origin::Comm => "comm",
            Origin::Plugin => "plugin",
            Origin::Skill => "skill",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Origin::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| format!("unknown origin: {s}"))
    }
}

/// Capabilities blocked for every non-interactive origin out of the box.
pub const BUILTIN_DENIED: &[&str] = &["shell", "process"];

/// Capability names each origin may never invoke.
///
/// Entries can be added at runtime or from config but never removed, and
/// the built-in entries for [`Origin::Comm`], [`Origin::Plugin`] and
/// [`Origin::Skill`] are always present.
#[derive(Debug, Clone)]
pub struct OriginDeny {
    denied: HashMap<Origin, HashSet<String>>,
}

impl OriginDeny {
    pub fn new() -> Self {
        let mut denied: HashMap<Origin, HashSet<String>> = HashMap::new();
        for origin in [Origin::Comm, Origin::Plugin, Origin::Skill] {
            denied.insert(origin, BUILTIN_DENIED.iter().map(|s| s.to_string()).collect());
        }
        Self { denied }
    }

    /// Built-in table extended with `extra`.
    pub fn with_extra(extra: &HashMap<Origin, Vec<String>>) -> Self {
        let mut deny = Self::new();
        for (origin, names) in extra {
            for name in names {
                deny.deny(*origin, name);
            }
        }
        deny
    }

    pub fn deny(&mut self, origin: Origin, capability: &str) {
        self.denied
            .entry(origin)
            .or_default()
            .insert(capability.to_string());
    }

    pub fn is_denied(&self, origin: Origin, capability: &str) -> bool {
        self.denied
            .get(&origin)
            .is_some_and(|names| names.contains(capability))
    }

    /// Sorted deny list per origin, for display.
    pub fn entries(&self) -> Vec<(Origin, Vec<String>)> {
        let mut entries: Vec<(Origin, Vec<String>)> = Origin::ALL
            .into_iter()
            .filter_map(|origin| {
                let names = self.denied.get(&origin)?;
                let mut names: Vec<String> = names.iter().cloned().collect();
                names.sort();
                Some((origin, names))
            })
            .collect();
        entries.retain(|(_, names)| !names.is_empty());
        entries
    }
}

impl Default for OriginDeny {
    fn default() -> Self {
        Self::new()
    }
}
