//! Command allow-list.

use std::collections::HashSet;

use super::command::{has_side_channel, match_keys, split_segments};

/// Entries the default policy starts with: read-only commands that neither
/// modify the filesystem nor run arbitrary code.
pub const DEFAULT_ALLOWLIST: &[&str] = &[
    "ls",
    "pwd",
    "whoami",
    "date",
    "uname",
    "echo",
    "cat",
    "head",
    "tail",
    "wc",
    "which",
    "git status",
    "git diff",
    "git log",
    "git show",
    "git branch",
    "git remote",
    "git rev-parse",
    "git blame",
    "gh pr list",
    "gh pr view",
    "gh issue list",
    "gh issue view",
];

/// Set of approved command patterns.
///
/// An entry approves a command when it equals the whole command, or when
/// every chained segment of the command equals the entry, starts with it
/// as its first token, or starts with it as its first two tokens. A segment
/// with substitution or redirection only passes through a whole-command
/// entry.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    entries: HashSet<String>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::new();
        for entry in entries {
            list.add(entry);
        }
        list
    }

    /// Add an entry. Blank entries are ignored. Returns true if it was new.
    pub fn add(&mut self, entry: impl Into<String>) -> bool {
        let entry = entry.into().trim().to_string();
        if entry.is_empty() {
            return false;
        }
        self.entries.insert(entry)
    }

    pub fn remove(&mut self, entry: &str) -> bool {
        self.entries.remove(entry.trim())
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains(entry.trim())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted entries.
    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<String> = self.entries.iter().cloned().collect();
        entries.sort();
        entries
    }

    pub fn matches(&self, command: &str) -> bool {
        if self.contains(command) {
            return true;
        }

        let segments = split_segments(command);
        if segments.is_empty() {
            return false;
        }

        segments.iter().all(|segment| {
            !has_side_channel(segment)
                && match_keys(segment).iter().any(|key| self.entries.contains(key))
        })
    }
}
