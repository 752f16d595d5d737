//! Unconditional block on catastrophic commands.
//!
//! Checked before origin denials and approval; no policy setting,
//! autonomous mode or origin reaches past it.

use regex::Regex;
use std::sync::LazyLock;

struct Rule {
    pattern: Regex,
    reason: &'static str,
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    [
        (
            r"\brm\s+(?:-\S*\s+)*-\S*[rR]\S*\s+(?:-\S+\s+)*(?:/|/\*|~/?|\$HOME/?)(?:[\s;&|]|$)",
            "recursive delete of the root or home directory",
        ),
        (
            r"\brm\s+.*--no-preserve-root",
            "recursive delete with --no-preserve-root",
        ),
        (
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            "fork bomb",
        ),
        (r"\bmkfs(?:\.\w+)?\b", "filesystem format"),
        (
            r"\bdd\b.*\bof=/dev/(?:sd|hd|nvme|disk|mmcblk|xvd)",
            "raw write to a block device",
        ),
        (
            r">\s*/dev/(?:sd|hd|nvme|disk|mmcblk|xvd)[a-z0-9]*",
            "redirect onto a block device",
        ),
        (
            r"\bchmod\s+(?:-\S+\s+)*0?777\s+/(?:[\s;&|]|$)",
            "world-writable root directory",
        ),
    ]
    .into_iter()
    .map(|(pattern, reason)| Rule {
        pattern: Regex::new(pattern).unwrap(),
        reason,
    })
    .collect()
});

/// The reason `text` is blocked, if it is.
pub fn check(text: &str) -> Option<&'static str> {
    RULES
        .iter()
        .find(|rule| rule.pattern.is_match(text))
        .map(|rule| rule.reason)
}
