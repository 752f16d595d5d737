//! Built-in capabilities backed by the process registry.

mod process;
mod shell;

pub use process::{process_capability, ProcessCapability};
pub use shell::{shell_capability, truncate_middle, ShellCapability, ShellConfig};

use crate::capability::CapabilityRegistry;
use crate::process::ProcessRegistry;

/// Register `shell` and `process`. Returns the names that passed the
/// registration filters.
pub fn register_builtin(
    capabilities: &CapabilityRegistry,
    processes: &ProcessRegistry,
    shell: &ShellConfig,
) -> Vec<&'static str> {
    let mut registered = Vec::new();
    if capabilities.register(shell_capability(processes, shell)) {
        registered.push("shell");
    }
    if capabilities.register(process_capability(processes)) {
        registered.push("process");
    }
    registered
}
