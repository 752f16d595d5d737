//! Shell command construction and OS process helpers.
//!
//! Commands arrive from the agent as a single shell string, so they are run
//! through `<shell> -c '<command>'` rather than exec'd directly. The shell is
//! taken from `$SHELL` unless a prefix is configured; shells that don't accept
//! POSIX `-c` syntax fall back to bash or sh.

use serde::Serialize;
use std::process::{Command, ExitStatus};

use crate::process::ProcessError;

/// Shells whose `-c` handling isn't POSIX compatible.
#[cfg(unix)]
const NON_POSIX_SHELLS: &[&str] = &["fish", "nu", "nushell", "elvish", "xonsh", "ion"];

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub code: i32,
    pub signal: Option<String>,
}

impl ExitInfo {
    /// Extract an exit code and, on Unix, the terminating signal name.
    ///
    /// A normal exit reports the process's own code. A signal-terminated
    /// process reports `128 + signo`, matching what shells report.
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self { code, signal: None };
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signo) = status.signal() {
                return Self {
                    code: 128 + signo,
                    signal: Some(signal_name(signo)),
                };
            }
        }

        Self {
            code: 1,
            signal: None,
        }
    }
}

/// Conventional name for a Unix signal number.
pub fn signal_name(signo: i32) -> String {
    let name = match signo {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return format!("SIG{signo}"),
    };
    name.to_string()
}

/// Build a command that runs `command` through the shell.
///
/// The child gets its own process group on Unix so the whole tree can be
/// signalled at once.
#[cfg(unix)]
pub fn build_shell_command(
    command: &str,
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, ProcessError> {
    use std::os::unix::process::CommandExt;

    let prefix = get_shell_prefix(shell_prefix);
    let prefix_parts: Vec<&str> = prefix.split_whitespace().collect();
    let Some((shell_program, shell_args)) = prefix_parts.split_first() else {
        return Err(ProcessError::InvalidShell("empty shell prefix".to_string()));
    };

    let mut cmd = Command::new(shell_program);
    cmd.args(shell_args).arg(command);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.process_group(0);

    Ok(cmd)
}

/// Windows version: runs the command through `cmd /C`.
#[cfg(windows)]
pub fn build_shell_command(
    command: &str,
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, ProcessError> {
    let prefix = shell_prefix.filter(|p| !p.is_empty()).unwrap_or("cmd /C");
    let prefix_parts: Vec<&str> = prefix.split_whitespace().collect();
    let Some((shell_program, shell_args)) = prefix_parts.split_first() else {
        return Err(ProcessError::InvalidShell("empty shell prefix".to_string()));
    };

    let mut cmd = Command::new(shell_program);
    cmd.args(shell_args).arg(command);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    Ok(cmd)
}

/// Get the shell prefix to use for command execution.
///
/// A non-empty custom prefix (e.g. "/bin/zsh -c") is used as-is. Otherwise
/// the prefix is `$SHELL -c`, with non-POSIX shells swapped for bash or sh.
#[cfg(unix)]
fn get_shell_prefix(custom_prefix: Option<&str>) -> String {
    if let Some(prefix) = custom_prefix {
        if !prefix.trim().is_empty() {
            return prefix.to_string();
        }
    }

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let shell_name = std::path::Path::new(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let effective_shell = if shell.is_empty() || NON_POSIX_SHELLS.contains(&shell_name) {
        if std::path::Path::new("/bin/bash").exists() {
            "/bin/bash"
        } else {
            "/bin/sh"
        }
    } else {
        shell.as_str()
    };

    format!("{} -c", effective_shell)
}

/// Send `SIGKILL` to the process group led by `pid`, falling back to the
/// process itself when the group is already gone.
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) -> std::io::Result<()> {
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2) takes plain integers and has no memory-safety
    // requirements; a stale pid yields ESRCH which is reported as an error.
    let group = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if group == 0 {
        return Ok(());
    }
    // SAFETY: as above.
    let single = unsafe { libc::kill(pid, libc::SIGKILL) };
    if single == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn kill_process_tree(_pid: u32) -> std::io::Result<()> {
    // The exit watcher's `start_kill` covers non-Unix platforms.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_info_serializes() {
        let exit = ExitInfo {
            code: 137,
            signal: Some("SIGKILL".to_string()),
        };
        let json = serde_json::to_string(&exit).unwrap();
        assert!(json.contains("\"code\":137"));
        assert!(json.contains("\"signal\":\"SIGKILL\""));
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(42), "SIG42");
    }

    #[test]
    #[cfg(unix)]
    fn exit_info_from_normal_exit() {
        let status = Command::new("sh").args(["-c", "exit 3"]).status().unwrap();
        assert_eq!(
            ExitInfo::from_status(status),
            ExitInfo {
                code: 3,
                signal: None
            }
        );
    }

    #[test]
    #[cfg(unix)]
    fn exit_info_from_signal() {
        let status = Command::new("sh")
            .args(["-c", "kill -9 $$"])
            .status()
            .unwrap();
        let info = ExitInfo::from_status(status);
        assert_eq!(info.code, 137);
        assert_eq!(info.signal.as_deref(), Some("SIGKILL"));
    }

    #[test]
    #[cfg(unix)]
    fn shell_prefix_uses_custom_prefix() {
        assert_eq!(get_shell_prefix(Some("/bin/zsh -c")), "/bin/zsh -c");
    }

    #[test]
    #[cfg(unix)]
    fn shell_prefix_blank_uses_default() {
        assert!(get_shell_prefix(Some("  ")).ends_with(" -c"));
        assert!(get_shell_prefix(None).ends_with(" -c"));
    }

    #[test]
    #[cfg(unix)]
    fn build_shell_command_passes_command_as_one_arg() {
        let cmd = build_shell_command("echo a && echo b", Some("/tmp"), Some("/bin/sh -c")).unwrap();
        assert_eq!(cmd.get_program().to_str().unwrap(), "/bin/sh");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(args, vec!["-c", "echo a && echo b"]);
        assert_eq!(cmd.get_current_dir().unwrap().to_str().unwrap(), "/tmp");
    }
}
