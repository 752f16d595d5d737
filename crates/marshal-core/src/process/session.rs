//! A single background command: identity, buffers, and lifecycle state.

use std::borrow::Borrow;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use super::buffer::{HeadBuffer, TailBuffer};
use super::registry::{ProcessConfig, ProcessError};
use crate::shell::ExitInfo;

/// Session identifier (a slug such as `swift-cove`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// Still running after the yield window elapsed; the caller polls.
    Backgrounded,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Output produced since the previous drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes that overflowed the pending buffers since the previous drain.
    pub dropped: u64,
}

impl PendingOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Point-in-time view of a session for listings and query responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub pid: Option<u32>,
    pub command: String,
    pub cwd: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub total_bytes: u64,
    pub truncated: bool,
    pub tail: String,
}

struct SessionState {
    aggregated: HeadBuffer,
    tail: TailBuffer,
    pending_stdout: TailBuffer,
    pending_stderr: TailBuffer,
    total_bytes: u64,
    backgrounded: bool,
    killed: bool,
    exit: Option<ExitInfo>,
    finished_at: Option<DateTime<Utc>>,
}

/// One spawned command.
///
/// Immutable identity lives directly on the struct; everything the drain
/// tasks, pollers and the exit watcher mutate sits behind `state`, which is
/// independent of the registry's map lock.
pub struct Session {
    id: SessionId,
    pid: Option<u32>,
    command: String,
    cwd: Option<String>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    stdin: AsyncMutex<Option<ChildStdin>>,
    state: Mutex<SessionState>,
    exited: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        pid: Option<u32>,
        command: String,
        cwd: Option<String>,
        stdin: Option<ChildStdin>,
        config: &ProcessConfig,
    ) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            id,
            pid,
            command,
            cwd,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            stdin: AsyncMutex::new(stdin),
            state: Mutex::new(SessionState {
                aggregated: HeadBuffer::new(config.max_output_bytes),
                tail: TailBuffer::new(config.tail_bytes),
                pending_stdout: TailBuffer::new(config.pending_max_bytes),
                pending_stderr: TailBuffer::new(config.pending_max_bytes),
                total_bytes: 0,
                backgrounded: false,
                killed: false,
                exit: None,
                finished_at: None,
            }),
            exited,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn append_output(&self, stream: StreamKind, chunk: &[u8]) {
        let mut state = self.lock_state();
        state.total_bytes += chunk.len() as u64;
        state.aggregated.append(chunk);
        state.tail.append(chunk);
        match stream {
            StreamKind::Stdout => state.pending_stdout.append(chunk),
            StreamKind::Stderr => state.pending_stderr.append(chunk),
        }
    }

    /// Read and clear both pending buffers in one critical section, so each
    /// byte is handed to exactly one poller.
    pub fn drain_pending(&self) -> PendingOutput {
        let mut state = self.lock_state();
        let dropped = state.pending_stdout.dropped() + state.pending_stderr.dropped();
        PendingOutput {
            dropped,
            stdout: state.pending_stdout.take(),
            stderr: state.pending_stderr.take(),
        }
    }

    /// Everything captured in the aggregated buffer, decoded lossily.
    pub fn aggregated_output(&self) -> String {
        String::from_utf8_lossy(self.lock_state().aggregated.as_bytes()).into_owned()
    }

    pub fn tail_output(&self) -> String {
        String::from_utf8_lossy(self.lock_state().tail.as_bytes()).into_owned()
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock_state().total_bytes
    }

    pub fn is_truncated(&self) -> bool {
        self.lock_state().aggregated.is_truncated()
    }

    pub fn is_backgrounded(&self) -> bool {
        self.lock_state().backgrounded
    }

    pub fn is_exited(&self) -> bool {
        self.lock_state().exit.is_some()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.lock_state().exit.clone()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.lock_state();
        if state.exit.is_some() {
            SessionStatus::Exited
        } else if state.backgrounded {
            SessionStatus::Backgrounded
        } else {
            SessionStatus::Running
        }
    }

    pub(crate) fn mark_backgrounded(&self) {
        self.lock_state().backgrounded = true;
    }

    pub(crate) fn mark_killed(&self) {
        self.lock_state().killed = true;
    }

    /// Record how the process ended. A killed session whose platform
    /// reports no signal is still recorded as `SIGKILL`.
    pub(crate) fn record_exit(&self, mut exit: ExitInfo) {
        let mut state = self.lock_state();
        if state.killed && exit.signal.is_none() {
            exit.signal = Some("SIGKILL".to_string());
        }
        state.exit = Some(exit);
        state.finished_at = Some(Utc::now());
    }

    /// Wake everything waiting in [`Session::wait_exit`].
    pub(crate) fn notify_exited(&self) {
        self.exited.send_replace(true);
    }

    /// Resolve once the session has exited and moved to the finished
    /// partition.
    pub async fn wait_exit(&self) {
        let mut rx = self.exited.subscribe();
        // The sender lives as long as `self`, so this only fails if the
        // session is being torn down, which also means we're done waiting.
        let _ = rx.wait_for(|exited| *exited).await;
    }

    /// Write bytes to the process's stdin; `eof` closes it afterwards.
    pub async fn write_stdin(&self, data: &[u8], eof: bool) -> Result<(), ProcessError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(ProcessError::StdinClosed(self.id.to_string()));
        };

        let io_err = |source| ProcessError::Io {
            id: self.id.to_string(),
            source,
        };
        if !data.is_empty() {
            stdin.write_all(data).await.map_err(io_err)?;
            stdin.flush().await.map_err(io_err)?;
        }
        if eof {
            guard.take();
        }
        Ok(())
    }

    pub(crate) async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock_state();
        let status = if state.exit.is_some() {
            SessionStatus::Exited
        } else if state.backgrounded {
            SessionStatus::Backgrounded
        } else {
            SessionStatus::Running
        };
        SessionSnapshot {
            id: self.id.clone(),
            pid: self.pid,
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            started_at: self.started_at,
            finished_at: state.finished_at,
            status,
            exit_code: state.exit.as_ref().map(|e| e.code),
            exit_signal: state.exit.as_ref().and_then(|e| e.signal.clone()),
            total_bytes: state.total_bytes,
            truncated: state.aggregated.is_truncated(),
            tail: String::from_utf8_lossy(state.tail.as_bytes()).into_owned(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(config: &ProcessConfig) -> Session {
        Session::new(
            SessionId::from("swift-cove"),
            Some(4242),
            "make build".to_string(),
            Some("/tmp".to_string()),
            None,
            config,
        )
    }

    fn small_config() -> ProcessConfig {
        ProcessConfig {
            max_output_bytes: 10,
            pending_max_bytes: 6,
            tail_bytes: 4,
            ..ProcessConfig::default()
        }
    }

    mod session_id {
        use super::*;

        #[test]
        fn display_shows_slug() {
            assert_eq!(SessionId::from("calm-reef").to_string(), "calm-reef");
        }

        #[test]
        fn hash_map_lookup_by_str() {
            let mut map = std::collections::HashMap::new();
            map.insert(SessionId::from("calm-reef"), 1);
            assert_eq!(map.get("calm-reef"), Some(&1));
        }
    }

    mod buffers {
        use super::*;

        #[test]
        fn append_updates_every_buffer() {
            let session = test_session(&ProcessConfig::default());
            session.append_output(StreamKind::Stdout, b"out\n");
            session.append_output(StreamKind::Stderr, b"err\n");

            assert_eq!(session.aggregated_output(), "out\nerr\n");
            assert_eq!(session.total_bytes(), 8);

            let pending = session.drain_pending();
            assert_eq!(pending.stdout_text(), "out\n");
            assert_eq!(pending.stderr_text(), "err\n");
        }

        #[test]
        fn aggregated_keeps_head_while_pending_keeps_tail() {
            let session = test_session(&small_config());
            session.append_output(StreamKind::Stdout, b"0123456789");
            session.append_output(StreamKind::Stdout, b"abcdef");

            assert_eq!(session.aggregated_output(), "0123456789");
            assert!(session.is_truncated());
            assert_eq!(session.tail_output(), "cdef");
            assert_eq!(session.drain_pending().stdout_text(), "abcdef");
            assert_eq!(session.total_bytes(), 16);
        }

        #[test]
        fn drain_reports_overflow_once() {
            let session = test_session(&small_config());
            session.append_output(StreamKind::Stdout, b"0123456789");
            session.append_output(StreamKind::Stdout, b"abcdef");

            let pending = session.drain_pending();
            assert_eq!(pending.stdout_text(), "abcdef");
            assert_eq!(pending.dropped, 10);

            session.append_output(StreamKind::Stderr, b"x");
            let pending = session.drain_pending();
            assert_eq!(pending.stderr_text(), "x");
            assert_eq!(pending.dropped, 0);
        }

        #[test]
        fn second_drain_is_empty() {
            let session = test_session(&ProcessConfig::default());
            session.append_output(StreamKind::Stdout, b"once");
            assert!(!session.drain_pending().is_empty());
            assert!(session.drain_pending().is_empty());
        }

        #[test]
        fn concurrent_drains_never_duplicate_bytes() {
            let session = std::sync::Arc::new(test_session(&ProcessConfig::default()));
            let writer = {
                let session = std::sync::Arc::clone(&session);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        session.append_output(StreamKind::Stdout, b"x");
                    }
                })
            };
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let session = std::sync::Arc::clone(&session);
                    std::thread::spawn(move || {
                        let mut seen = 0;
                        for _ in 0..500 {
                            seen += session.drain_pending().stdout.len();
                        }
                        seen
                    })
                })
                .collect();

            writer.join().unwrap();
            let mut total: usize = readers.into_iter().map(|r| r.join().unwrap()).sum();
            total += session.drain_pending().stdout.len();
            assert_eq!(total, 1000);
        }
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn status_transitions() {
            let session = test_session(&ProcessConfig::default());
            assert_eq!(session.status(), SessionStatus::Running);
            session.mark_backgrounded();
            assert_eq!(session.status(), SessionStatus::Backgrounded);
            session.record_exit(ExitInfo {
                code: 0,
                signal: None,
            });
            assert_eq!(session.status(), SessionStatus::Exited);
            assert!(session.is_backgrounded());
        }

        #[test]
        fn killed_session_records_sigkill() {
            let session = test_session(&ProcessConfig::default());
            session.mark_killed();
            session.record_exit(ExitInfo {
                code: 1,
                signal: None,
            });
            assert_eq!(session.exit_info().unwrap().signal.as_deref(), Some("SIGKILL"));
        }

        #[tokio::test]
        async fn wait_exit_resolves_after_notify() {
            let session = std::sync::Arc::new(test_session(&ProcessConfig::default()));
            let waiter = {
                let session = std::sync::Arc::clone(&session);
                tokio::spawn(async move { session.wait_exit().await })
            };
            session.record_exit(ExitInfo {
                code: 0,
                signal: None,
            });
            session.notify_exited();
            tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }

        #[tokio::test]
        async fn write_without_stdin_reports_closed() {
            let session = test_session(&ProcessConfig::default());
            let err = session.write_stdin(b"hi", false).await.unwrap_err();
            assert!(matches!(err, ProcessError::StdinClosed(id) if id == "swift-cove"));
        }

        #[test]
        fn snapshot_reflects_state() {
            let session = test_session(&ProcessConfig::default());
            session.append_output(StreamKind::Stdout, b"done");
            session.record_exit(ExitInfo {
                code: 2,
                signal: None,
            });
            let snap = session.snapshot();
            assert_eq!(snap.id.0, "swift-cove");
            assert_eq!(snap.pid, Some(4242));
            assert_eq!(snap.status, SessionStatus::Exited);
            assert_eq!(snap.exit_code, Some(2));
            assert_eq!(snap.tail, "done");
            assert!(snap.finished_at.is_some());

            let json = serde_json::to_value(&snap).unwrap();
            assert_eq!(json["status"], "exited");
            assert_eq!(json["exitCode"], 2);
        }
    }
}
