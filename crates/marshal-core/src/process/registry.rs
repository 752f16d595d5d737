//! ProcessRegistry - spawns, tracks, and reclaims background commands.
//!
//! Sessions live in exactly one of two partitions, `running` and
//! `finished`. The exit watcher moves a session across in a single critical
//! section. The registry lock guards partition membership only; per-session
//! buffers have their own lock, and the two are never held together.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::session::{PendingOutput, Session, SessionId, SessionSnapshot, StreamKind};
use super::slug::create_session_slug;
use crate::event_bus::{topics, EventBus};
use crate::shell::{build_shell_command, kill_process_tree, ExitInfo};

/// How long the exit watcher waits for the output readers to hit EOF once
/// the process itself is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Invalid shell configuration: {0}")]
    InvalidShell(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to capture {0} pipe")]
    Pipe(&'static str),

    #[error("No session found for id {0}")]
    NotFound(String),

    #[error("Session {0} has already exited")]
    AlreadyExited(String),

    #[error("Stdin for session {0} is closed")]
    StdinClosed(String),

    #[error("I/O error on session {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Limits and timings for background sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessConfig {
    /// Cap of the aggregated (head-keeping) output buffer.
    pub max_output_bytes: usize,
    /// Cap of each per-stream pending buffer.
    pub pending_max_bytes: usize,
    /// Size of the preview window over the latest output.
    pub tail_bytes: usize,
    /// Bytes requested per read from stdout/stderr.
    pub read_chunk_bytes: usize,
    /// Finished sessions older than this are swept.
    pub finished_ttl_ms: u64,
    /// Upper bound on retained finished sessions.
    pub max_finished_sessions: usize,
    pub sweep_interval_ms: u64,
    /// Shell invocation prefix, e.g. "/bin/bash -c". Defaults to `$SHELL -c`.
    pub shell_prefix: Option<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 200_000,
            pending_max_bytes: 30_000,
            tail_bytes: 2_000,
            read_chunk_bytes: 8 * 1024,
            finished_ttl_ms: 30 * 60 * 1000,
            max_finished_sessions: 64,
            sweep_interval_ms: 60 * 1000,
            shell_prefix: None,
        }
    }
}

/// Which partition a session was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Running,
    Finished,
}

struct FinishedEntry {
    session: Arc<Session>,
    finished_at: DateTime<Utc>,
}

#[derive(Default)]
struct Partitions {
    running: HashMap<SessionId, Arc<Session>>,
    finished: HashMap<SessionId, FinishedEntry>,
    /// Ids handed out but whose process is still being started.
    reserved: HashSet<SessionId>,
}

impl Partitions {
    fn is_taken(&self, id: &str) -> bool {
        self.running.contains_key(id) || self.finished.contains_key(id) || self.reserved.contains(id)
    }
}

struct RegistryInner {
    partitions: Mutex<Partitions>,
    config: ProcessConfig,
    event_bus: Option<Arc<EventBus>>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryInner {
    fn lock_partitions(&self) -> MutexGuard<'_, Partitions> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit<T: Serialize>(&self, event_type: &str, payload: &T) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event_type, payload);
        }
    }

    fn move_to_finished(&self, id: &SessionId) -> bool {
        let mut parts = self.lock_partitions();
        match parts.running.remove(id) {
            Some(session) => {
                parts.finished.insert(
                    id.clone(),
                    FinishedEntry {
                        session,
                        finished_at: Utc::now(),
                    },
                );
                true
            }
            None => false,
        }
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let ttl = ttl_delta(self.config.finished_ttl_ms);
        let mut parts = self.lock_partitions();

        let mut expired: Vec<SessionId> = parts
            .finished
            .iter()
            .filter(|(_, entry)| now - entry.finished_at > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            parts.finished.remove(id);
        }

        let excess = parts
            .finished
            .len()
            .saturating_sub(self.config.max_finished_sessions);
        if excess > 0 {
            let mut by_age: Vec<(DateTime<Utc>, SessionId)> = parts
                .finished
                .iter()
                .map(|(id, entry)| (entry.finished_at, id.clone()))
                .collect();
            by_age.sort();
            for (_, id) in by_age.into_iter().take(excess) {
                parts.finished.remove(&id);
                expired.push(id);
            }
        }

        expired
    }
}

/// Owns every background session for the lifetime of the control plane.
///
/// Cheap to clone; clones share the same partitions.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    pub fn new(config: ProcessConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_event_bus(config: ProcessConfig, event_bus: Arc<EventBus>) -> Self {
        Self::build(config, Some(event_bus))
    }

    fn build(config: ProcessConfig, event_bus: Option<Arc<EventBus>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                partitions: Mutex::new(Partitions::default()),
                config,
                event_bus,
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.inner.config
    }

    /// Spawn `command` as a background session.
    ///
    /// With `yield_ms > 0` the caller waits up to that long (returning early
    /// if the process exits or the session is cancelled); a session still
    /// running afterwards is flagged backgrounded. The session is returned
    /// either way.
    pub async fn spawn(
        &self,
        command: &str,
        cwd: Option<&str>,
        yield_ms: u64,
    ) -> Result<Arc<Session>, ProcessError> {
        let id = {
            let mut parts = self.inner.lock_partitions();
            let id = SessionId(create_session_slug(|candidate| parts.is_taken(candidate)));
            parts.reserved.insert(id.clone());
            id
        };

        let started = self.start_process(&id, command, cwd);
        let (session, child, stdout, stderr) = match started {
            Ok(parts) => parts,
            Err(err) => {
                self.inner.lock_partitions().reserved.remove(&id);
                log::warn!("Failed to spawn `{}`: {}", command, err);
                return Err(err);
            }
        };

        {
            let mut parts = self.inner.lock_partitions();
            parts.reserved.remove(&id);
            parts.running.insert(id.clone(), Arc::clone(&session));
        }
        log::info!(
            "process [{}] spawned pid={:?}: {}",
            id,
            session.pid(),
            command
        );
        self.inner.emit(&topics::process_spawned(&id.0), &session.snapshot());

        let chunk = self.inner.config.read_chunk_bytes.max(1);
        let drains = [
            tokio::spawn(drain_stream(stdout, Arc::clone(&session), StreamKind::Stdout, chunk)),
            tokio::spawn(drain_stream(stderr, Arc::clone(&session), StreamKind::Stderr, chunk)),
        ];
        tokio::spawn(watch_exit(
            Arc::clone(&self.inner),
            Arc::clone(&session),
            child,
            drains,
        ));

        if yield_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(yield_ms)) => {}
                _ = session.cancel_token().cancelled() => {}
                _ = session.wait_exit() => {}
            }
            if !session.is_exited() {
                self.background(&session);
            }
        }

        Ok(session)
    }

    fn start_process(
        &self,
        id: &SessionId,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<
        (
            Arc<Session>,
            Child,
            tokio::process::ChildStdout,
            tokio::process::ChildStderr,
        ),
        ProcessError,
    > {
        let std_cmd = build_shell_command(command, cwd, self.inner.config.shell_prefix.as_deref())?;
        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
        let stdout = child.stdout.take().ok_or(ProcessError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::Pipe("stderr"))?;
        let stdin = child.stdin.take();

        let session = Arc::new(Session::new(
            id.clone(),
            child.id(),
            command.to_string(),
            cwd.map(str::to_string),
            stdin,
            &self.inner.config,
        ));
        Ok((session, child, stdout, stderr))
    }

    /// Flag a session as backgrounded (the caller switches to polling).
    pub fn background(&self, session: &Session) {
        session.mark_backgrounded();
        log::debug!("process [{}] backgrounded", session.id());
        self.inner
            .emit(&topics::process_backgrounded(&session.id().0), &session.snapshot());
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn list_running(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = {
            let parts = self.inner.lock_partitions();
            parts.running.values().cloned().collect()
        };
        snapshots(sessions)
    }

    pub fn list_finished(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = {
            let parts = self.inner.lock_partitions();
            parts.finished.values().map(|e| Arc::clone(&e.session)).collect()
        };
        snapshots(sessions)
    }

    pub fn get_running(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock_partitions().running.get(id).cloned()
    }

    pub fn get_finished(&self, id: &str) -> Option<Arc<Session>> {
        self.inner
            .lock_partitions()
            .finished
            .get(id)
            .map(|e| Arc::clone(&e.session))
    }

    /// Look a session up in either partition.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.locate(id).map(|(session, _)| session)
    }

    pub fn locate(&self, id: &str) -> Option<(Arc<Session>, Partition)> {
        let parts = self.inner.lock_partitions();
        if let Some(session) = parts.running.get(id) {
            return Some((Arc::clone(session), Partition::Running));
        }
        parts
            .finished
            .get(id)
            .map(|e| (Arc::clone(&e.session), Partition::Finished))
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock_partitions().running.len()
    }

    pub fn finished_count(&self) -> usize {
        self.inner.lock_partitions().finished.len()
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Take everything written since the previous poll.
    pub fn drain_pending(&self, id: &str) -> Result<PendingOutput, ProcessError> {
        let session = self
            .get(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        Ok(session.drain_pending())
    }

    /// Full aggregated log, optionally limited to the last `tail_lines` lines.
    pub fn read_log(&self, id: &str, tail_lines: Option<usize>) -> Result<String, ProcessError> {
        let session = self
            .get(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        let output = session.aggregated_output();
        Ok(match tail_lines {
            Some(n) => last_lines(&output, n),
            None => output,
        })
    }

    pub async fn write_stdin(&self, id: &str, data: &[u8], eof: bool) -> Result<(), ProcessError> {
        let session = self.require_running(id)?;
        session.write_stdin(data, eof).await
    }

    /// Cancel the session's tasks and SIGKILL its process group.
    pub fn kill(&self, id: &str) -> Result<(), ProcessError> {
        let session = self.require_running(id)?;
        self.kill_session(&session);
        Ok(())
    }

    fn kill_session(&self, session: &Session) {
        session.mark_killed();
        session.cancel_token().cancel();
        if let Some(pid) = session.pid() {
            if let Err(err) = kill_process_tree(pid) {
                log::debug!("process [{}] kill({}) failed: {}", session.id(), pid, err);
            }
        }
        log::info!("process [{}] killed", session.id());
    }

    fn require_running(&self, id: &str) -> Result<Arc<Session>, ProcessError> {
        match self.locate(id) {
            Some((session, Partition::Running)) => Ok(session),
            Some((_, Partition::Finished)) => Err(ProcessError::AlreadyExited(id.to_string())),
            None => Err(ProcessError::NotFound(id.to_string())),
        }
    }

    /// Delete a session from the registry, killing it first if it's running.
    pub fn remove(&self, id: &str) -> Result<(), ProcessError> {
        let removed = {
            let mut parts = self.inner.lock_partitions();
            match parts.running.remove(id) {
                Some(session) => Some((session, Partition::Running)),
                None => parts
                    .finished
                    .remove(id)
                    .map(|e| (e.session, Partition::Finished)),
            }
        };

        match removed {
            Some((session, partition)) => {
                if partition == Partition::Running {
                    self.kill_session(&session);
                }
                self.inner.emit(&topics::process_removed(id), &serde_json::json!({}));
                Ok(())
            }
            None => Err(ProcessError::NotFound(id.to_string())),
        }
    }

    /// Drop every finished session. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let cleared: Vec<SessionId> = {
            let mut parts = self.inner.lock_partitions();
            parts.finished.drain().map(|(id, _)| id).collect()
        };
        for id in &cleared {
            self.inner.emit(&topics::process_removed(&id.0), &serde_json::json!({}));
        }
        cleared.len()
    }

    /// Wait until the session exits. Fails if the id is unknown.
    pub async fn wait_exit(&self, id: &str) -> Result<Arc<Session>, ProcessError> {
        let session = self
            .get(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        session.wait_exit().await;
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------

    /// Delete finished sessions past the TTL, then evict the oldest ones
    /// beyond the retention cap. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let removed = self.inner.sweep_at(Utc::now());
        if !removed.is_empty() {
            log::debug!("swept {} finished session(s)", removed.len());
        }
        for id in &removed {
            self.inner.emit(&topics::process_removed(&id.0), &serde_json::json!({}));
        }
        removed.len()
    }

    /// Start the periodic sweeper. Calling it twice is a no-op.
    pub fn start_sweeper(&self) {
        let mut slot = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let registry = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = Duration::from_millis(self.inner.config.sweep_interval_ms.max(1));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep();
                    }
                }
            }
        }));
    }

    /// Stop the sweeper, kill every running session, and forget all
    /// sessions.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }

        let running: Vec<Arc<Session>> = {
            let mut parts = self.inner.lock_partitions();
            parts.finished.clear();
            parts.running.drain().map(|(_, s)| s).collect()
        };
        for session in &running {
            session.close_stdin().await;
            self.kill_session(session);
        }
        log::info!(
            "process registry shut down ({} running session(s) killed)",
            running.len()
        );
    }

    #[cfg(test)]
    fn backdate_finished(&self, id: &str, by: chrono::Duration) {
        let mut parts = self.inner.lock_partitions();
        if let Some(entry) = parts.finished.get_mut(id) {
            entry.finished_at = entry.finished_at - by;
        }
    }
}

fn snapshots(mut sessions: Vec<Arc<Session>>) -> Vec<SessionSnapshot> {
    sessions.sort_by_key(|s| s.started_at());
    sessions.iter().map(|s| s.snapshot()).collect()
}

/// Finished-session TTL as a `TimeDelta`, saturating for values chrono
/// cannot represent.
fn ttl_delta(ms: u64) -> TimeDelta {
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}

fn last_lines(text: &str, n: usize) -> String {
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    let lines: Vec<&str> = trimmed.split('\n').collect();
    let start = lines.len().saturating_sub(n);
    let mut out = lines[start..].join("\n");
    if n > 0 && text.ends_with('\n') {
        out.push('\n');
    }
    out
}

async fn drain_stream<R>(mut reader: R, session: Arc<Session>, stream: StreamKind, chunk: usize)
where
    R: AsyncRead + Unpin,
{
    let cancel = session.cancel_token().clone();
    let mut buf = vec![0u8; chunk];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => session.append_output(stream, &buf[..n]),
            Err(err) => {
                log::debug!(
                    "process [{}] {} read error: {}",
                    session.id(),
                    stream.as_str(),
                    err
                );
                break;
            }
        }
    }
}

async fn watch_exit(
    inner: Arc<RegistryInner>,
    session: Arc<Session>,
    mut child: Child,
    drains: [JoinHandle<()>; 2],
) {
    let cancel = session.cancel_token().clone();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            if let Err(err) = child.start_kill() {
                log::debug!("process [{}] start_kill failed: {}", session.id(), err);
            }
            child.wait().await
        }
    };

    for drain in drains {
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            log::debug!(
                "process [{}] output still open after exit; detaching readers",
                session.id()
            );
        }
    }
    cancel.cancel();

    let exit = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(err) => {
            log::warn!("process [{}] wait failed: {}", session.id(), err);
            ExitInfo {
                code: -1,
                signal: None,
            }
        }
    };

    session.record_exit(exit.clone());
    inner.move_to_finished(session.id());
    session.notify_exited();
    session.close_stdin().await;

    log::info!(
        "process [{}] exited code={} signal={:?}",
        session.id(),
        exit.code,
        exit.signal
    );
    inner.emit(&topics::process_exited(&session.id().0), &exit);
}

// ============================================================================
// TESTS
// ============================================================================
