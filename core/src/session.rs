use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::Mutex;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::error::ToolError;

/// Upper bound on concurrently tracked background tasks per session.
pub const MAX_BACKGROUND_TASKS: usize = 10;

/// Grace period between SIGTERM and SIGKILL when reaping a process group.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Random lowercase hex string carrying `bytes` bytes of entropy.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

/// Signal an entire process group. Failures are logged and swallowed; the
/// group may already be gone.
pub fn kill_group(pgid: i32, sig: Signal) {
    if let Err(e) = signal::kill(Pid::from_raw(-pgid), sig) {
        debug!("kill {sig} to process group {pgid}: {e}");
    }
}

#[derive(Default)]
struct TaskBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// A shell command running (or finished) outside the request that started it.
///
/// The buffers grow as the reader tasks drain the child's pipes; truncation
/// is applied when output is snapshotted for a `task_output` response. The
/// `done` token doubles as the completion channel: it is cancelled exactly
/// once, after the exit code has been recorded.
pub struct BackgroundTask {
    pgid: i32,
    buffers: Mutex<TaskBuffers>,
    done: CancellationToken,
    exit_code: OnceLock<i32>,
    timed_out: AtomicBool,
}

impl BackgroundTask {
    pub fn new(pgid: i32) -> Self {
        Self {
            pgid,
            buffers: Mutex::new(TaskBuffers::default()),
            done: CancellationToken::new(),
            exit_code: OnceLock::new(),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn append_stdout(&self, chunk: &[u8]) {
        self.buffers.lock().stdout.extend_from_slice(chunk);
    }

    pub fn append_stderr(&self, chunk: &[u8]) {
        self.buffers.lock().stderr.extend_from_slice(chunk);
    }

    /// Lossy snapshot of both streams as captured so far.
    pub fn snapshot(&self) -> (String, String) {
        let buffers = self.buffers.lock();
        (
            String::from_utf8_lossy(&buffers.stdout).into_owned(),
            String::from_utf8_lossy(&buffers.stderr).into_owned(),
        )
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Record the exit code and close the completion channel. The first call
    /// wins; later calls are no-ops.
    pub fn mark_done(&self, exit_code: i32) {
        let _ = self.exit_code.set(exit_code);
        self.done.cancel();
    }

    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub async fn wait_done(&self) {
        self.done.cancelled().await;
    }

    /// SIGTERM the process group, give it [`KILL_GRACE`] to exit, then
    /// SIGKILL. Returns once the completion channel closes or the grace
    /// period after SIGKILL elapses.
    pub async fn terminate(&self) {
        if self.is_done() {
            return;
        }
        kill_group(self.pgid, Signal::SIGTERM);
        if tokio::time::timeout(KILL_GRACE, self.done.cancelled())
            .await
            .is_err()
        {
            kill_group(self.pgid, Signal::SIGKILL);
            let _ = tokio::time::timeout(KILL_GRACE, self.done.cancelled()).await;
        }
    }
}

struct SessionState {
    cwd: PathBuf,
    viewed: HashSet<PathBuf>,
    tasks: HashMap<String, Arc<BackgroundTask>>,
    closed: bool,
    registered: bool,
    last_activity: Instant,
}

/// Per-connection mutable state: working directory, sentinel nonce, the set
/// of viewed files, and the background-task pool.
///
/// All fields are guarded by a single mutex with short critical sections;
/// nothing is held across process execution or other await points.
pub struct Session {
    nonce: String,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(initial_cwd: PathBuf) -> Self {
        Self {
            nonce: random_hex(16),
            state: Mutex::new(SessionState {
                cwd: initial_cwd,
                viewed: HashSet::new(),
                tasks: HashMap::new(),
                closed: false,
                registered: false,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// The out-of-band marker a foreground command emits before `pwd` so the
    /// engine can recover the working directory. The per-session nonce keeps
    /// user output from colliding with it.
    pub fn sentinel(&self) -> String {
        format!("__BORIS_CWD_{}__", self.nonce)
    }

    pub fn cwd(&self) -> PathBuf {
        self.state.lock().cwd.clone()
    }

    pub fn set_cwd(&self, cwd: PathBuf) {
        self.state.lock().cwd = cwd;
    }

    pub fn mark_viewed(&self, path: PathBuf) {
        self.state.lock().viewed.insert(path);
    }

    pub fn has_viewed(&self, path: &Path) -> bool {
        self.state.lock().viewed.contains(path)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Record tool activity for idle reaping.
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    /// One-shot guard for lazy registry insertion; true exactly once.
    pub fn mark_registered(&self) -> bool {
        let mut state = self.state.lock();
        if state.registered {
            false
        } else {
            state.registered = true;
            true
        }
    }

    /// Insert a task, failing when the session is closed or at capacity.
    pub fn add_task(&self, task_id: &str, task: Arc<BackgroundTask>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ToolError::SessionClosed(
                "session is closed; no new background tasks may be started".to_string(),
            ));
        }
        if state.tasks.len() >= MAX_BACKGROUND_TASKS {
            return Err(ToolError::BashTaskLimit(format!(
                "session already has {MAX_BACKGROUND_TASKS} background tasks; collect one with task_output first"
            )));
        }
        state.tasks.insert(task_id.to_string(), task);
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<BackgroundTask>> {
        self.state.lock().tasks.get(task_id).cloned()
    }

    pub fn remove_task(&self, task_id: &str) -> Option<Arc<BackgroundTask>> {
        self.state.lock().tasks.remove(task_id)
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Idempotent teardown: mark the session closed, then reap every task
    /// whose completion channel is still open (SIGTERM, wait, SIGKILL) and
    /// clear the task map. Later `add_task` calls fail with SESSION_CLOSED.
    pub async fn close(&self) {
        let tasks: Vec<Arc<BackgroundTask>> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.tasks.drain().map(|(_, task)| task).collect()
        };
        if !tasks.is_empty() {
            debug!("closing session with {} live background tasks", tasks.len());
        }
        for task in tasks {
            task.terminate().await;
        }
    }
}

/// Concurrent map from transport session id to session, populated lazily by
/// the bash handler on the first background task. Removal implies the
/// session has been closed.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn register(&self, id: &str, session: Arc<Session>) {
        self.sessions.lock().insert(id.to_string(), session);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub async fn close_and_remove(&self, id: &str) {
        let session = self.sessions.lock().remove(id);
        if let Some(session) = session {
            debug!(session_id = id, "closing session");
            session.close().await;
        }
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }

    /// Close and drop every session idle longer than `max_idle`.
    pub async fn reap_idle(&self, max_idle: Duration) {
        let expired: Vec<String> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > max_idle)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in expired {
            debug!(session_id = %id, "reaping idle session");
            self.close_and_remove(&id).await;
        }
    }
}
