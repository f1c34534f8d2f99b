//! Process sessions backed by a pseudo-terminal.
//!
//! Each session owns exactly one OS process. Spawning prefers a real PTY via
//! `portable-pty`; when PTY allocation fails (containers without /dev/ptmx,
//! odd CI hosts) it falls back to a plain piped child so the session still
//! works, minus resize support.

use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::SessionError;

/// Broadcast channel capacity for session events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Read buffer size for process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Asynchronous events produced by a running session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A chunk of process output, delivered in production order.
    Output(Vec<u8>),
    /// The process terminated. No further events follow.
    Exit {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Parameters for spawning a session process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Shell executable (absolute path).
    pub shell: String,
    /// Working directory.
    pub cwd: String,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
    /// Override the command run inside the PTY (used for multiplexer
    /// attach). When set, `shell` is ignored.
    pub command: Option<Vec<String>>,
}

enum Backend {
    Pty {
        master: Mutex<Box<dyn MasterPty + Send>>,
        writer: Mutex<Box<dyn Write + Send>>,
        killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    },
    Pipes {
        stdin: Mutex<tokio::process::ChildStdin>,
        kill: Mutex<Option<oneshot::Sender<()>>>,
    },
}

/// A single shell process bound to a session identifier.
///
/// Output and exit notifications fan out through a broadcast channel;
/// subscribers that lag are allowed to drop chunks rather than stall the
/// read loop. The read and wait loops hold only weak references, so the
/// process is killed as soon as the last handle drops.
pub struct ProcessSession {
    id: String,
    backend: Backend,
    events: broadcast::Sender<SessionEvent>,
    running: AtomicBool,
    created_at: u64,
    last_activity: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ProcessSession {
    /// Spawn a new session process.
    ///
    /// Tries a PTY first; on failure logs the cause and falls back to a
    /// piped child running `shell -i`.
    pub async fn spawn(id: String, spec: SpawnSpec) -> Result<Arc<Self>, SessionError> {
        match Self::spawn_pty(&id, &spec) {
            Ok(session) => {
                info!(session_id = %id, shell = %spec.shell, "spawned pty session");
                Ok(session)
            }
            Err(err) => {
                warn!(session_id = %id, error = %err, "pty allocation failed, using piped child");
                Self::spawn_pipes(&id, &spec).await
            }
        }
    }

    fn spawn_pty(id: &str, spec: &SpawnSpec) -> Result<Arc<Self>, SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = match &spec.command {
            Some(argv) => {
                let mut c = CommandBuilder::new(&argv[0]);
                c.args(&argv[1..]);
                c
            }
            None => {
                let mut c = CommandBuilder::new(&spec.shell);
                c.arg("-i");
                c
            }
        };
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        cmd.env("TERMLINK_SESSION", id);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        drop(pair.slave);
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let created = now_secs();
        let session = Arc::new(Self {
            id: id.to_string(),
            backend: Backend::Pty {
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                killer: StdMutex::new(killer),
            },
            events,
            running: AtomicBool::new(true),
            created_at: created,
            last_activity: AtomicU64::new(created),
        });

        Self::start_pty_read_loop(&session, reader);
        Self::start_pty_wait_loop(&session, child);
        Ok(session)
    }

    async fn spawn_pipes(id: &str, spec: &SpawnSpec) -> Result<Arc<Self>, SessionError> {
        let mut cmd = match &spec.command {
            Some(argv) => {
                let mut c = tokio::process::Command::new(&argv[0]);
                c.args(&argv[1..]);
                c
            }
            None => {
                let mut c = tokio::process::Command::new(&spec.shell);
                c.arg("-i");
                c
            }
        };
        cmd.current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("TERM", "xterm-256color")
            .env("COLORTERM", "truecolor")
            .env("TERMLINK_SESSION", id)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("child stderr unavailable".to_string()))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let created = now_secs();
        let session = Arc::new(Self {
            id: id.to_string(),
            backend: Backend::Pipes {
                stdin: Mutex::new(stdin),
                kill: Mutex::new(Some(kill_tx)),
            },
            events,
            running: AtomicBool::new(true),
            created_at: created,
            last_activity: AtomicU64::new(created),
        });

        Self::start_pipe_read_loop(&session, stdout);
        Self::start_pipe_read_loop(&session, stderr);
        Self::start_pipe_wait_loop(&session, child, kill_rx);
        info!(session_id = %id, shell = %spec.shell, "spawned piped session");
        Ok(session)
    }

    fn start_pty_read_loop(session: &Arc<Self>, mut reader: Box<dyn Read + Send>) {
        let weak = Arc::downgrade(session);
        let events = session.events.clone();
        let id = session.id.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!(session_id = %id, "pty reader reached eof");
                        break;
                    }
                    Ok(n) => {
                        if let Some(session) = weak.upgrade() {
                            session.touch();
                        }
                        // Nobody listening is fine; persistent sessions may
                        // be detached.
                        let _ = events.send(SessionEvent::Output(buf[..n].to_vec()));
                    }
                    Err(e) => {
                        debug!(session_id = %id, error = %e, "pty reader stopped");
                        break;
                    }
                }
            }
        });
    }

    fn start_pty_wait_loop(session: &Arc<Self>, mut child: Box<dyn Child + Send + Sync>) {
        let weak = Arc::downgrade(session);
        let id = session.id.clone();
        tokio::task::spawn_blocking(move || loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.exit_code() as i32;
                    if let Some(session) = weak.upgrade() {
                        session.finish(Some(code), None);
                    }
                    return;
                }
                Ok(None) => {
                    // All handles gone with the child still alive means
                    // nobody can terminate it anymore; reap it here.
                    if weak.strong_count() == 0 {
                        debug!(session_id = %id, "last handle dropped, killing pty child");
                        let _ = child.kill();
                        let _ = child.wait();
                        return;
                    }
                }
                Err(e) => {
                    error!(session_id = %id, error = %e, "wait failed");
                    if let Some(session) = weak.upgrade() {
                        session.finish(None, None);
                    }
                    return;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        });
    }

    fn start_pipe_read_loop<R>(session: &Arc<Self>, mut reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let weak = Arc::downgrade(session);
        let events = session.events.clone();
        let id = session.id.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(session) = weak.upgrade() {
                            session.touch();
                        }
                        let _ = events.send(SessionEvent::Output(buf[..n].to_vec()));
                    }
                    Err(e) => {
                        debug!(session_id = %id, error = %e, "pipe reader stopped");
                        break;
                    }
                }
            }
        });
    }

    fn start_pipe_wait_loop(
        session: &Arc<Self>,
        mut child: tokio::process::Child,
        kill_rx: oneshot::Receiver<()>,
    ) {
        let weak = Arc::downgrade(session);
        let id = session.id.clone();
        tokio::spawn(async move {
            tokio::pin!(kill_rx);
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on terminate(), and when the session drops with the
                // sender still inside its backend.
                _ = &mut kill_rx => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            match status {
                Ok(status) => {
                    let signal = unix_signal(&status);
                    if let Some(session) = weak.upgrade() {
                        session.finish(status.code(), signal);
                    }
                }
                Err(e) => {
                    error!(session_id = %id, error = %e, "wait failed");
                    if let Some(session) = weak.upgrade() {
                        session.finish(None, None);
                    }
                }
            }
        });
    }

    fn finish(&self, exit_code: Option<i32>, signal: Option<i32>) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(session_id = %self.id, ?exit_code, ?signal, "session process exited");
            let _ = self.events.send(SessionEvent::Exit { exit_code, signal });
        }
    }

    fn touch(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the underlying process is still alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Creation time, Unix epoch seconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Time of the last write or output, Unix epoch seconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Subscribe to session events. Each subscriber gets every event sent
    /// after subscription, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Write bytes to the process input.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::ProcessGone {
                session_id: self.id.clone(),
            });
        }
        self.touch();
        match &self.backend {
            Backend::Pty { writer, .. } => {
                let mut writer = writer.lock().await;
                writer
                    .write_all(data)
                    .and_then(|_| writer.flush())
                    .map_err(|e| SessionError::WriteFailed(e.to_string()))
            }
            Backend::Pipes { stdin, .. } => {
                let mut stdin = stdin.lock().await;
                stdin
                    .write_all(data)
                    .await
                    .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
                stdin
                    .flush()
                    .await
                    .map_err(|e| SessionError::WriteFailed(e.to_string()))
            }
        }
    }

    /// Resize the pseudo-terminal. Silently ignored for piped sessions,
    /// which have no terminal to resize.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::ProcessGone {
                session_id: self.id.clone(),
            });
        }
        match &self.backend {
            Backend::Pty { master, .. } => {
                let master = master.lock().await;
                master
                    .resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    })
                    .map_err(|e| SessionError::ResizeFailed(e.to_string()))
            }
            Backend::Pipes { .. } => {
                debug!(session_id = %self.id, "resize ignored for piped session");
                Ok(())
            }
        }
    }

    /// Terminate the process. Idempotent; the exit event still fires once.
    pub async fn terminate(&self) {
        if !self.is_running() {
            return;
        }
        match &self.backend {
            Backend::Pty { killer, .. } => {
                if let Ok(mut killer) = killer.lock() {
                    if let Err(e) = killer.kill() {
                        warn!(session_id = %self.id, error = %e, "kill failed");
                    }
                }
            }
            Backend::Pipes { kill, .. } => {
                if let Some(tx) = kill.lock().await.take() {
                    let _ = tx.send(());
                }
            }
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        // Runs as soon as the last handle goes away; the loops hold only
        // weak references. A live pty child is killed here, the pipes
        // backend is reaped by its wait task once the kill sender drops.
        if *self.running.get_mut() {
            if let Backend::Pty { killer, .. } = &mut self.backend {
                if let Ok(mut killer) = killer.lock() {
                    let _ = killer.kill();
                }
            }
        }
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Detect a usable login shell for the current user.
pub fn detect_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    for candidate in ["/bin/bash", "/bin/zsh", "/bin/sh"] {
        if std::path::Path::new(candidate).exists() {
            return candidate.to_string();
        }
    }
    "/bin/sh".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn test_spec() -> SpawnSpec {
        SpawnSpec {
            shell: "/bin/sh".to_string(),
            cwd: std::env::temp_dir().display().to_string(),
            cols: 80,
            rows: 24,
            command: None,
        }
    }

    async fn saw_output(rx: &mut broadcast::Receiver<SessionEvent>, needle: &str) -> bool {
        let mut collected = Vec::new();
        timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Output(chunk)) => {
                        collected.extend_from_slice(&chunk);
                        if String::from_utf8_lossy(&collected).contains(needle) {
                            return true;
                        }
                    }
                    Ok(SessionEvent::Exit { .. }) => return false,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    async fn saw_exit(rx: &mut broadcast::Receiver<SessionEvent>) -> bool {
        timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Exit { .. }) => return true,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_spawn_and_echo() {
        let session = ProcessSession::spawn("test-echo".to_string(), test_spec())
            .await
            .expect("spawn failed");
        let mut rx = session.subscribe();
        session
            .write(b"echo hello-session\n")
            .await
            .expect("write failed");
        assert!(saw_output(&mut rx, "hello-session").await);
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_exit_event_fires() {
        let session = ProcessSession::spawn("test-exit".to_string(), test_spec())
            .await
            .expect("spawn failed");
        let mut rx = session.subscribe();
        session.write(b"exit 7\n").await.expect("write failed");
        assert!(saw_exit(&mut rx).await);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_write_after_exit_fails() {
        let session = ProcessSession::spawn("test-gone".to_string(), test_spec())
            .await
            .expect("spawn failed");
        let mut rx = session.subscribe();
        session.write(b"exit\n").await.expect("write failed");
        assert!(saw_exit(&mut rx).await);
        let err = session.write(b"echo nope\n").await.unwrap_err();
        assert!(matches!(err, SessionError::ProcessGone { .. }));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let session = ProcessSession::spawn("test-term".to_string(), test_spec())
            .await
            .expect("spawn failed");
        session.terminate().await;
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_resize_running_session() {
        let session = ProcessSession::spawn("test-resize".to_string(), test_spec())
            .await
            .expect("spawn failed");
        session.resize(120, 40).await.expect("resize failed");
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_resize_after_exit_fails() {
        let session = ProcessSession::spawn("test-resize-gone".to_string(), test_spec())
            .await
            .expect("spawn failed");
        let mut rx = session.subscribe();
        session.write(b"exit\n").await.expect("write failed");
        assert!(saw_exit(&mut rx).await);
        let err = session.resize(100, 30).await.unwrap_err();
        assert!(matches!(err, SessionError::ProcessGone { .. }));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_kills_process() {
        let session = ProcessSession::spawn("test-drop".to_string(), test_spec())
            .await
            .expect("spawn failed");
        let mut rx = session.subscribe();
        drop(session);
        // The child is killed on drop; once the readers hit eof every
        // sender is gone and the channel closes.
        let closed = timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Err(broadcast::error::RecvError::Closed) => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(closed);
    }

    #[test]
    fn test_detect_shell_returns_something() {
        assert!(!detect_shell().is_empty());
    }
}
