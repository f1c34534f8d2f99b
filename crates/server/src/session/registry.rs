//! Session registry: the authoritative map from identifier to live session.
//!
//! All mutations (create, attach, detach, destroy) serialize behind one
//! write lock so capacity checks and name uniqueness cannot race; reads
//! (write/resize routing, listings) take the shared side.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use termlink_protocol::MuxSessionInfo;

use super::mux::Multiplexer;
use super::pty::{ProcessSession, SpawnSpec};
use super::SessionError;

/// Identifier of one client connection, used to track session ownership.
pub type ConnectionId = u64;

/// How often the sweep task scans for exited sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Creating a new session would exceed the configured ceiling.
    #[error("session capacity exceeded: maximum is {max}")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// The named persistent session is already bound to a live connection.
    #[error("session busy: {name} is attached to another connection")]
    SessionBusy {
        /// The contested session name.
        name: String,
    },

    /// No session with this identifier exists.
    #[error("unknown session: {session_id}")]
    UnknownSession {
        /// The missing identifier.
        session_id: String,
    },

    /// The underlying process layer failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Parameters for a create-or-attach request.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
}

/// Result of binding a connection to a session.
pub struct AttachOutcome {
    pub session: Arc<ProcessSession>,
    /// True when an existing persistent session was re-attached.
    pub attached: bool,
}

/// Snapshot of one registry entry, taken without authenticating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    /// Persistent session name; `None` for ephemeral sessions.
    pub name: Option<String>,
    pub running: bool,
    /// Whether a connection currently owns the session.
    pub attached: bool,
    pub created_at: u64,
    pub last_activity: u64,
}

enum SessionKind {
    Ephemeral,
    Persistent { name: String },
}

struct Entry {
    handle: Arc<ProcessSession>,
    kind: SessionKind,
    owner: Option<ConnectionId>,
}

/// Thread-safe registry of live sessions.
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, Entry>>,
    mux: Arc<dyn Multiplexer>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(mux: Arc<dyn Multiplexer>, max_sessions: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            mux,
            max_sessions,
        }
    }

    /// Bind a connection to a session.
    ///
    /// With a `name`, re-attaches the live persistent session of that name
    /// when one exists (refusing if another connection owns it), attaches
    /// to a matching multiplexer session created out of band, or creates a
    /// fresh one. Without a name, creates an ephemeral session. Capacity
    /// applies to new sessions only; re-attach always succeeds.
    pub async fn create_or_attach(
        &self,
        conn: ConnectionId,
        name: Option<&str>,
        opts: CreateOptions,
    ) -> Result<AttachOutcome, RegistryError> {
        let mut inner = self.inner.write().await;

        if let Some(name) = name {
            // Live entry with this name?
            let existing = inner.iter().find_map(|(id, entry)| match &entry.kind {
                SessionKind::Persistent { name: n } if n == name => Some(id.clone()),
                _ => None,
            });
            if let Some(id) = existing {
                let entry = inner.get_mut(&id).ok_or_else(|| {
                    RegistryError::UnknownSession {
                        session_id: id.clone(),
                    }
                })?;
                if !entry.handle.is_running() {
                    // Stale entry; fall through to a fresh create below.
                    inner.remove(&id);
                } else if entry.owner.is_some() {
                    return Err(RegistryError::SessionBusy {
                        name: name.to_string(),
                    });
                } else {
                    entry.owner = Some(conn);
                    let session = entry.handle.clone();
                    drop(inner);
                    self.mux.set_attached(name, true).await;
                    info!(session_id = %session.id(), name = %name, "re-attached persistent session");
                    return Ok(AttachOutcome {
                        session,
                        attached: true,
                    });
                }
            }

            self.check_capacity(&inner)?;

            // Multiplexer session created outside this server?
            if self.mux.exists(name).await {
                let attach_cmd = self.mux.attach_command(name);
                if !attach_cmd.is_empty() {
                    let id = Uuid::new_v4().to_string();
                    let session = ProcessSession::spawn(
                        id.clone(),
                        SpawnSpec {
                            shell: opts.shell.clone(),
                            cwd: opts.cwd.clone(),
                            cols: opts.cols,
                            rows: opts.rows,
                            command: Some(attach_cmd),
                        },
                    )
                    .await?;
                    inner.insert(
                        id,
                        Entry {
                            handle: session.clone(),
                            kind: SessionKind::Persistent {
                                name: name.to_string(),
                            },
                            owner: Some(conn),
                        },
                    );
                    drop(inner);
                    self.mux.set_attached(name, true).await;
                    info!(session_id = %session.id(), name = %name, "attached to external multiplexer session");
                    return Ok(AttachOutcome {
                        session,
                        attached: true,
                    });
                }
                // Backend knows the name but has nothing to attach to
                // (in-memory backend after its process exited). Reclaim
                // the name and create fresh.
                let _ = self.mux.destroy(name).await;
            }

            // Fresh persistent session.
            self.mux.create(name, &opts.cwd).await?;
            let attach_cmd = self.mux.attach_command(name);
            let id = Uuid::new_v4().to_string();
            let session = ProcessSession::spawn(
                id.clone(),
                SpawnSpec {
                    shell: opts.shell.clone(),
                    cwd: opts.cwd.clone(),
                    cols: opts.cols,
                    rows: opts.rows,
                    command: if attach_cmd.is_empty() {
                        None
                    } else {
                        Some(attach_cmd)
                    },
                },
            )
            .await?;
            inner.insert(
                id,
                Entry {
                    handle: session.clone(),
                    kind: SessionKind::Persistent {
                        name: name.to_string(),
                    },
                    owner: Some(conn),
                },
            );
            drop(inner);
            self.mux.set_attached(name, true).await;
            info!(session_id = %session.id(), name = %name, "created persistent session");
            Ok(AttachOutcome {
                session,
                attached: false,
            })
        } else {
            self.check_capacity(&inner)?;
            let id = Uuid::new_v4().to_string();
            let session = ProcessSession::spawn(
                id.clone(),
                SpawnSpec {
                    shell: opts.shell.clone(),
                    cwd: opts.cwd.clone(),
                    cols: opts.cols,
                    rows: opts.rows,
                    command: None,
                },
            )
            .await?;
            inner.insert(
                id,
                Entry {
                    handle: session.clone(),
                    kind: SessionKind::Ephemeral,
                    owner: Some(conn),
                },
            );
            info!(session_id = %session.id(), "created ephemeral session");
            Ok(AttachOutcome {
                session,
                attached: false,
            })
        }
    }

    fn check_capacity(&self, inner: &HashMap<String, Entry>) -> Result<(), RegistryError> {
        let live = inner.values().filter(|e| e.handle.is_running()).count();
        if live >= self.max_sessions {
            warn!(live, max = self.max_sessions, "session capacity exceeded");
            return Err(RegistryError::CapacityExceeded {
                max: self.max_sessions,
            });
        }
        Ok(())
    }

    /// Write bytes to a session's process input.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), RegistryError> {
        let session = self.get(session_id).await?;
        session.write(data).await?;
        Ok(())
    }

    /// Resize a session's pseudo-terminal.
    pub async fn resize(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), RegistryError> {
        let session = self.get(session_id).await?;
        session.resize(cols, rows).await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Arc<ProcessSession>, RegistryError> {
        self.inner
            .read()
            .await
            .get(session_id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| RegistryError::UnknownSession {
                session_id: session_id.to_string(),
            })
    }

    /// Release a connection's binding.
    ///
    /// Ephemeral sessions are destroyed with their connection; persistent
    /// ones stay alive, unowned, ready for re-attach.
    pub async fn detach(&self, conn: ConnectionId, session_id: &str) {
        let mut inner = self.inner.write().await;
        let is_ephemeral = match inner.get(session_id) {
            Some(e) if e.owner == Some(conn) => matches!(e.kind, SessionKind::Ephemeral),
            _ => return,
        };
        if is_ephemeral {
            if let Some(entry) = inner.remove(session_id) {
                drop(inner);
                entry.handle.terminate().await;
                info!(session_id = %session_id, "ephemeral session destroyed on detach");
            }
        } else if let Some(entry) = inner.get_mut(session_id) {
            entry.owner = None;
            let name = match &entry.kind {
                SessionKind::Persistent { name } => name.clone(),
                SessionKind::Ephemeral => return,
            };
            drop(inner);
            self.mux.set_attached(&name, false).await;
            info!(session_id = %session_id, name = %name, "persistent session detached");
        }
    }

    /// Destroy a session outright, including its multiplexer backing.
    pub async fn destroy(&self, session_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .remove(session_id)
            .ok_or_else(|| RegistryError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        drop(inner);
        entry.handle.terminate().await;
        if let SessionKind::Persistent { name } = &entry.kind {
            if let Err(e) = self.mux.destroy(name).await {
                warn!(name = %name, error = %e, "multiplexer destroy failed");
            }
        }
        info!(session_id = %session_id, "session destroyed");
        Ok(())
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|e| e.handle.is_running())
            .count()
    }

    /// Snapshot of every registry entry, for status surfaces.
    pub async fn list(&self) -> Vec<SessionSummary> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, entry)| SessionSummary {
                session_id: id.clone(),
                name: match &entry.kind {
                    SessionKind::Persistent { name } => Some(name.clone()),
                    SessionKind::Ephemeral => None,
                },
                running: entry.handle.is_running(),
                attached: entry.owner.is_some(),
                created_at: entry.handle.created_at(),
                last_activity: entry.handle.last_activity(),
            })
            .collect()
    }

    /// Listing of the multiplexer backend's sessions.
    pub async fn list_mux(&self) -> Result<Vec<MuxSessionInfo>, RegistryError> {
        Ok(self.mux.list().await?)
    }

    /// Remove entries whose process has exited. Returns how many were
    /// dropped.
    pub async fn sweep(&self) -> usize {
        let mut inner = self.inner.write().await;
        let dead: Vec<String> = inner
            .iter()
            .filter(|(_, e)| !e.handle.is_running())
            .map(|(id, _)| id.clone())
            .collect();
        let mut detached_names = Vec::new();
        for id in &dead {
            if let Some(entry) = inner.remove(id) {
                if let SessionKind::Persistent { name } = entry.kind {
                    detached_names.push(name);
                }
            }
        }
        drop(inner);
        for name in detached_names {
            if self.mux.attach_command(&name).is_empty() {
                // Nothing external backs the name once the process is gone
                // (in-memory backend); reclaim it so listings stop
                // advertising a session nobody can attach to.
                if let Err(e) = self.mux.destroy(&name).await {
                    warn!(name = %name, error = %e, "multiplexer destroy failed");
                }
            } else {
                self.mux.set_attached(&name, false).await;
            }
        }
        if !dead.is_empty() {
            debug!(count = dead.len(), "swept exited sessions");
        }
        dead.len()
    }

    /// Spawn the periodic sweep task.
    pub fn start_sweep_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                registry.sweep().await;
            }
        })
    }

    /// Terminate every session. Used at shutdown.
    pub async fn destroy_all(&self) {
        let mut inner = self.inner.write().await;
        let entries: Vec<Entry> = inner.drain().map(|(_, e)| e).collect();
        drop(inner);
        for entry in entries {
            entry.handle.terminate().await;
        }
        info!("all sessions destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mux::MemoryMultiplexer;

    fn registry(max: usize) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            Arc::new(MemoryMultiplexer::new()),
            max,
        ))
    }

    fn opts() -> CreateOptions {
        CreateOptions {
            shell: "/bin/sh".to_string(),
            cwd: std::env::temp_dir().display().to_string(),
            cols: 80,
            rows: 24,
        }
    }

    #[tokio::test]
    async fn test_ephemeral_create_and_detach_destroys() {
        let reg = registry(4);
        let outcome = reg.create_or_attach(1, None, opts()).await.unwrap();
        assert!(!outcome.attached);
        assert_eq!(reg.count().await, 1);

        let id = outcome.session.id().to_string();
        reg.detach(1, &id).await;
        assert_eq!(reg.count().await, 0);
    }

    #[tokio::test]
    async fn test_persistent_survives_detach_and_reattaches() {
        let reg = registry(4);
        let first = reg.create_or_attach(1, Some("work"), opts()).await.unwrap();
        assert!(!first.attached);
        let id = first.session.id().to_string();

        reg.detach(1, &id).await;
        assert_eq!(reg.count().await, 1);

        let second = reg.create_or_attach(2, Some("work"), opts()).await.unwrap();
        assert!(second.attached);
        assert_eq!(second.session.id(), id);

        reg.destroy_all().await;
    }

    #[tokio::test]
    async fn test_busy_persistent_session_refuses_second_attach() {
        let reg = registry(4);
        reg.create_or_attach(1, Some("work"), opts()).await.unwrap();
        let err = reg
            .create_or_attach(2, Some("work"), opts())
            .await
            .err()
            .expect("second attach should be refused");
        assert!(matches!(err, RegistryError::SessionBusy { .. }));

        reg.destroy_all().await;
    }

    #[tokio::test]
    async fn test_capacity_blocks_new_but_not_reattach() {
        let reg = registry(1);
        let first = reg.create_or_attach(1, Some("only"), opts()).await.unwrap();
        let id = first.session.id().to_string();

        let err = reg
            .create_or_attach(2, None, opts())
            .await
            .err()
            .expect("capacity should be enforced");
        assert!(matches!(err, RegistryError::CapacityExceeded { max: 1 }));

        reg.detach(1, &id).await;
        let again = reg.create_or_attach(2, Some("only"), opts()).await.unwrap();
        assert!(again.attached);

        reg.destroy_all().await;
    }

    #[tokio::test]
    async fn test_list_reflects_detach_removal() {
        let reg = registry(4);
        let outcome = reg.create_or_attach(1, None, opts()).await.unwrap();
        let id = outcome.session.id().to_string();

        let listed = reg.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, id);
        assert!(listed[0].name.is_none());
        assert!(listed[0].running);
        assert!(listed[0].attached);

        reg.detach(1, &id).await;
        assert!(reg.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_marks_detached_persistent_unattached() {
        let reg = registry(4);
        let outcome = reg.create_or_attach(1, Some("work"), opts()).await.unwrap();
        let id = outcome.session.id().to_string();

        reg.detach(1, &id).await;
        let listed = reg.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name.as_deref(), Some("work"));
        assert!(!listed[0].attached);

        reg.destroy_all().await;
    }

    #[tokio::test]
    async fn test_write_to_unknown_session() {
        let reg = registry(4);
        let err = reg.write("missing", b"hi").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownSession { .. }));
    }

    #[tokio::test]
    async fn test_destroy_removes_entry_and_mux_name() {
        let reg = registry(4);
        let outcome = reg.create_or_attach(1, Some("gone"), opts()).await.unwrap();
        let id = outcome.session.id().to_string();
        reg.destroy(&id).await.unwrap();
        assert_eq!(reg.count().await, 0);
        assert!(reg.list_mux().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_drops_exited_sessions() {
        let reg = registry(4);
        let outcome = reg.create_or_attach(1, None, opts()).await.unwrap();
        let mut rx = outcome.session.subscribe();
        outcome.session.write(b"exit\n").await.unwrap();
        // Wait for the exit event before sweeping.
        loop {
            match rx.recv().await {
                Ok(crate::session::SessionEvent::Exit { .. }) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        let swept = reg.sweep().await;
        assert_eq!(swept, 1);
        assert_eq!(reg.count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_memory_backend_name() {
        let reg = registry(4);
        let outcome = reg.create_or_attach(1, Some("doomed"), opts()).await.unwrap();
        let mut rx = outcome.session.subscribe();
        outcome.session.write(b"exit\n").await.unwrap();
        loop {
            match rx.recv().await {
                Ok(crate::session::SessionEvent::Exit { .. }) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(reg.sweep().await, 1);
        // The name must not keep advertising a session nothing backs.
        assert!(reg.list_mux().await.unwrap().is_empty());
    }
}
