//! Persistent-session multiplexer facade.
//!
//! Named sessions outlive their client connection by living inside an
//! external terminal multiplexer. The facade keeps the registry ignorant of
//! the concrete tool: [`TmuxMultiplexer`] shells out to `tmux`, and
//! [`MemoryMultiplexer`] keeps names in process memory for hosts without
//! tmux (persistence then degrades to the server's lifetime).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use termlink_protocol::MuxSessionInfo;

use super::SessionError;

/// Backend for named persistent sessions.
#[async_trait::async_trait]
pub trait Multiplexer: Send + Sync {
    /// Whether a session with this name already exists in the backend.
    async fn exists(&self, name: &str) -> bool;

    /// Create a new detached session.
    async fn create(&self, name: &str, cwd: &str) -> Result<(), SessionError>;

    /// The argv that, when run inside a PTY, attaches to the named session.
    fn attach_command(&self, name: &str) -> Vec<String>;

    /// List sessions known to the backend.
    async fn list(&self) -> Result<Vec<MuxSessionInfo>, SessionError>;

    /// Remove a session from the backend.
    async fn destroy(&self, name: &str) -> Result<(), SessionError>;

    /// Record attach state for the listing. Backends that track attachment
    /// themselves (tmux) ignore this.
    async fn set_attached(&self, _name: &str, _attached: bool) {}
}

/// tmux-backed multiplexer. Session names are prefixed so the listing does
/// not pick up the operator's own tmux sessions.
pub struct TmuxMultiplexer {
    tmux_path: String,
    prefix: String,
}

impl TmuxMultiplexer {
    pub fn new(tmux_path: String) -> Self {
        Self {
            tmux_path,
            prefix: "termlink-".to_string(),
        }
    }

    /// Locate tmux on PATH, if installed.
    pub fn detect() -> Option<Self> {
        which::which("tmux")
            .ok()
            .map(|p| Self::new(p.display().to_string()))
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn strip(&self, qualified: &str) -> Option<String> {
        qualified.strip_prefix(&self.prefix).map(|s| s.to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, SessionError> {
        Command::new(&self.tmux_path)
            .args(args)
            .output()
            .await
            .map_err(|e| SessionError::MultiplexerFailed(format!("tmux: {e}")))
    }
}

#[async_trait::async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn exists(&self, name: &str) -> bool {
        let target = self.qualified(name);
        match self.run(&["has-session", "-t", &target]).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!(error = %e, "tmux has-session failed");
                false
            }
        }
    }

    async fn create(&self, name: &str, cwd: &str) -> Result<(), SessionError> {
        let target = self.qualified(name);
        let output = self
            .run(&["new-session", "-d", "-s", &target, "-c", cwd])
            .await?;
        if output.status.success() {
            debug!(name = %name, "created tmux session");
            Ok(())
        } else {
            Err(SessionError::MultiplexerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn attach_command(&self, name: &str) -> Vec<String> {
        vec![
            self.tmux_path.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            self.qualified(name),
        ]
    }

    async fn list(&self) -> Result<Vec<MuxSessionInfo>, SessionError> {
        let output = self
            .run(&[
                "list-sessions",
                "-F",
                "#{session_name}\t#{session_created}\t#{session_attached}",
            ])
            .await?;
        if !output.status.success() {
            // tmux exits non-zero when no server is running; that just
            // means no sessions.
            return Ok(Vec::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut sessions = Vec::new();
        for line in stdout.lines() {
            let mut parts = line.split('\t');
            let (Some(raw_name), Some(created), Some(attached)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Some(name) = self.strip(raw_name) else {
                continue;
            };
            sessions.push(MuxSessionInfo {
                name,
                created_at: created.parse().unwrap_or(0),
                attached: attached != "0",
            });
        }
        Ok(sessions)
    }

    async fn destroy(&self, name: &str) -> Result<(), SessionError> {
        let target = self.qualified(name);
        let output = self.run(&["kill-session", "-t", &target]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SessionError::MultiplexerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// In-memory fallback when tmux is unavailable. Names survive re-attach
/// within one server run but not a restart.
#[derive(Default)]
pub struct MemoryMultiplexer {
    sessions: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    created_at: u64,
    attached: bool,
}

impl MemoryMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Multiplexer for MemoryMultiplexer {
    async fn exists(&self, name: &str) -> bool {
        self.sessions.lock().await.contains_key(name)
    }

    async fn create(&self, name: &str, _cwd: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(name) {
            return Err(SessionError::MultiplexerFailed(format!(
                "session already exists: {name}"
            )));
        }
        sessions.insert(
            name.to_string(),
            MemoryEntry {
                created_at: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                attached: false,
            },
        );
        Ok(())
    }

    fn attach_command(&self, _name: &str) -> Vec<String> {
        // No external process to attach to; the registry keeps the live
        // ProcessSession instead.
        Vec::new()
    }

    async fn list(&self) -> Result<Vec<MuxSessionInfo>, SessionError> {
        let sessions = self.sessions.lock().await;
        let mut out: Vec<MuxSessionInfo> = sessions
            .iter()
            .map(|(name, entry)| MuxSessionInfo {
                name: name.clone(),
                created_at: entry.created_at,
                attached: entry.attached,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn destroy(&self, name: &str) -> Result<(), SessionError> {
        self.sessions.lock().await.remove(name);
        Ok(())
    }

    async fn set_attached(&self, name: &str, attached: bool) {
        if let Some(entry) = self.sessions.lock().await.get_mut(name) {
            entry.attached = attached;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_create_and_exists() {
        let mux = MemoryMultiplexer::new();
        assert!(!mux.exists("work").await);
        mux.create("work", "/tmp").await.expect("create failed");
        assert!(mux.exists("work").await);
    }

    #[tokio::test]
    async fn test_memory_duplicate_create_rejected() {
        let mux = MemoryMultiplexer::new();
        mux.create("work", "/tmp").await.expect("create failed");
        assert!(mux.create("work", "/tmp").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_list_sorted_with_attach_state() {
        let mux = MemoryMultiplexer::new();
        mux.create("zeta", "/tmp").await.unwrap();
        mux.create("alpha", "/tmp").await.unwrap();
        mux.set_attached("alpha", true).await;

        let sessions = mux.list().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "alpha");
        assert!(sessions[0].attached);
        assert_eq!(sessions[1].name, "zeta");
        assert!(!sessions[1].attached);
    }

    #[tokio::test]
    async fn test_memory_destroy() {
        let mux = MemoryMultiplexer::new();
        mux.create("gone", "/tmp").await.unwrap();
        mux.destroy("gone").await.unwrap();
        assert!(!mux.exists("gone").await);
    }

    #[test]
    fn test_tmux_attach_command_shape() {
        let mux = TmuxMultiplexer::new("/usr/bin/tmux".to_string());
        let argv = mux.attach_command("work");
        assert_eq!(
            argv,
            vec!["/usr/bin/tmux", "attach-session", "-t", "termlink-work"]
        );
    }

    #[test]
    fn test_tmux_name_prefix_roundtrip() {
        let mux = TmuxMultiplexer::new("tmux".to_string());
        let qualified = mux.qualified("work");
        assert_eq!(qualified, "termlink-work");
        assert_eq!(mux.strip(&qualified), Some("work".to_string()));
        assert_eq!(mux.strip("unrelated"), None);
    }
}
