//! Pooled SSH command execution.
//!
//! libssh2 (`ssh2`) is a blocking library; every libssh2 call runs inside
//! `tokio::task::spawn_blocking`. Sessions are pooled per `(host, user)` —
//! one session per key, checked out for the duration of a command so a pool
//! entry is never held across unrelated awaits. Idle entries expire after a
//! TTL and are closed by the evictor.

mod error;
mod pool;

pub use error::SshError;
pub use pool::{HostKeyStore, PoolConfig, SshPool, SshTarget};

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Hostname the command actually ran against.
    pub target: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
