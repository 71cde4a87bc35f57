/// Distinguished SSH failure kinds. The HTTP surface maps these to status
/// codes (`CommandTimeout` → 408, the rest → 500/503 depending on the path).
#[derive(thiserror::Error, Debug)]
pub enum SshError {
    /// No private key is configured for the target (neither per-server nor
    /// global).
    #[error("no SSH key configured for {0}")]
    KeyNotConfigured(String),

    /// Handshake succeeded but authentication was rejected, or the host key
    /// no longer matches the pinned one.
    #[error("SSH authentication failed for {user}@{host}: {message}")]
    Authentication {
        host: String,
        user: String,
        message: String,
    },

    /// TCP connect or handshake failed on every attempt.
    #[error("SSH connection to {host} failed after {attempts} attempt(s): {message}")]
    Connection {
        host: String,
        attempts: u32,
        message: String,
    },

    /// The command did not finish within the caller's deadline. Never
    /// retried.
    #[error("command timed out after {0}s")]
    CommandTimeout(u64),

    #[error("SSH: {0}")]
    Internal(String),
}
