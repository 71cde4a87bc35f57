//! Session pool and command execution.

use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use tokio::sync::Mutex;

use crate::{CommandOutput, SshError};

/// Where pinned host keys live. The gateway backs this with the database;
/// tests use an in-memory map.
#[async_trait::async_trait]
pub trait HostKeyStore: Send + Sync {
    /// `(key_type, key_base64)` pinned on first contact, if any.
    async fn pinned(&self, host: &str) -> Result<Option<(String, String)>, SshError>;
    async fn pin(&self, host: &str, key_type: &str, key_base64: &str) -> Result<(), SshError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub connect_timeout: Duration,
    pub idle_ttl: Duration,
    pub max_connect_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_ttl: Duration::from_secs(300),
            max_connect_attempts: 3,
        }
    }
}

struct PooledSession {
    session: ssh2::Session,
    last_used: Instant,
}

/// Process-wide pool of authenticated sessions keyed `(host, user)`.
///
/// Sessions are *checked out* for the duration of a command; the map lock is
/// never held while a command runs.
pub struct SshPool {
    config: PoolConfig,
    sessions: Mutex<HashMap<(String, String), PooledSession>>,
    host_keys: std::sync::Arc<dyn HostKeyStore>,
}

impl SshPool {
    pub fn new(config: PoolConfig, host_keys: std::sync::Arc<dyn HostKeyStore>) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            host_keys,
        }
    }

    /// Run `command` on the target, reusing a pooled session when one is
    /// fresh. Retries apply to connection establishment only, never to the
    /// command itself.
    pub async fn execute(
        &self,
        target: &SshTarget,
        private_key_pem: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SshError> {
        let session = match self.take_fresh(target).await {
            Some(session) => session,
            None => self.connect_and_authenticate(target, private_key_pem).await?,
        };

        let started = Instant::now();
        let command_owned = command.to_string();
        let timeout_ms = timeout.as_millis().min(u64::from(u32::MAX) as u128) as u32;

        let work = tokio::task::spawn_blocking(move || {
            run_command(session, &command_owned, timeout_ms)
        });

        // libssh2's own timeout fires first; the outer deadline is a backstop
        // for a wedged transport. Either way the session is not reusable.
        let outcome = tokio::time::timeout(timeout + Duration::from_secs(5), work).await;
        match outcome {
            Err(_elapsed) => Err(SshError::CommandTimeout(timeout.as_secs())),
            Ok(Err(join)) => Err(SshError::Internal(format!("ssh worker panicked: {join}"))),
            Ok(Ok(Err(message))) => {
                if is_timeout_message(&message) {
                    Err(SshError::CommandTimeout(timeout.as_secs()))
                } else {
                    Err(SshError::Internal(message))
                }
            }
            Ok(Ok(Ok((session, exit_code, stdout, stderr)))) => {
                self.release(target, session).await;
                Ok(CommandOutput {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms: started.elapsed().as_millis() as u64,
                    target: target.host.clone(),
                })
            }
        }
    }

    /// Close idle sessions past the TTL. Returns how many were evicted.
    pub async fn evict_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let ttl = self.config.idle_ttl;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_used.elapsed() < ttl);
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle ssh sessions");
        }
        evicted
    }

    /// Drop every pooled session (shutdown path).
    pub async fn clear(&self) {
        self.sessions.lock().await.clear();
    }

    // ── Private ──────────────────────────────────────────────────────

    async fn take_fresh(&self, target: &SshTarget) -> Option<ssh2::Session> {
        let key = (target.host.clone(), target.user.clone());
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.remove(&key)?;
        if entry.last_used.elapsed() < self.config.idle_ttl {
            Some(entry.session)
        } else {
            // Expired while pooled; drop and reconnect.
            None
        }
    }

    async fn release(&self, target: &SshTarget, session: ssh2::Session) {
        let key = (target.host.clone(), target.user.clone());
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            key,
            PooledSession {
                session,
                last_used: Instant::now(),
            },
        );
    }

    async fn connect_and_authenticate(
        &self,
        target: &SshTarget,
        private_key_pem: &str,
    ) -> Result<ssh2::Session, SshError> {
        let (session, key_type, key_b64) = self.connect_with_retries(target).await?;

        // Pin the host key on first contact; refuse changed keys thereafter.
        match self.host_keys.pinned(&target.host).await? {
            Some((_, pinned)) if pinned != key_b64 => {
                tracing::warn!(host = %target.host, "ssh host key changed since first contact");
                return Err(SshError::Authentication {
                    host: target.host.clone(),
                    user: target.user.clone(),
                    message: "host key does not match the pinned key".into(),
                });
            }
            Some(_) => {}
            None => {
                self.host_keys
                    .pin(&target.host, &key_type, &key_b64)
                    .await?;
                tracing::info!(host = %target.host, key_type, "pinned ssh host key on first contact");
            }
        }

        let user = target.user.clone();
        let key_pem = private_key_pem.to_string();
        let auth_result = tokio::task::spawn_blocking(move || {
            session
                .userauth_pubkey_memory(&user, None, &key_pem, None)
                .map_err(|e| e.to_string())?;
            if !session.authenticated() {
                return Err("server rejected the key".to_string());
            }
            Ok(session)
        })
        .await
        .map_err(|e| SshError::Internal(format!("ssh worker panicked: {e}")))?;

        auth_result.map_err(|message| SshError::Authentication {
            host: target.host.clone(),
            user: target.user.clone(),
            message,
        })
    }

    async fn connect_with_retries(
        &self,
        target: &SshTarget,
    ) -> Result<(ssh2::Session, String, String), SshError> {
        let attempts = self.config.max_connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let host = target.host.clone();
            let connect_timeout = self.config.connect_timeout;
            let result =
                tokio::task::spawn_blocking(move || open_session(&host, connect_timeout))
                    .await
                    .map_err(|e| SshError::Internal(format!("ssh worker panicked: {e}")))?;

            match result {
                Ok(ok) => return Ok(ok),
                Err(message) => {
                    tracing::debug!(
                        host = %target.host,
                        attempt,
                        error = %message,
                        "ssh connect attempt failed"
                    );
                    last_error = message;
                    if attempt < attempts {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(SshError::Connection {
            host: target.host.clone(),
            attempts,
            message: last_error,
        })
    }
}

/// TCP connect + handshake; returns the session and its host key.
fn open_session(
    host: &str,
    connect_timeout: Duration,
) -> Result<(ssh2::Session, String, String), String> {
    let addr = (host, 22u16)
        .to_socket_addrs()
        .map_err(|e| format!("resolve {host}: {e}"))?
        .next()
        .ok_or_else(|| format!("no address for {host}"))?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| e.to_string())?;
    let mut session = ssh2::Session::new().map_err(|e| e.to_string())?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| e.to_string())?;

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| "server presented no host key".to_string())?;
    let key_b64 = BASE64.encode(key);
    Ok((session, format!("{key_type:?}"), key_b64))
}

/// Single exec channel: capture stdout, stderr, exit status.
fn run_command(
    session: ssh2::Session,
    command: &str,
    timeout_ms: u32,
) -> Result<(ssh2::Session, i32, String, String), String> {
    session.set_timeout(timeout_ms);

    let mut channel = session.channel_session().map_err(|e| e.to_string())?;
    channel.exec(command).map_err(|e| e.to_string())?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| e.to_string())?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| e.to_string())?;

    channel.wait_close().map_err(|e| e.to_string())?;
    let exit_code = channel.exit_status().map_err(|e| e.to_string())?;

    session.set_timeout(0);
    Ok((session, exit_code, stdout, stderr))
}

/// Jittered exponential backoff between connection attempts:
/// 500 ms, 1 s, 2 s … plus up to 250 ms of jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 500u64.saturating_mul(1 << (attempt - 1).min(4));
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base_ms + jitter_ms)
}

fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timeout") || lower.contains("timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts_and_stays_jitter_bounded() {
        for attempt in 1..=3u32 {
            let base = 500u64 * (1 << (attempt - 1));
            for _ in 0..20 {
                let delay = backoff_delay(attempt).as_millis() as u64;
                assert!(delay >= base, "delay {delay} below base {base}");
                assert!(delay < base + 250, "delay {delay} exceeds jitter bound");
            }
        }
    }

    #[test]
    fn backoff_exponent_is_capped() {
        // Very large attempt numbers must not overflow the shift.
        let delay = backoff_delay(40);
        assert!(delay.as_millis() < 10_000);
    }

    #[test]
    fn timeout_messages_are_recognised() {
        assert!(is_timeout_message("operation timed out"));
        assert!(is_timeout_message("Timeout waiting for response"));
        assert!(!is_timeout_message("connection refused"));
    }

    #[test]
    fn default_pool_config_matches_contract() {
        let config = PoolConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_ttl, Duration::from_secs(300));
        assert_eq!(config.max_connect_attempts, 3);
    }
}
