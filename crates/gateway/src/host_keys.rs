//! Database-backed host-key pinning for the SSH pool.

use async_trait::async_trait;

use hlh_ssh::{HostKeyStore, SshError};
use hlh_store::{host_keys, Store};

pub struct DbHostKeys {
    store: Store,
}

impl DbHostKeys {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HostKeyStore for DbHostKeys {
    async fn pinned(&self, host: &str) -> Result<Option<(String, String)>, SshError> {
        let mut conn = self
            .store
            .acquire()
            .await
            .map_err(|e| SshError::Internal(format!("host key lookup: {e}")))?;
        host_keys::get(&mut conn, host)
            .await
            .map_err(|e| SshError::Internal(format!("host key lookup: {e}")))
    }

    async fn pin(&self, host: &str, key_type: &str, key_base64: &str) -> Result<(), SshError> {
        let mut conn = self
            .store
            .acquire()
            .await
            .map_err(|e| SshError::Internal(format!("host key pin: {e}")))?;
        host_keys::pin(&mut conn, host, key_type, key_base64)
            .await
            .map_err(|e| SshError::Internal(format!("host key pin: {e}")))
    }
}
