//! Credential vault: AES-256-GCM encrypted secrets at rest, keyed by
//! `(credential_type, scope)`.
//!
//! `get` is the only call that returns plaintext; listings and metadata
//! endpoints go through [`Vault::list_for_server`], which never decrypts.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use hlh_domain::credential::{CredentialType, VaultEntryInfo};
use hlh_domain::{Error, Result};
use hlh_store::{vault as vault_store, Store};

/// Secret scope: fleet-wide or bound to one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Global,
    Server(String),
}

impl Scope {
    pub fn as_str(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Server(id) => format!("server:{id}"),
        }
    }
}

pub struct Vault {
    store: Store,
    cipher: Aes256Gcm,
}

impl Vault {
    /// Build the vault from key material. A 64-char hex string is used as
    /// the raw 32-byte key; anything else is digested with SHA-256 first.
    pub fn new(store: Store, key_material: &str) -> Result<Self> {
        let key_bytes: [u8; 32] = match hex_key(key_material) {
            Some(bytes) => bytes,
            None => Sha256::digest(key_material.as_bytes()).into(),
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        Ok(Self { store, cipher })
    }

    pub async fn store_secret(
        &self,
        credential_type: CredentialType,
        scope: &Scope,
        plaintext: &[u8],
    ) -> Result<()> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| Error::Internal("vault encryption failed".into()))?;

        let mut conn = self.store.acquire().await?;
        vault_store::put_secret(
            &mut conn,
            credential_type,
            &scope.as_str(),
            &BASE64.encode(nonce_bytes),
            &BASE64.encode(ciphertext),
        )
        .await
    }

    /// Decrypt and return the secret. Updates the entry's `last_used_at`.
    pub async fn get(
        &self,
        credential_type: CredentialType,
        scope: &Scope,
    ) -> Result<Option<Vec<u8>>> {
        let mut conn = self.store.acquire().await?;
        let Some(row) = vault_store::get_secret(&mut conn, credential_type, &scope.as_str()).await?
        else {
            return Ok(None);
        };

        let nonce_bytes = BASE64
            .decode(&row.nonce)
            .map_err(|_| Error::Internal("vault entry corrupt".into()))?;
        let ciphertext = BASE64
            .decode(&row.ciphertext)
            .map_err(|_| Error::Internal("vault entry corrupt".into()))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| Error::Internal("vault decryption failed (wrong key?)".into()))?;

        vault_store::touch_last_used(&mut conn, credential_type, &scope.as_str()).await?;
        Ok(Some(plaintext))
    }

    pub async fn exists(&self, credential_type: CredentialType, scope: &Scope) -> Result<bool> {
        let mut conn = self.store.acquire().await?;
        vault_store::exists(&mut conn, credential_type, &scope.as_str()).await
    }

    /// Rotation is delete + store; this is the delete half.
    pub async fn delete(&self, credential_type: CredentialType, scope: &Scope) -> Result<bool> {
        let mut conn = self.store.acquire().await?;
        vault_store::delete_secret(&mut conn, credential_type, &scope.as_str()).await
    }

    /// Metadata only — type, scope, presence, last use. No plaintext.
    pub async fn list_for_server(&self, server_id: &str) -> Result<Vec<VaultEntryInfo>> {
        let scope = Scope::Server(server_id.to_string()).as_str();
        let mut conn = self.store.acquire().await?;
        let rows = vault_store::list_for_scope(&mut conn, &scope).await?;
        Ok(rows
            .into_iter()
            .map(|(credential_type, _created, last_used_at)| VaultEntryInfo {
                credential_type,
                scope: scope.clone(),
                configured: true,
                last_used_at,
            })
            .collect())
    }
}

fn hex_key(material: &str) -> Option<[u8; 32]> {
    if material.len() != 64 {
        return None;
    }
    let decoded = hex::decode(material).ok()?;
    decoded.try_into().ok()
}
