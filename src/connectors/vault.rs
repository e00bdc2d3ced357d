//! Credential vault
//!
//! Writes receive a plaintext token payload plus metadata; encryption
//! happens before persistence via an injected key service. Reads decrypt
//! under the current tenant context only. The decrypted payload never
//! appears in logs or audit metadata; other subsystems must go through
//! this API, never raw SQL.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{ConnectorCredential, ConnectorError, CredentialStatus, Result};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

// ============================================================================
// Key Service
// ============================================================================

/// Key-management boundary. Implementations encrypt and decrypt opaque
/// payloads; the vault never sees key material.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Encrypt a plaintext payload into an opaque envelope.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt an envelope produced by `encrypt`.
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// AES-256-GCM key service with a process-local key. The envelope is
/// `nonce || ciphertext`.
pub struct AesGcmKeyService {
    key: Key<Aes256Gcm>,
}

impl AesGcmKeyService {
    /// Create a key service from a 32-byte key.
    pub fn new(key_bytes: [u8; 32]) -> Self {
        Self {
            key: Key::<Aes256Gcm>::from(key_bytes),
        }
    }

    /// Generate a key service with a fresh random key. Intended for
    /// tests and local development; production keys come from the key
    /// management collaborator.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key_bytes);
        Self::new(key_bytes)
    }
}

#[async_trait]
impl KeyService for AesGcmKeyService {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| ConnectorError::Crypto("encryption failed".to_string()))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    async fn decrypt(&self, envelope: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if envelope.len() <= NONCE_LEN {
            return Err(ConnectorError::Crypto("envelope too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ConnectorError::Crypto("decryption failed".to_string()))?;
        Ok(Zeroizing::new(plaintext))
    }
}

// ============================================================================
// Vault
// ============================================================================

/// Tenant-scoped credential storage. One instance per tenant context.
pub struct CredentialVault {
    pool: PgPool,
    keys: Arc<dyn KeyService>,
    tenant_id: Uuid,
}

impl CredentialVault {
    /// Create a vault scoped to one tenant.
    pub fn new(pool: PgPool, keys: Arc<dyn KeyService>, tenant_id: Uuid) -> Self {
        Self {
            pool,
            keys,
            tenant_id,
        }
    }

    /// The tenant this vault is scoped to.
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// Store a credential: the JSON token payload is encrypted before it
    /// touches the database.
    ///
    /// `metadata` must not contain secrets; it holds refresh bookkeeping
    /// such as `token_expires_at`.
    pub async fn store(
        &self,
        source_type: &str,
        payload: &serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<ConnectorCredential> {
        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let encrypted = self.keys.encrypt(&plaintext).await?;

        let credential = sqlx::query_as::<_, ConnectorCredential>(
            r"
            INSERT INTO connector_credentials (
                id, tenant_id, source_type, encrypted_payload, status,
                credential_metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, tenant_id, source_type, encrypted_payload, status,
                      credential_metadata, soft_deleted_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(self.tenant_id)
        .bind(source_type)
        .bind(&encrypted)
        .bind(CredentialStatus::Active)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            tenant_id = %self.tenant_id,
            credential_id = %credential.id,
            source_type,
            "credential stored"
        );

        Ok(credential)
    }

    /// Replace a credential's payload after a successful refresh.
    ///
    /// Takes a row-level lock; the caller supplies updated metadata.
    pub async fn replace_payload(
        &self,
        credential_id: Uuid,
        payload: &serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let encrypted = self.keys.encrypt(&plaintext).await?;

        let result = sqlx::query(
            r"
            UPDATE connector_credentials
            SET encrypted_payload = $3, credential_metadata = $4, status = 'active'
            WHERE id = $1 AND tenant_id = $2 AND soft_deleted_at IS NULL
            ",
        )
        .bind(credential_id)
        .bind(self.tenant_id)
        .bind(&encrypted)
        .bind(&metadata)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ConnectorError::NotFound(format!(
                "credential {credential_id}"
            )));
        }
        Ok(())
    }

    /// Decrypt a credential's payload. Tenant-scoped: a credential owned
    /// by another tenant is indistinguishable from a missing one.
    pub async fn read_payload(&self, credential_id: Uuid) -> Result<Zeroizing<Vec<u8>>> {
        let credential = self
            .fetch(credential_id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound(format!("credential {credential_id}")))?;

        self.keys.decrypt(&credential.encrypted_payload).await
    }

    /// Decrypt and parse a credential's payload as JSON.
    pub async fn read_payload_json(&self, credential_id: Uuid) -> Result<serde_json::Value> {
        let plaintext = self.read_payload(credential_id).await?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Fetch a credential row (without decrypting) within the tenant.
    pub async fn fetch(&self, credential_id: Uuid) -> Result<Option<ConnectorCredential>> {
        let credential = sqlx::query_as::<_, ConnectorCredential>(
            r"
            SELECT id, tenant_id, source_type, encrypted_payload, status,
                   credential_metadata, soft_deleted_at
            FROM connector_credentials
            WHERE id = $1 AND tenant_id = $2 AND soft_deleted_at IS NULL
            ",
        )
        .bind(credential_id)
        .bind(self.tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(credential)
    }

    /// Soft-delete a credential.
    pub async fn soft_delete(&self, credential_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE connector_credentials
            SET soft_deleted_at = $3
            WHERE id = $1 AND tenant_id = $2 AND soft_deleted_at IS NULL
            ",
        )
        .bind(credential_id)
        .bind(self.tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key_service() -> AesGcmKeyService {
        AesGcmKeyService::new([7u8; 32])
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_round_trip() {
        let keys = key_service();
        let plaintext = br#"{"access_token":"shpat_secret","refresh_token":"r1"}"#;
        let envelope = keys.encrypt(plaintext).await.unwrap();
        assert_ne!(&envelope[NONCE_LEN..], plaintext.as_slice());
        let decrypted = keys.decrypt(&envelope).await.unwrap();
        assert_eq!(decrypted.as_slice(), plaintext.as_slice());
    }

    #[tokio::test]
    async fn test_ciphertext_differs_per_encryption() {
        let keys = key_service();
        let plaintext = b"same payload";
        let a = keys.encrypt(plaintext).await.unwrap();
        let b = keys.encrypt(plaintext).await.unwrap();
        // Fresh nonce every call
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_tampered_envelope_rejected() {
        let keys = key_service();
        let mut envelope = keys.encrypt(b"payload").await.unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0xFF;
        assert!(keys.decrypt(&envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_short_envelope_rejected() {
        let keys = key_service();
        assert!(keys.decrypt(&[0u8; 5]).await.is_err());
    }
}
