//! Ingestion connectors
//!
//! Connection registration and lifecycle, the encrypted credential vault,
//! and the token refresh/revocation state machine:
//!
//! - **Registry** (`registry`): connection CRUD with the cross-tenant
//!   duplicate-shop guard and sync-run bookkeeping
//! - **Vault** (`vault`): credentials encrypted before persistence via an
//!   injected key service; decrypted payloads never reach logs
//! - **Tokens** (`tokens`): proactive and reactive refresh with bounded
//!   backoff, and immediate revocation enforced by all consumers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{DenialPayload, ErrorCode};

pub mod registry;
pub mod tokens;
pub mod vault;

pub use registry::ConnectionRegistry;
pub use tokens::{RefreshOutcome, RefreshResult, RevocationReason, TokenManager};
pub use vault::{CredentialVault, KeyService};

// ============================================================================
// Error Types
// ============================================================================

/// Connector subsystem errors
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// A connection with this external id already exists for the tenant
    #[error("Connection already registered")]
    DuplicateConnection,

    /// The shop domain is owned by another tenant (security event). The
    /// owning tenant is never disclosed to the caller.
    #[error("This store is already connected to another account. Each store can only be connected once. If you believe this is an error, please contact support.")]
    DuplicateShopDomainOtherTenant,

    /// The tenant already holds this shop domain on an active connection
    #[error("This store is already connected as '{existing_name}'. Please disconnect the existing connection first.")]
    DuplicateShopDomainSameTenant {
        /// Name of the existing connection
        existing_name: String,
    },

    /// Connection or credential not found within the tenant scope
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credential is revoked or expired; syncs must fail fast
    #[error("Credential is not usable: {0}")]
    CredentialRevoked(String),

    /// Refresh attempts exhausted
    #[error("Token refresh attempts exhausted")]
    RefreshExhausted,

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Encryption or decryption failed
    #[error("Credential crypto failure: {0}")]
    Crypto(String),

    /// Platform token endpoint failure
    #[error("Platform refresh failed: {0}")]
    Platform(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConnectorError {
    /// Structured denial payload for the caller.
    pub fn to_denial(&self) -> DenialPayload {
        match self {
            Self::DuplicateConnection => {
                DenialPayload::new(ErrorCode::DuplicateConnection, self.to_string())
            }
            Self::DuplicateShopDomainOtherTenant | Self::DuplicateShopDomainSameTenant { .. } => {
                DenialPayload::new(ErrorCode::DuplicateShopDomain, self.to_string())
            }
            Self::NotFound(_) => DenialPayload::new(ErrorCode::AccountNotFound, "Not found."),
            Self::CredentialRevoked(_) => DenialPayload::new(
                ErrorCode::CredentialRevoked,
                "The connection needs to be re-authorized.",
            ),
            Self::RefreshExhausted => DenialPayload::new(
                ErrorCode::RefreshExhausted,
                "The connection needs to be re-authorized.",
            ),
            _ => DenialPayload::new(ErrorCode::SyncFailed, "The operation could not be completed."),
        }
    }
}

/// Result type for connector operations
pub type Result<T> = std::result::Result<T, ConnectorError>;

// ============================================================================
// Connections
// ============================================================================

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "connection_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Registered, not yet synced
    Pending,
    /// Syncing on schedule
    Active,
    /// Disabled by the merchant
    Inactive,
    /// Last sync failed
    Failed,
    /// Soft deleted
    Deleted,
}

/// One logical ingestion feed registered with a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConnectorConnection {
    /// Connection id
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Id of the connection at the ingestion platform
    pub external_connection_id: String,

    /// Source type (e.g. `shopify`, `facebook`, `google`)
    pub source_type: String,

    /// Merchant-facing name
    pub connection_name: String,

    /// Source configuration; for Shopify contains `shop_domain`
    pub configuration: serde_json::Value,

    /// Lifecycle status
    pub status: ConnectionStatus,

    /// Whether scheduled syncs run
    pub is_enabled: bool,

    /// Last successful or attempted sync instant (denormalized)
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Outcome of the last sync (denormalized)
    pub last_sync_status: Option<String>,

    /// Scheduled sync cadence
    pub sync_frequency_minutes: i32,

    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl ConnectorConnection {
    /// Shop domain from the configuration, if present.
    pub fn shop_domain(&self) -> Option<&str> {
        self.configuration.get("shop_domain").and_then(|v| v.as_str())
    }
}

/// Status of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    /// In progress
    Running,
    /// Completed successfully
    Succeeded,
    /// Failed
    Failed,
    /// Cancelled
    Cancelled,
}

/// One execution of an ingestion sync. Append-mostly; connections keep
/// only the denormalized `last_sync_at` / `last_sync_status`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncRun {
    /// Run id
    pub run_id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Connection synced
    pub connector_id: Uuid,

    /// Run status
    pub status: SyncRunStatus,

    /// Start instant
    pub started_at: DateTime<Utc>,

    /// Completion instant
    pub completed_at: Option<DateTime<Utc>>,

    /// Rows synced
    pub rows_synced: Option<i64>,

    /// Failure detail (support-facing)
    pub error_message: Option<String>,
}

// ============================================================================
// Credentials
// ============================================================================

/// Lifecycle status of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "credential_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    /// Usable
    Active,
    /// Token expired; refresh exhausted or impossible
    Expired,
    /// Revoked; all consumers must check before use
    Revoked,
}

/// Encrypted token material for one source. The payload is opaque
/// ciphertext; only the vault decrypts it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConnectorCredential {
    /// Credential id
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Source type the credential authenticates
    pub source_type: String,

    /// Ciphertext envelope
    #[serde(skip_serializing, default)]
    pub encrypted_payload: Vec<u8>,

    /// Lifecycle status
    pub status: CredentialStatus,

    /// Refresh/revocation bookkeeping (no secrets)
    pub credential_metadata: serde_json::Value,

    /// Soft-delete instant
    pub soft_deleted_at: Option<DateTime<Utc>>,
}

impl ConnectorCredential {
    /// Read a string field from the metadata.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.credential_metadata.get(key).and_then(|v| v.as_str())
    }

    /// Read an integer field from the metadata.
    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.credential_metadata.get(key).and_then(|v| v.as_i64())
    }

    /// Parsed `token_expires_at` from the metadata.
    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.meta_str("token_expires_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

// ============================================================================
// Shop Domain Normalization
// ============================================================================

/// Normalize a shop domain exactly the way the database constraint does:
/// lowercase, strip `http://` or `https://`, strip trailing `/`.
///
/// The application-layer duplicate check and the DB unique index must
/// agree on this normalization or the precheck produces false negatives.
pub fn normalize_shop_domain(shop_domain: &str) -> String {
    let mut normalized = shop_domain.trim().to_lowercase();

    if let Some(stripped) = normalized.strip_prefix("https://") {
        normalized = stripped.to_string();
    } else if let Some(stripped) = normalized.strip_prefix("http://") {
        normalized = stripped.to_string();
    }

    normalized.trim_end_matches('/').to_string()
}

/// Whether duplicate-shop validation applies to a source type.
pub fn is_shopify_source(source_type: &str) -> bool {
    matches!(source_type, "shopify" | "source-shopify")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_equates_protocol_case_and_slash() {
        let expected = "store.myshopify.com";
        assert_eq!(normalize_shop_domain("HTTPS://Store.myshopify.com/"), expected);
        assert_eq!(normalize_shop_domain("http://store.myshopify.com"), expected);
        assert_eq!(normalize_shop_domain("store.myshopify.com"), expected);
        assert_eq!(normalize_shop_domain("  Store.MyShopify.com/  "), expected);
    }

    #[test]
    fn test_normalization_empty_input() {
        assert_eq!(normalize_shop_domain(""), "");
        assert_eq!(normalize_shop_domain("https://"), "");
    }

    #[test]
    fn test_shopify_source_detection() {
        assert!(is_shopify_source("shopify"));
        assert!(is_shopify_source("source-shopify"));
        assert!(!is_shopify_source("facebook"));
    }

    #[test]
    fn test_duplicate_shop_message_never_names_other_tenant() {
        let err = ConnectorError::DuplicateShopDomainOtherTenant;
        let message = err.to_string();
        assert!(message.contains("another account"));
        assert!(!message.contains("tenant"));
        let denial = err.to_denial();
        assert_eq!(denial.error_code, ErrorCode::DuplicateShopDomain);
        assert!(denial.context.tenant_id.is_none());
    }

    #[test]
    fn test_credential_metadata_accessors() {
        let credential = ConnectorCredential {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            source_type: "google".to_string(),
            encrypted_payload: vec![1, 2, 3],
            status: CredentialStatus::Active,
            credential_metadata: serde_json::json!({
                "token_expires_at": "2025-06-01T12:00:00+00:00",
                "refresh_error_count": 2,
            }),
            soft_deleted_at: None,
        };
        assert_eq!(credential.meta_i64("refresh_error_count"), Some(2));
        let expires = credential.token_expires_at().unwrap();
        assert_eq!(expires.to_rfc3339(), "2025-06-01T12:00:00+00:00");
    }
}
