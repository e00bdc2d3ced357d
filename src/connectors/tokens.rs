//! Token manager
//!
//! Refresh and revocation lifecycle for ingestion credentials:
//!
//! - **Proactive refresh**: periodic sweep of credentials whose token
//!   expires within the lookahead window
//! - **Reactive refresh**: triggered by a sync failing with an auth
//!   error, subject to the same backoff schedule
//! - **Revocation**: immediate `revoked` status, enforced by every
//!   consumer before use
//!
//! Refresh attempts are bounded: three consecutive failures mark the
//! credential expired, with 5/30/120 minute backoff between attempts.
//! Tokens never appear in logs or audit metadata.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditOutcome, AuditSource};
use crate::core::{Clock, SystemClock};

use super::{
    vault::CredentialVault, ConnectorCredential, ConnectorError, CredentialStatus, Result,
};

/// Refresh credentials expiring within this many hours (proactive sweep).
pub const PROACTIVE_REFRESH_HOURS: i64 = 24;

/// Consecutive failures before a credential is marked expired.
pub const MAX_REFRESH_ATTEMPTS: i64 = 3;

/// Backoff between attempts 1→2, 2→3, and 3→done, in minutes.
pub const REFRESH_BACKOFF_MINUTES: [i64; 3] = [5, 30, 120];

/// Per-attempt timeout on the platform exchange.
const PLATFORM_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Outcomes
// ============================================================================

/// Outcome class of a refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshResult {
    /// New tokens stored
    Success,
    /// Failed; a later retry may succeed
    FailedRetryable,
    /// Failed permanently; credential marked expired
    FailedPermanent,
    /// Skipped: backoff window still open
    SkippedBackoff,
    /// Skipped: credential revoked or missing
    SkippedRevoked,
    /// Skipped: payload has no refresh token (not a failure)
    NoRefreshToken,
}

impl RefreshResult {
    /// Stable string form for audit metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedPermanent => "failed_permanent",
            Self::SkippedBackoff => "skipped_backoff",
            Self::SkippedRevoked => "skipped_revoked",
            Self::NoRefreshToken => "no_refresh_token",
        }
    }
}

/// Result of a single credential refresh attempt.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// Credential attempted
    pub credential_id: Uuid,

    /// Source type of the credential
    pub source_type: String,

    /// Outcome class
    pub result: RefreshResult,

    /// Error detail on failure
    pub error: Option<String>,

    /// New expiry on success
    pub new_expires_at: Option<DateTime<Utc>>,

    /// Error-counter value after the attempt
    pub attempt_number: i64,
}

/// Aggregate stats from a proactive sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshStats {
    /// Credentials examined
    pub credentials_checked: usize,

    /// Successful refreshes
    pub refreshed: usize,

    /// Failed attempts
    pub failed: usize,

    /// Skipped (backoff, revoked, no refresh token)
    pub skipped: usize,

    /// Credentials marked expired
    pub expired_marked: usize,
}

/// Reason for credential revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// Merchant disconnected the store
    UserDisconnect,
    /// Provider invalidated the grant
    ProviderRevoked,
    /// Operator action
    AdminAction,
    /// Security incident response
    SecurityEvent,
    /// Refresh attempts exhausted
    AuthFailureExhausted,
}

impl RevocationReason {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserDisconnect => "user_disconnect",
            Self::ProviderRevoked => "provider_revoked",
            Self::AdminAction => "admin_action",
            Self::SecurityEvent => "security_event",
            Self::AuthFailureExhausted => "auth_failure_exhausted",
        }
    }
}

// ============================================================================
// Attempt Gate
// ============================================================================

/// Decision before a refresh attempt is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptGate {
    /// Error budget exhausted; permanent failure
    Exhausted,
    /// Backoff window still open until the given instant
    Backoff {
        /// Earliest instant the next attempt is allowed
        until: DateTime<Utc>,
    },
    /// Attempt may proceed
    Proceed,
}

/// Enforce the attempt budget and backoff schedule.
///
/// `error_count` failures so far; backoff after the Nth failure is
/// `REFRESH_BACKOFF_MINUTES[N-1]`, clamped to the last entry.
pub fn evaluate_attempt_gate(
    error_count: i64,
    last_attempt_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> AttemptGate {
    if error_count >= MAX_REFRESH_ATTEMPTS {
        return AttemptGate::Exhausted;
    }

    if error_count > 0 {
        if let Some(last) = last_attempt_at {
            let idx = ((error_count - 1).max(0) as usize).min(REFRESH_BACKOFF_MINUTES.len() - 1);
            let until = last + Duration::minutes(REFRESH_BACKOFF_MINUTES[idx]);
            if now < until {
                return AttemptGate::Backoff { until };
            }
        }
    }

    AttemptGate::Proceed
}

// ============================================================================
// Platform Client
// ============================================================================

/// Platform-specific token exchange boundary.
#[async_trait]
pub trait PlatformTokenClient: Send + Sync {
    /// Exchange the current payload for fresh tokens.
    async fn refresh(
        &self,
        source_type: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, PlatformRefreshError>;
}

/// Error from a platform token exchange.
#[derive(Debug, Clone)]
pub struct PlatformRefreshError {
    /// Support-facing detail
    pub message: String,

    /// Whether a retry can ever succeed
    pub permanent: bool,
}

/// OAuth app credentials for the outbound exchanges.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthAppConfig {
    /// Meta app id
    pub meta_app_id: Option<String>,
    /// Meta app secret
    pub meta_app_secret: Option<String>,
    /// Google OAuth client id
    pub google_client_id: Option<String>,
    /// Google OAuth client secret
    pub google_client_secret: Option<String>,
}

/// HTTP implementation of the platform exchanges.
///
/// - Shopify offline tokens do not expire; refresh is a no-op
/// - Meta exchanges for a long-lived token via the Graph API
/// - Google uses the standard OAuth2 `refresh_token` grant
pub struct HttpPlatformTokenClient {
    http: reqwest::Client,
    oauth: OAuthAppConfig,
}

impl HttpPlatformTokenClient {
    /// Create a client with the given OAuth app credentials.
    pub fn new(oauth: OAuthAppConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(PLATFORM_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            oauth,
        }
    }

    async fn refresh_meta(
        &self,
        payload: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, PlatformRefreshError> {
        let (app_id, app_secret) = match (&self.oauth.meta_app_id, &self.oauth.meta_app_secret) {
            (Some(id), Some(secret)) => (id, secret),
            _ => {
                return Err(PlatformRefreshError {
                    message: "Meta app credentials not configured".to_string(),
                    permanent: true,
                })
            }
        };
        let token = payload
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PlatformRefreshError {
                message: "payload missing access_token".to_string(),
                permanent: true,
            })?;

        let response = self
            .http
            .get("https://graph.facebook.com/v19.0/oauth/access_token")
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", app_id),
                ("client_secret", app_secret),
                ("fb_exchange_token", token),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        parse_token_response(response).await
    }

    async fn refresh_google(
        &self,
        payload: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, PlatformRefreshError> {
        let (client_id, client_secret) = match (
            &self.oauth.google_client_id,
            &self.oauth.google_client_secret,
        ) {
            (Some(id), Some(secret)) => (id, secret),
            _ => {
                return Err(PlatformRefreshError {
                    message: "Google OAuth credentials not configured".to_string(),
                    permanent: true,
                })
            }
        };
        let refresh_token = payload
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PlatformRefreshError {
                message: "payload missing refresh_token".to_string(),
                permanent: true,
            })?;

        let response = self
            .http
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let mut new_payload = parse_token_response(response).await?;
        // Google omits the refresh token on renewal; carry it forward.
        if let Some(map) = new_payload.as_object_mut() {
            map.entry("refresh_token")
                .or_insert_with(|| serde_json::Value::String(refresh_token.to_string()));
        }
        Ok(new_payload)
    }
}

#[async_trait]
impl PlatformTokenClient for HttpPlatformTokenClient {
    async fn refresh(
        &self,
        source_type: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, PlatformRefreshError> {
        match source_type {
            // Offline tokens do not expire; treat as validated
            "shopify" | "source-shopify" => Ok(payload.clone()),
            "meta" | "facebook" => self.refresh_meta(payload).await,
            "google" | "google_ads" => self.refresh_google(payload).await,
            other => Err(PlatformRefreshError {
                message: format!("unsupported source type for refresh: {other}"),
                permanent: true,
            }),
        }
    }
}

fn transport_error(err: reqwest::Error) -> PlatformRefreshError {
    PlatformRefreshError {
        message: format!("transport error: {err}"),
        permanent: false,
    }
}

async fn parse_token_response(
    response: reqwest::Response,
) -> std::result::Result<serde_json::Value, PlatformRefreshError> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.map_err(|err| PlatformRefreshError {
            message: format!("invalid token response: {err}"),
            permanent: false,
        });
    }
    // 4xx means the grant itself is bad; retrying cannot help.
    Err(PlatformRefreshError {
        message: format!("token endpoint returned {status}"),
        permanent: status.is_client_error(),
    })
}

// ============================================================================
// Token Manager
// ============================================================================

/// Tenant-scoped token refresh and revocation.
pub struct TokenManager {
    pool: PgPool,
    vault: Arc<CredentialVault>,
    platform: Arc<dyn PlatformTokenClient>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    tenant_id: Uuid,
}

impl TokenManager {
    /// Create a token manager scoped to one tenant.
    pub fn new(
        pool: PgPool,
        vault: Arc<CredentialVault>,
        platform: Arc<dyn PlatformTokenClient>,
        audit: Arc<AuditLog>,
        tenant_id: Uuid,
    ) -> Self {
        Self::with_clock(pool, vault, platform, audit, tenant_id, Arc::new(SystemClock))
    }

    /// Create a token manager with an injected clock.
    pub fn with_clock(
        pool: PgPool,
        vault: Arc<CredentialVault>,
        platform: Arc<dyn PlatformTokenClient>,
        audit: Arc<AuditLog>,
        tenant_id: Uuid,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            vault,
            platform,
            audit,
            clock,
            tenant_id,
        }
    }

    // ========================================================================
    // Proactive Refresh
    // ========================================================================

    /// Sweep active credentials whose token expires within the lookahead
    /// window and attempt a refresh on each.
    pub async fn refresh_expiring_credentials(&self, hours_before_expiry: i64) -> Result<RefreshStats> {
        let now = self.clock.now();
        let cutoff = now + Duration::hours(hours_before_expiry);
        let mut stats = RefreshStats::default();

        let active = self.active_credentials().await?;
        for credential in active {
            let Some(expires_at) = credential.token_expires_at() else {
                continue;
            };
            if expires_at > cutoff {
                continue;
            }
            stats.credentials_checked += 1;

            let outcome = self.attempt_refresh(&credential).await;
            self.log_refresh_audit(&credential, &outcome).await;
            match outcome.result {
                RefreshResult::Success => stats.refreshed += 1,
                RefreshResult::FailedRetryable => stats.failed += 1,
                RefreshResult::FailedPermanent => {
                    stats.failed += 1;
                    stats.expired_marked += 1;
                }
                RefreshResult::SkippedBackoff
                | RefreshResult::SkippedRevoked
                | RefreshResult::NoRefreshToken => stats.skipped += 1,
            }
        }

        tracing::info!(
            tenant_id = %self.tenant_id,
            checked = stats.credentials_checked,
            refreshed = stats.refreshed,
            failed = stats.failed,
            skipped = stats.skipped,
            "proactive refresh completed"
        );

        Ok(stats)
    }

    // ========================================================================
    // Reactive Refresh
    // ========================================================================

    /// Attempt a refresh after a sync failed with an auth error.
    pub async fn reactive_refresh(&self, credential_id: Uuid) -> Result<RefreshOutcome> {
        let credential = match self.fetch_locked(credential_id).await? {
            Some(c) => c,
            None => {
                return Ok(RefreshOutcome {
                    credential_id,
                    source_type: "unknown".to_string(),
                    result: RefreshResult::SkippedRevoked,
                    error: Some("Credential not found or not accessible".to_string()),
                    new_expires_at: None,
                    attempt_number: 0,
                });
            }
        };

        if credential.status == CredentialStatus::Revoked {
            return Ok(RefreshOutcome {
                credential_id,
                source_type: credential.source_type,
                result: RefreshResult::SkippedRevoked,
                error: Some("Credential has been revoked".to_string()),
                new_expires_at: None,
                attempt_number: 0,
            });
        }

        let outcome = self.attempt_refresh(&credential).await;
        self.log_refresh_audit(&credential, &outcome).await;
        Ok(outcome)
    }

    // ========================================================================
    // Revocation
    // ========================================================================

    /// Immediately revoke a credential. Returns whether it existed.
    pub async fn revoke_credential(
        &self,
        credential_id: Uuid,
        reason: RevocationReason,
        revoked_by: Option<&str>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let credential = match self.fetch_locked(credential_id).await? {
            Some(c) => c,
            None => return Ok(false),
        };

        let mut metadata = credential.credential_metadata.clone();
        merge_meta(&mut metadata, "revoked_at", now.to_rfc3339().into());
        merge_meta(&mut metadata, "revocation_reason", reason.as_str().into());
        if let Some(by) = revoked_by {
            merge_meta(&mut metadata, "revoked_by", by.into());
        }

        sqlx::query(
            r"
            UPDATE connector_credentials
            SET status = 'revoked', credential_metadata = $3
            WHERE id = $1 AND tenant_id = $2
            ",
        )
        .bind(credential_id)
        .bind(self.tenant_id)
        .bind(&metadata)
        .execute(&self.pool)
        .await?;

        self.audit
            .write(
                AuditEvent::new(self.tenant_id, AuditAction::StoreDisconnected)
                    .with_source(AuditSource::System)
                    .with_resource("credential", credential_id.to_string())
                    .with_metadata(serde_json::json!({
                        "source_type": credential.source_type,
                        "reason": reason.as_str(),
                        "revoked_by": revoked_by,
                    })),
            )
            .await;

        tracing::info!(
            tenant_id = %self.tenant_id,
            credential_id = %credential_id,
            reason = reason.as_str(),
            "credential revoked"
        );

        Ok(true)
    }

    /// Revoke every active credential for a source type. Used when a
    /// connection is fully disconnected.
    pub async fn revoke_all_for_source(
        &self,
        source_type: &str,
        reason: RevocationReason,
        revoked_by: Option<&str>,
    ) -> Result<usize> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r"
            SELECT id FROM connector_credentials
            WHERE tenant_id = $1 AND source_type = $2
              AND status = 'active' AND soft_deleted_at IS NULL
            ",
        )
        .bind(self.tenant_id)
        .bind(source_type)
        .fetch_all(&self.pool)
        .await?;

        let mut revoked = 0;
        for (id,) in ids {
            if self.revoke_credential(id, reason, revoked_by).await? {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    // ========================================================================
    // Consumer Checks
    // ========================================================================

    /// Fail fast before a sync: a revoked or expired credential must
    /// error before any external call is made.
    pub async fn ensure_usable_for_sync(&self, credential_id: Uuid) -> Result<()> {
        let credential = self
            .vault
            .fetch(credential_id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound(format!("credential {credential_id}")))?;

        match credential.status {
            CredentialStatus::Active => {}
            CredentialStatus::Revoked => {
                return Err(ConnectorError::CredentialRevoked(
                    credential
                        .meta_str("revocation_reason")
                        .unwrap_or("revoked")
                        .to_string(),
                ));
            }
            CredentialStatus::Expired => {
                return Err(ConnectorError::CredentialRevoked("expired".to_string()));
            }
        }

        if let Some(expires_at) = credential.token_expires_at() {
            if expires_at <= self.clock.now() {
                return Err(ConnectorError::CredentialRevoked(
                    "token expired".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Safe status summary for API responses; never includes the payload.
    pub async fn credential_status_summary(
        &self,
        credential_id: Uuid,
    ) -> Result<Option<serde_json::Value>> {
        let Some(credential) = self.vault.fetch(credential_id).await? else {
            return Ok(None);
        };

        Ok(Some(serde_json::json!({
            "credential_id": credential.id,
            "source_type": credential.source_type,
            "status": credential.status,
            "token_expires_at": credential.meta_str("token_expires_at"),
            "last_refresh_at": credential.meta_str("last_refresh_at"),
            "refresh_error_count": credential.meta_i64("refresh_error_count").unwrap_or(0),
            "revoked_at": credential.meta_str("revoked_at"),
            "revocation_reason": credential.meta_str("revocation_reason"),
        })))
    }

    // ========================================================================
    // Internal: Refresh Attempt
    // ========================================================================

    async fn attempt_refresh(&self, credential: &ConnectorCredential) -> RefreshOutcome {
        let now = self.clock.now();
        let error_count = credential.meta_i64("refresh_error_count").unwrap_or(0);
        let last_attempt = credential
            .meta_str("last_refresh_attempt_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        match evaluate_attempt_gate(error_count, last_attempt, now) {
            AttemptGate::Exhausted => {
                let outcome = RefreshOutcome {
                    credential_id: credential.id,
                    source_type: credential.source_type.clone(),
                    result: RefreshResult::FailedPermanent,
                    error: Some(format!(
                        "Max refresh attempts ({MAX_REFRESH_ATTEMPTS}) exhausted"
                    )),
                    new_expires_at: None,
                    attempt_number: error_count,
                };
                let _ = self
                    .mark_expired(credential, "Refresh attempts exhausted")
                    .await;
                return outcome;
            }
            AttemptGate::Backoff { until } => {
                return RefreshOutcome {
                    credential_id: credential.id,
                    source_type: credential.source_type.clone(),
                    result: RefreshResult::SkippedBackoff,
                    error: Some(format!("Backoff in effect until {}", until.to_rfc3339())),
                    new_expires_at: None,
                    attempt_number: error_count,
                };
            }
            AttemptGate::Proceed => {}
        }

        // Decrypt the current payload
        let payload = match self.vault.read_payload_json(credential.id).await {
            Ok(payload) => payload,
            Err(err) => {
                let outcome = RefreshOutcome {
                    credential_id: credential.id,
                    source_type: credential.source_type.clone(),
                    result: RefreshResult::FailedPermanent,
                    error: Some(format!("Decryption failed: {err}")),
                    new_expires_at: None,
                    attempt_number: error_count,
                };
                let _ = self.mark_expired(credential, "Decryption failed").await;
                return outcome;
            }
        };

        // Shopify offline tokens carry no refresh token; that is a skip,
        // not a failure.
        let needs_refresh_token = !super::is_shopify_source(&credential.source_type);
        if needs_refresh_token && payload.get("refresh_token").and_then(|v| v.as_str()).is_none() {
            return RefreshOutcome {
                credential_id: credential.id,
                source_type: credential.source_type.clone(),
                result: RefreshResult::NoRefreshToken,
                error: Some("No refresh_token in credential payload".to_string()),
                new_expires_at: None,
                attempt_number: error_count,
            };
        }

        // Record the attempt instant before the outbound call
        let mut metadata = credential.credential_metadata.clone();
        merge_meta(&mut metadata, "last_refresh_attempt_at", now.to_rfc3339().into());
        let _ = self.write_metadata(credential.id, &metadata).await;

        // Platform-specific exchange with a per-attempt timeout
        let exchange = tokio::time::timeout(
            StdDuration::from_secs(PLATFORM_TIMEOUT_SECS),
            self.platform.refresh(&credential.source_type, &payload),
        )
        .await;

        let exchange = match exchange {
            Ok(result) => result,
            Err(_) => Err(PlatformRefreshError {
                message: "platform refresh timed out".to_string(),
                permanent: false,
            }),
        };

        match exchange {
            Err(err) => {
                let new_count = error_count + 1;
                merge_meta(&mut metadata, "refresh_error_count", new_count.into());
                merge_meta(&mut metadata, "last_refresh_error", err.message.clone().into());
                let _ = self.write_metadata(credential.id, &metadata).await;

                let permanent = err.permanent || new_count >= MAX_REFRESH_ATTEMPTS;
                if permanent {
                    let _ = self.mark_expired(credential, &err.message).await;
                }

                RefreshOutcome {
                    credential_id: credential.id,
                    source_type: credential.source_type.clone(),
                    result: if permanent {
                        RefreshResult::FailedPermanent
                    } else {
                        RefreshResult::FailedRetryable
                    },
                    error: Some(err.message),
                    new_expires_at: None,
                    attempt_number: new_count,
                }
            }
            Ok(new_payload) => {
                let new_expires_at = extract_expiry(&new_payload, now);
                if let Some(expires) = new_expires_at {
                    merge_meta(&mut metadata, "token_expires_at", expires.to_rfc3339().into());
                }
                merge_meta(&mut metadata, "last_refresh_at", now.to_rfc3339().into());
                merge_meta(&mut metadata, "refresh_error_count", 0.into());
                remove_meta(&mut metadata, "last_refresh_error");

                if let Err(err) = self
                    .vault
                    .replace_payload(credential.id, &new_payload, metadata)
                    .await
                {
                    return RefreshOutcome {
                        credential_id: credential.id,
                        source_type: credential.source_type.clone(),
                        result: RefreshResult::FailedRetryable,
                        error: Some(format!("Storing refreshed tokens failed: {err}")),
                        new_expires_at: None,
                        attempt_number: error_count,
                    };
                }

                RefreshOutcome {
                    credential_id: credential.id,
                    source_type: credential.source_type.clone(),
                    result: RefreshResult::Success,
                    error: None,
                    new_expires_at,
                    attempt_number: 0,
                }
            }
        }
    }

    // ========================================================================
    // Internal: Persistence
    // ========================================================================

    /// Fetch a credential with a row-level lock within the tenant scope.
    async fn fetch_locked(&self, credential_id: Uuid) -> Result<Option<ConnectorCredential>> {
        let credential = sqlx::query_as::<_, ConnectorCredential>(
            r"
            SELECT id, tenant_id, source_type, encrypted_payload, status,
                   credential_metadata, soft_deleted_at
            FROM connector_credentials
            WHERE id = $1 AND tenant_id = $2 AND soft_deleted_at IS NULL
            FOR UPDATE
            ",
        )
        .bind(credential_id)
        .bind(self.tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(credential)
    }

    async fn active_credentials(&self) -> Result<Vec<ConnectorCredential>> {
        let credentials = sqlx::query_as::<_, ConnectorCredential>(
            r"
            SELECT id, tenant_id, source_type, encrypted_payload, status,
                   credential_metadata, soft_deleted_at
            FROM connector_credentials
            WHERE tenant_id = $1 AND status = 'active' AND soft_deleted_at IS NULL
            ",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(credentials)
    }

    async fn write_metadata(&self, credential_id: Uuid, metadata: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r"
            UPDATE connector_credentials
            SET credential_metadata = $3
            WHERE id = $1 AND tenant_id = $2
            ",
        )
        .bind(credential_id)
        .bind(self.tenant_id)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_expired(&self, credential: &ConnectorCredential, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let mut metadata = credential.credential_metadata.clone();
        merge_meta(&mut metadata, "expired_at", now.to_rfc3339().into());
        merge_meta(&mut metadata, "expired_reason", reason.into());

        sqlx::query(
            r"
            UPDATE connector_credentials
            SET status = 'expired', credential_metadata = $3
            WHERE id = $1 AND tenant_id = $2
            ",
        )
        .bind(credential.id)
        .bind(self.tenant_id)
        .bind(&metadata)
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            tenant_id = %self.tenant_id,
            credential_id = %credential.id,
            source_type = credential.source_type,
            reason,
            "credential marked expired"
        );

        Ok(())
    }

    async fn log_refresh_audit(&self, credential: &ConnectorCredential, outcome: &RefreshOutcome) {
        let audit_outcome = if outcome.result == RefreshResult::Success {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };

        let mut event = AuditEvent::new(self.tenant_id, AuditAction::AuthTokenRefresh)
            .with_source(AuditSource::Worker)
            .with_resource("credential", credential.id.to_string())
            .with_metadata(serde_json::json!({
                "source_type": credential.source_type,
                "refresh_result": outcome.result.as_str(),
                "attempt_number": outcome.attempt_number,
                "error": outcome.error.as_deref().map(|e| e.chars().take(200).collect::<String>()),
                "new_expires_at": outcome.new_expires_at.map(|t| t.to_rfc3339()),
            }));
        event.outcome = audit_outcome;
        self.audit.write(event).await;
    }
}

/// New expiry from a token response: explicit `expires_at` wins, then
/// `expires_in` seconds from now.
fn extract_expiry(payload: &serde_json::Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(s) = payload.get("expires_at").and_then(|v| v.as_str()) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    payload
        .get("expires_in")
        .and_then(|v| v.as_i64())
        .map(|secs| now + Duration::seconds(secs))
}

fn merge_meta(metadata: &mut serde_json::Value, key: &str, value: serde_json::Value) {
    if let Some(map) = metadata.as_object_mut() {
        map.insert(key.to_string(), value);
    } else {
        *metadata = serde_json::json!({ key: value });
    }
}

fn remove_meta(metadata: &mut serde_json::Value, key: &str) {
    if let Some(map) = metadata.as_object_mut() {
        map.remove(key);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_gate_exhausted_at_max_attempts() {
        assert_eq!(
            evaluate_attempt_gate(MAX_REFRESH_ATTEMPTS, None, t0()),
            AttemptGate::Exhausted
        );
        assert_eq!(
            evaluate_attempt_gate(MAX_REFRESH_ATTEMPTS + 1, None, t0()),
            AttemptGate::Exhausted
        );
    }

    #[test]
    fn test_gate_first_attempt_proceeds() {
        assert_eq!(evaluate_attempt_gate(0, None, t0()), AttemptGate::Proceed);
        // No recorded attempt time means no backoff to enforce
        assert_eq!(evaluate_attempt_gate(1, None, t0()), AttemptGate::Proceed);
    }

    #[test]
    fn test_gate_backoff_schedule() {
        // After the first failure: 5 minutes
        let gate = evaluate_attempt_gate(1, Some(t0()), t0() + Duration::minutes(4));
        assert_eq!(
            gate,
            AttemptGate::Backoff {
                until: t0() + Duration::minutes(5)
            }
        );
        assert_eq!(
            evaluate_attempt_gate(1, Some(t0()), t0() + Duration::minutes(5)),
            AttemptGate::Proceed
        );

        // After the second failure: 30 minutes
        assert!(matches!(
            evaluate_attempt_gate(2, Some(t0()), t0() + Duration::minutes(29)),
            AttemptGate::Backoff { .. }
        ));
        assert_eq!(
            evaluate_attempt_gate(2, Some(t0()), t0() + Duration::minutes(30)),
            AttemptGate::Proceed
        );
    }

    #[test]
    fn test_extract_expiry_prefers_explicit_timestamp() {
        let payload = serde_json::json!({
            "expires_at": "2025-07-01T00:00:00+00:00",
            "expires_in": 60,
        });
        let expiry = extract_expiry(&payload, t0()).unwrap();
        assert_eq!(expiry.to_rfc3339(), "2025-07-01T00:00:00+00:00");
    }

    #[test]
    fn test_extract_expiry_from_expires_in() {
        let payload = serde_json::json!({"expires_in": 3600});
        let expiry = extract_expiry(&payload, t0()).unwrap();
        assert_eq!(expiry, t0() + Duration::hours(1));
        assert!(extract_expiry(&serde_json::json!({}), t0()).is_none());
    }

    #[test]
    fn test_revocation_reason_strings() {
        assert_eq!(RevocationReason::UserDisconnect.as_str(), "user_disconnect");
        assert_eq!(
            RevocationReason::AuthFailureExhausted.as_str(),
            "auth_failure_exhausted"
        );
    }

    #[test]
    fn test_merge_and_remove_meta() {
        let mut metadata = serde_json::json!({"a": 1});
        merge_meta(&mut metadata, "b", 2.into());
        assert_eq!(metadata["b"], 2);
        remove_meta(&mut metadata, "a");
        assert!(metadata.get("a").is_none());

        // Non-object metadata is replaced rather than corrupted
        let mut scalar = serde_json::json!(null);
        merge_meta(&mut scalar, "k", "v".into());
        assert_eq!(scalar["k"], "v");
    }
}
