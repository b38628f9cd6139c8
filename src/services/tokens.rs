// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OAuth token lifecycle for linked accounts.
//!
//! Access tokens are cached in memory after the first decrypt. When a token
//! is within two minutes of expiry the next caller starts a refresh; every
//! concurrent caller for the same account awaits that one shared future, so
//! Google sees a single refresh request per account at a time. A fresh
//! token never takes a lock.

use crate::db::FirestoreDb;
use crate::error::AppError;
use crate::models::StoredCredential;
use crate::services::google::GoogleClient;
use crate::services::kms::{self, KmsService};
use crate::time_utils::{format_utc_rfc3339, parse_utc_rfc3339};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;

/// Margin before token expiration when we proactively refresh (2 minutes).
const TOKEN_REFRESH_MARGIN_SECS: i64 = 2 * 60;

/// Cached access token with expiry information.
#[derive(Clone)]
pub struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) < self.expires_at
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<CachedToken, Arc<AppError>>>>;

/// Hands out valid access tokens and owns credential rotation.
#[derive(Clone)]
pub struct TokenManager {
    google: GoogleClient,
    db: FirestoreDb,
    kms: KmsService,
    /// Decrypted access tokens, keyed by account id.
    cache: Arc<DashMap<String, CachedToken>>,
    /// At most one refresh per account.
    inflight: Arc<DashMap<String, RefreshFuture>>,
}

impl TokenManager {
    pub fn new(google: GoogleClient, db: FirestoreDb, kms: KmsService) -> Self {
        Self {
            google,
            db,
            kms,
            cache: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Get a valid (non-expiring) access token for the account.
    ///
    /// Fails with `AuthRevoked` when Google rejects the refresh token (the
    /// account is marked revoked first) and `Transient` when Google cannot
    /// be reached.
    pub async fn get_valid_token(&self, account_id: &str) -> Result<String, AppError> {
        if let Some(cached) = self.cache.get(account_id) {
            if cached.is_fresh(Utc::now()) {
                return Ok(cached.access_token.clone());
            }
        }

        let refresh = match self.inflight.entry(account_id.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let this = self.clone();
                let id = account_id.to_string();
                let refresh = async move {
                    let result = this.load_or_refresh(&id).await.map_err(Arc::new);
                    if let Ok(token) = &result {
                        this.cache.insert(id.clone(), token.clone());
                    }
                    this.inflight.remove(&id);
                    result
                }
                .boxed()
                .shared();
                entry.insert(refresh.clone());
                refresh
            }
        };

        refresh
            .await
            .map(|token| token.access_token)
            .map_err(|e| duplicate_error(&e))
    }

    /// Drop the cached access token, e.g. after Google rejected it.
    pub fn evict(&self, account_id: &str) {
        self.cache.remove(account_id);
    }

    /// Drop everything held for a deleted account.
    ///
    /// Waits for a refresh already in flight so it cannot repopulate the
    /// cache afterwards.
    pub async fn forget(&self, account_id: &str) {
        let inflight = self.inflight.get(account_id).map(|r| r.value().clone());
        if let Some(refresh) = inflight {
            let _ = refresh.await;
        }
        self.cache.remove(account_id);
    }

    /// Encrypt the tokens of a freshly linked account for storage.
    pub async fn seal_credential(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in: i64,
        scopes: Vec<String>,
    ) -> Result<StoredCredential, AppError> {
        let expires_at = Utc::now() + Duration::seconds(expires_in);
        let (enc_access, enc_refresh) =
            kms::encrypt_tokens(&self.kms, access_token, refresh_token, account_id).await?;

        Ok(StoredCredential {
            access_token_encrypted: enc_access,
            refresh_token_encrypted: enc_refresh,
            expires_at: format_utc_rfc3339(expires_at),
            scopes,
        })
    }

    /// Best-effort revocation of the account's grant at Google.
    ///
    /// Used by disconnect; failures are logged and otherwise ignored.
    pub async fn revoke(&self, account_id: &str) {
        self.evict(account_id);

        let credential = match self.db.get_credential(account_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, account_id, "Failed to load credential for revocation");
                return;
            }
        };

        let refresh_token = match self
            .kms
            .decrypt(&credential.refresh_token_encrypted, account_id.as_bytes())
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, account_id, "Failed to decrypt refresh token (skipping revoke)");
                return;
            }
        };

        if let Err(e) = self.google.revoke(&refresh_token).await {
            tracing::warn!(error = %e, account_id, "Google token revocation failed");
        }
    }

    /// Body of the single-flight refresh.
    async fn load_or_refresh(&self, account_id: &str) -> Result<CachedToken, AppError> {
        let now = Utc::now();

        // Another refresh may have finished between our cache miss and
        // registering this one.
        if let Some(cached) = self.cache.get(account_id) {
            if cached.is_fresh(now) {
                return Ok(cached.clone());
            }
        }

        let credential = self
            .db
            .get_credential(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Credential for {}", account_id)))?;

        let expires_at = parse_utc_rfc3339(&credential.expires_at).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "Failed to parse expiry: {}",
                credential.expires_at
            ))
        })?;

        let stored = CachedToken {
            access_token: String::new(),
            expires_at,
        };
        if stored.is_fresh(now) {
            // Cold cache after a restart: the stored token is still good
            let access_token = self
                .kms
                .decrypt(&credential.access_token_encrypted, account_id.as_bytes())
                .await?;
            return Ok(CachedToken {
                access_token,
                expires_at,
            });
        }

        tracing::info!(account_id, "Access token expiring, refreshing");

        let refresh_token = self
            .kms
            .decrypt(&credential.refresh_token_encrypted, account_id.as_bytes())
            .await?;

        let response = match self.google.refresh_token(&refresh_token).await {
            Ok(r) => r,
            Err(AppError::AuthRevoked(msg)) => {
                tracing::warn!(account_id, "Refresh token rejected, marking account revoked");
                self.cache.remove(account_id);
                self.db.mark_revoked(account_id).await?;
                return Err(AppError::AuthRevoked(msg));
            }
            Err(e) => return Err(e),
        };

        // Google only sometimes rotates the refresh token
        let new_refresh = response.refresh_token.as_deref().unwrap_or(&refresh_token);
        let scopes = match response.scopes() {
            s if s.is_empty() => credential.scopes.clone(),
            s => s,
        };
        let new_expires_at = Utc::now() + Duration::seconds(response.expires_in);

        let (enc_access, enc_refresh) =
            kms::encrypt_tokens(&self.kms, &response.access_token, new_refresh, account_id)
                .await?;

        let updated = StoredCredential {
            access_token_encrypted: enc_access,
            refresh_token_encrypted: enc_refresh,
            expires_at: format_utc_rfc3339(new_expires_at),
            scopes,
        };
        if !self.db.store_refreshed_credential(account_id, &updated).await? {
            tracing::info!(account_id, "Account disconnected during refresh, dropping tokens");
            return Err(AppError::NotFound(format!("Account {}", account_id)));
        }

        tracing::info!(account_id, "Token refreshed and cached");
        Ok(CachedToken {
            access_token: response.access_token,
            expires_at: new_expires_at,
        })
    }
}

/// Give each waiter of a shared refresh its own copy of the error.
fn duplicate_error(e: &AppError) -> AppError {
    match e {
        AppError::AuthRevoked(m) => AppError::AuthRevoked(m.clone()),
        AppError::Transient(m) => AppError::Transient(m.clone()),
        AppError::Provider(m) => AppError::Provider(m.clone()),
        AppError::DuplicateNickname(m) => AppError::DuplicateNickname(m.clone()),
        AppError::AlreadySubscribed(m) => AppError::AlreadySubscribed(m.clone()),
        AppError::ExpiredLinkToken => AppError::ExpiredLinkToken,
        AppError::NotFound(m) => AppError::NotFound(m.clone()),
        AppError::Gone(m) => AppError::Gone(m.clone()),
        AppError::UnknownChannel(m) => AppError::UnknownChannel(m.clone()),
        AppError::EventNotFound(m) => AppError::EventNotFound(m.clone()),
        AppError::InvalidVerificationToken => AppError::InvalidVerificationToken,
        AppError::BadRequest(m) => AppError::BadRequest(m.clone()),
        AppError::Database(m) => AppError::Database(m.clone()),
        AppError::Internal(err) => AppError::Internal(anyhow::anyhow!("{:#}", err)),
    }
}
