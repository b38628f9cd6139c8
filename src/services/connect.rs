// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Account linking (`accounts connect`) and unlinking (`accounts disconnect`).
//!
//! The OAuth `state` parameter carries a link token: a random link id plus
//! an HMAC-SHA256 signature over it. The link id refers to a stored link
//! request that records who asked for which nickname, expires after the
//! link TTL, and can be consumed only once.

use crate::config::Config;
use crate::db::{CompleteLinkOutcome, FirestoreDb, PendingLinkOutcome};
use crate::error::AppError;
use crate::models::account::{account_id, validate_nickname};
use crate::models::{Account, ConnectionState, LinkRequest};
use crate::services::google::{CalendarListEntry, GoogleClient};
use crate::services::locks::AccountLocks;
use crate::services::subscriptions::SubscriptionManager;
use crate::services::tokens::TokenManager;
use crate::time_utils::format_utc_rfc3339;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use std::sync::Arc;

// Type alias for HMAC-SHA256
type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct ConnectionFlow {
    config: Arc<Config>,
    db: FirestoreDb,
    google: GoogleClient,
    tokens: TokenManager,
    subscriptions: SubscriptionManager,
    locks: AccountLocks,
    rng: SystemRandom,
}

impl ConnectionFlow {
    pub fn new(
        config: Arc<Config>,
        db: FirestoreDb,
        google: GoogleClient,
        tokens: TokenManager,
        subscriptions: SubscriptionManager,
        locks: AccountLocks,
    ) -> Self {
        Self {
            config,
            db,
            google,
            tokens,
            subscriptions,
            locks,
            rng: SystemRandom::new(),
        }
    }

    /// Begin linking a Google account under `nickname`.
    ///
    /// Returns the Google consent URL the user has to open.
    pub async fn start_link(&self, user: &str, nickname: &str) -> Result<String, AppError> {
        validate_nickname(nickname).map_err(AppError::BadRequest)?;

        let mut id_bytes = [0u8; 24];
        self.rng
            .fill(&mut id_bytes)
            .map_err(|_| AppError::Internal(anyhow::anyhow!("System RNG failure")))?;

        let link = LinkRequest {
            link_id: URL_SAFE_NO_PAD.encode(id_bytes),
            user: user.to_string(),
            nickname: nickname.to_string(),
            created_at: format_utc_rfc3339(Utc::now()),
        };

        match self.db.create_pending_link(&link).await? {
            PendingLinkOutcome::Created => {}
            PendingLinkOutcome::DuplicateNickname => {
                return Err(AppError::DuplicateNickname(nickname.to_string()))
            }
        }

        let link_token = sign_link_token(&link.link_id, &self.config.oauth_state_key)?;

        tracing::info!(user, nickname, "Starting account link");
        Ok(self.google.authorize_url(
            &self.config.oauth_redirect_url(),
            &self.config.google_scopes,
            &link_token,
        ))
    }

    /// Finish linking after Google redirected back with an authorization code.
    pub async fn handle_callback(&self, link_token: &str, code: &str) -> Result<Account, AppError> {
        let link_id = verify_link_token(link_token, &self.config.oauth_state_key)
            .ok_or_else(|| AppError::BadRequest("Invalid link token".to_string()))?;

        // Cheap precheck so an expired link never reaches Google
        let now = Utc::now();
        let link = self
            .db
            .get_link(&link_id)
            .await?
            .ok_or(AppError::ExpiredLinkToken)?;
        if link.is_expired(now, self.config.link_ttl) {
            return Err(AppError::ExpiredLinkToken);
        }

        let tokens = self
            .google
            .exchange_code(code, &self.config.oauth_redirect_url())
            .await?;
        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            AppError::Provider("Google did not return a refresh token".to_string())
        })?;

        let calendar = self.google.get_primary_calendar(&tokens.access_token).await?;

        let id = account_id(&link.user, &link.nickname);
        let credential = self
            .tokens
            .seal_credential(
                &id,
                &tokens.access_token,
                &refresh_token,
                tokens.expires_in,
                tokens.scopes(),
            )
            .await?;

        match self
            .db
            .complete_link(&link_id, Utc::now(), self.config.link_ttl, &calendar.id, &credential)
            .await?
        {
            CompleteLinkOutcome::Linked(account) => {
                self.tokens.evict(&id);
                tracing::info!(
                    user = %account.user,
                    nickname = %account.nickname,
                    "Account connected"
                );
                Ok(account)
            }
            CompleteLinkOutcome::Expired => Err(AppError::ExpiredLinkToken),
            CompleteLinkOutcome::DuplicateNickname => {
                Err(AppError::DuplicateNickname(link.nickname))
            }
        }
    }

    /// Unlink an account: stop its subscription, revoke the grant, delete
    /// every trace of it. The nickname is free again afterwards.
    pub async fn disconnect(&self, user: &str, nickname: &str) -> Result<(), AppError> {
        let id = account_id(user, nickname);
        let _guard = self.locks.lock(&id).await;

        if self.db.get_account_by_id(&id).await?.is_none() {
            return Err(AppError::NotFound(format!("Account {}", nickname)));
        }

        // Keeps the account and its credential while a channel is still live
        self.subscriptions.release_locked(&id).await?;
        self.tokens.revoke(&id).await;
        self.db.delete_account(&id).await?;
        self.tokens.forget(&id).await;
        let cleared = self.db.clear_sync_state(&id).await?;

        tracing::info!(user, nickname, tracked_events = cleared, "Account disconnected");
        Ok(())
    }

    /// Calendars on a connected account's calendar list.
    pub async fn list_calendars(
        &self,
        user: &str,
        nickname: &str,
    ) -> Result<Vec<CalendarListEntry>, AppError> {
        let account = self.connected_account(user, nickname).await?;
        let id = account.id();
        let access_token = self.tokens.get_valid_token(&id).await?;

        self.google
            .list_calendars(&access_token)
            .await
            .inspect_err(|e| {
                if e.is_token_error() {
                    self.tokens.evict(&id);
                }
            })
    }

    /// Look up an account that is currently connected.
    pub async fn connected_account(&self, user: &str, nickname: &str) -> Result<Account, AppError> {
        match self.db.get_account(user, nickname).await? {
            Some(account) if account.is_connected() => Ok(account),
            Some(account) if account.state == ConnectionState::Revoked => {
                Err(AppError::AuthRevoked(format!("Account {}", nickname)))
            }
            // Pending links are not usable yet
            _ => Err(AppError::NotFound(format!("Account {}", nickname))),
        }
    }
}

/// Build "link_id.signature_hex".
pub fn sign_link_token(link_id: &str, secret: &[u8]) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HMAC init failed: {}", e)))?;
    mac.update(link_id.as_bytes());
    Ok(format!("{}.{}", link_id, hex::encode(mac.finalize().into_bytes())))
}

/// Verify a link token's signature and return the link id.
pub fn verify_link_token(token: &str, secret: &[u8]) -> Option<String> {
    let (link_id, signature_hex) = token.rsplit_once('.')?;
    let signature = hex::decode(signature_hex).ok()?;

    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(link_id.as_bytes());
    if mac.verify_slice(&signature).is_err() {
        tracing::warn!("Link token signature mismatch");
        return None;
    }
    Some(link_id.to_string())
}
