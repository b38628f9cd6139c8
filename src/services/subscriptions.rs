// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Watch channel lifecycle: subscribe, renew, unsubscribe.
//!
//! The account record's `active_channel_id` is the single source of truth
//! for which channel is live. Every change to it happens in one storage
//! transaction together with the subscription rows, and every operation on
//! one account runs under that account's lock.

use crate::config::Config;
use crate::db::{ActivateOutcome, FirestoreDb, SwapOutcome};
use crate::error::AppError;
use crate::models::{Account, RetiredChannel, Subscription};
use crate::services::google::{GoogleClient, WatchRequest};
use crate::services::locks::AccountLocks;
use crate::services::sync::CalendarSync;
use crate::services::tokens::TokenManager;
use crate::time_utils::{format_utc_rfc3339, parse_utc_rfc3339};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;

#[derive(Clone)]
pub struct SubscriptionManager {
    config: Arc<Config>,
    db: FirestoreDb,
    google: GoogleClient,
    tokens: TokenManager,
    sync: CalendarSync,
    locks: AccountLocks,
    rng: SystemRandom,
}

impl SubscriptionManager {
    pub fn new(
        config: Arc<Config>,
        db: FirestoreDb,
        google: GoogleClient,
        tokens: TokenManager,
        sync: CalendarSync,
        locks: AccountLocks,
    ) -> Self {
        Self {
            config,
            db,
            google,
            tokens,
            sync,
            locks,
            rng: SystemRandom::new(),
        }
    }

    /// Start watching the account's primary calendar.
    pub async fn subscribe(&self, account: &Account) -> Result<Subscription, AppError> {
        let account_id = account.id();
        let _guard = self.locks.lock(&account_id).await;

        // Re-read under the lock; the caller's copy may be stale
        let account = self
            .db
            .get_account_by_id(&account_id)
            .await?
            .filter(Account::is_connected)
            .ok_or_else(|| AppError::NotFound(format!("Account {}", account_id)))?;

        if let Some(active) = &account.active_channel_id {
            if self.db.get_subscription(active).await?.is_some() {
                return Err(AppError::AlreadySubscribed(account.nickname.clone()));
            }
        }

        let calendar_id = account
            .calendar_id
            .clone()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Connected account has no calendar")))?;

        self.sync.baseline(&account_id, &calendar_id).await?;

        let sub = self.open_channel(&account, &calendar_id).await?;

        match self.db.activate_subscription(&sub).await? {
            ActivateOutcome::Activated => {
                tracing::info!(
                    account_id = %account_id,
                    channel_id = %sub.channel_id,
                    expires_at = %sub.expires_at,
                    "Subscribed to calendar invites"
                );
                Ok(sub)
            }
            outcome => {
                // Lost a race with another instance; do not leave our channel live
                self.stop_channel_best_effort(&RetiredChannel::from(&sub)).await;
                match outcome {
                    ActivateOutcome::AlreadySubscribed => {
                        Err(AppError::AlreadySubscribed(account.nickname.clone()))
                    }
                    _ => Err(AppError::NotFound(format!("Account {}", account_id))),
                }
            }
        }
    }

    /// Replace `sub` with a fresh channel.
    ///
    /// When `sub` is no longer the account's active channel this is a no-op
    /// that returns the current subscription (or fails with `NotFound` if
    /// there is none).
    pub async fn renew(&self, sub: &Subscription) -> Result<Subscription, AppError> {
        let _guard = self.locks.lock(&sub.account_id).await;

        let account = self
            .db
            .get_account_by_id(&sub.account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {}", sub.account_id)))?;

        if account.active_channel_id.as_deref() != Some(sub.channel_id.as_str()) {
            tracing::debug!(
                channel_id = %sub.channel_id,
                "Renewal skipped, channel already superseded"
            );
            return self.current_subscription(&account).await;
        }

        let new_sub = self.open_channel(&account, &sub.calendar_id).await?;

        match self.db.swap_subscription(sub, &new_sub).await? {
            SwapOutcome::Swapped(retired) => {
                tracing::info!(
                    account_id = %sub.account_id,
                    old_channel_id = %sub.channel_id,
                    channel_id = %new_sub.channel_id,
                    expires_at = %new_sub.expires_at,
                    "Subscription renewed"
                );
                self.stop_channel_best_effort(&retired).await;
                Ok(new_sub)
            }
            SwapOutcome::Superseded => {
                self.stop_channel_best_effort(&RetiredChannel::from(&new_sub))
                    .await;
                self.current_subscription(&account).await
            }
        }
    }

    /// Stop watching the account's calendar. Idempotent.
    pub async fn unsubscribe(&self, account: &Account) -> Result<(), AppError> {
        let account_id = account.id();
        let _guard = self.locks.lock(&account_id).await;
        self.unsubscribe_locked(&account_id).await
    }

    /// Unsubscribe by account id (scheduler teardown).
    pub async fn tear_down(&self, account_id: &str) -> Result<(), AppError> {
        let _guard = self.locks.lock(account_id).await;
        self.unsubscribe_locked(account_id).await
    }

    /// Unsubscribe body for callers already holding the account lock.
    async fn unsubscribe_locked(&self, account_id: &str) -> Result<(), AppError> {
        match self.db.remove_subscription(account_id).await? {
            Some(retired) => {
                tracing::info!(
                    account_id,
                    channel_id = %retired.channel_id,
                    "Unsubscribed from calendar invites"
                );
                self.stop_channel_best_effort(&retired).await;
            }
            None => tracing::debug!(account_id, "Unsubscribe with no active subscription"),
        }
        Ok(())
    }

    /// Teardown before an account is deleted, for callers holding the
    /// account lock.
    ///
    /// Removes the active subscription and stops every retired channel of
    /// the account. Fails while a channel is still live at Google and could
    /// be stopped by retrying. Channels without a usable grant cannot be
    /// stopped any more and are left to expire.
    pub(crate) async fn release_locked(&self, account_id: &str) -> Result<(), AppError> {
        if let Some(retired) = self.db.remove_subscription(account_id).await? {
            tracing::info!(
                account_id,
                channel_id = %retired.channel_id,
                "Unsubscribed from calendar invites"
            );
        }

        let pending = self
            .db
            .list_retired_channels()
            .await?
            .into_iter()
            .filter(|c| c.account_id == account_id);

        for channel in pending {
            match self.stop_channel(&channel).await {
                Ok(()) => {}
                // No usable grant; Google drops the channel at expiry
                Err(AppError::AuthRevoked(_)) | Err(AppError::NotFound(_)) => {
                    tracing::warn!(
                        account_id,
                        channel_id = %channel.channel_id,
                        expires_at = %channel.expires_at,
                        "No usable credential, channel left to expire"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        account_id,
                        channel_id = %channel.channel_id,
                        "Failed to stop channel, account kept"
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Map an incoming channel id to its live subscription and account.
    ///
    /// Unknown channels, channels that have been superseded, and channels
    /// of accounts that are no longer connected all yield `UnknownChannel`.
    pub async fn resolve_by_channel_id(
        &self,
        channel_id: &str,
    ) -> Result<(Subscription, Account), AppError> {
        let unknown = || AppError::UnknownChannel(channel_id.to_string());

        let sub = self.db.get_subscription(channel_id).await?.ok_or_else(unknown)?;
        let account = self
            .db
            .get_account_by_id(&sub.account_id)
            .await?
            .ok_or_else(unknown)?;

        if !account.is_connected() || account.active_channel_id.as_deref() != Some(channel_id) {
            return Err(unknown());
        }
        Ok((sub, account))
    }

    /// Retry stop calls for retired channels left behind by earlier failures.
    ///
    /// Returns the number of retired channels cleared.
    pub async fn sweep_retired(&self) -> Result<usize, AppError> {
        let retired = self.db.list_retired_channels().await?;
        let now = Utc::now();
        let mut cleared = 0;

        for channel in retired {
            let expired = parse_utc_rfc3339(&channel.expires_at).is_none_or(|t| t <= now);
            if expired {
                // Google already dropped it
                self.db.delete_retired_channel(&channel.channel_id).await?;
                cleared += 1;
            } else if self.stop_channel_best_effort(&channel).await {
                cleared += 1;
            }
        }

        if cleared > 0 {
            tracing::info!(cleared, "Swept retired channels");
        }
        Ok(cleared)
    }

    async fn current_subscription(&self, account: &Account) -> Result<Subscription, AppError> {
        match &account.active_channel_id {
            Some(active) => self
                .db
                .get_subscription(active)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Subscription {}", active))),
            None => Err(AppError::NotFound(format!(
                "Subscription for {}",
                account.id()
            ))),
        }
    }

    /// Create a channel at Google and build (but do not store) its record.
    async fn open_channel(
        &self,
        account: &Account,
        calendar_id: &str,
    ) -> Result<Subscription, AppError> {
        let account_id = account.id();
        let channel_id = self.random_token(18)?;
        let verification_token = self.random_token(32)?;

        let access_token = self.tokens.get_valid_token(&account_id).await?;
        let request = WatchRequest::web_hook(
            &channel_id,
            &self.config.webhook_url(),
            &verification_token,
            self.config.channel_ttl.num_seconds(),
        );

        let response = self
            .google
            .watch_events(&access_token, calendar_id, &request)
            .await
            .inspect_err(|e| {
                if e.is_token_error() {
                    self.tokens.evict(&account_id);
                }
            })?;

        let now = Utc::now();
        let expires_at = response
            .expires_at()
            .unwrap_or_else(|| now + self.config.channel_ttl);
        if expires_at <= now {
            return Err(AppError::Provider(
                "Watch channel returned with an expiry in the past".to_string(),
            ));
        }

        Ok(Subscription {
            channel_id: response.id,
            resource_id: response.resource_id,
            account_id,
            user: account.user.clone(),
            nickname: account.nickname.clone(),
            calendar_id: calendar_id.to_string(),
            verification_token,
            expires_at: format_utc_rfc3339(expires_at),
            renewal_failures: 0,
            created_at: format_utc_rfc3339(now),
        })
    }

    /// Ask Google to stop a channel and drop its retired marker.
    ///
    /// Only a 404 from Google counts as already stopped. When no access token
    /// can be obtained the marker stays, so the channel is not forgotten.
    async fn stop_channel(&self, channel: &RetiredChannel) -> Result<(), AppError> {
        let access_token = self.tokens.get_valid_token(&channel.account_id).await?;

        match self
            .google
            .stop_channel(&access_token, &channel.channel_id, &channel.resource_id)
            .await
        {
            Ok(()) => {}
            Err(AppError::NotFound(_)) => {
                tracing::debug!(channel_id = %channel.channel_id, "Channel already gone at Google");
            }
            Err(e) => {
                if e.is_token_error() {
                    self.tokens.evict(&channel.account_id);
                }
                return Err(e);
            }
        }

        self.db.delete_retired_channel(&channel.channel_id).await
    }

    /// `stop_channel`, logging instead of failing. Returns `true` when the
    /// marker was cleared.
    async fn stop_channel_best_effort(&self, channel: &RetiredChannel) -> bool {
        match self.stop_channel(channel).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    channel_id = %channel.channel_id,
                    "Failed to stop channel, will retry on next sweep"
                );
                false
            }
        }
    }

    fn random_token(&self, len: usize) -> Result<String, AppError> {
        let mut bytes = vec![0u8; len];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| AppError::Internal(anyhow::anyhow!("System RNG failure")))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }
}
