// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Provides high-level operations for:
//! - Accounts and pending links (nickname uniqueness)
//! - Credentials (encrypted OAuth tokens)
//! - Subscriptions and retired channels (watch channel lifecycle)
//! - Sync state and tracked events (notification de-duplication)
//! - Macros
//!
//! Every read-modify-write runs inside a Firestore transaction so that
//! concurrent instances cannot interleave between the check and the write.

use super::memory::{connected_account, MemoryStore};
use super::{
    collections, tracked_event_doc_id, ActivateOutcome, CompleteLinkOutcome, PendingLinkOutcome,
    SwapOutcome, SyncState,
};
use crate::error::AppError;
use crate::models::account::account_id;
use crate::models::macros::macro_doc_id;
use crate::models::{
    Account, ConnectionState, LinkRequest, Macro, MacroScope, RetiredChannel, StoredCredential,
    Subscription, TrackedEvent,
};
use crate::time_utils::format_utc_rfc3339;
use chrono::{DateTime, Duration, Utc};
use firestore::errors::{BackoffError, FirestoreError};
use std::sync::Arc;

// Firestore limits batch/transaction writes to 500 operations.
// We use a safe limit of 400 to allow headroom.
const BATCH_SIZE: usize = 400;

type TxResult<T> = std::result::Result<T, BackoffError<FirestoreError>>;

#[derive(Clone)]
enum Backend {
    Firestore(firestore::FirestoreDb),
    Memory(Arc<MemoryStore>),
}

/// Database client.
#[derive(Clone)]
pub struct FirestoreDb {
    backend: Backend,
}

fn db_err(e: impl std::fmt::Display) -> AppError {
    AppError::Database(e.to_string())
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        // If the emulator environment variable is set, use unauthenticated connection
        // to avoid local credential warnings and leakage.
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            backend: Backend::Firestore(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            backend: Backend::Firestore(client),
        })
    }

    /// Create a process-local database (tests and `memory://`).
    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(MemoryStore::default())),
        }
    }

    // ─── Account Operations ──────────────────────────────────────

    /// Record a pending link and, for a new nickname, a `pending` account.
    ///
    /// Fails with `DuplicateNickname` if the nickname is already connected.
    pub async fn create_pending_link(
        &self,
        link: &LinkRequest,
    ) -> Result<PendingLinkOutcome, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.create_pending_link(link)),
            Backend::Firestore(client) => client,
        };

        let link = link.clone();
        client
            .run_transaction(move |db, transaction| {
                let link = link.clone();
                Box::pin(async move {
                    let id = account_id(&link.user, &link.nickname);
                    let existing: Option<Account> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::ACCOUNTS)
                        .obj()
                        .one(&id)
                        .await?;

                    match existing {
                        Some(account) if account.is_connected() => {
                            return Ok(PendingLinkOutcome::DuplicateNickname)
                        }
                        Some(mut pending) => {
                            // Keep the purge from dropping a nickname mid-retry
                            pending.updated_at = link.created_at.clone();
                            db.fluent()
                                .update()
                                .in_col(collections::ACCOUNTS)
                                .document_id(&id)
                                .object(&pending)
                                .add_to_transaction(transaction)?;
                        }
                        None => {
                            let pending = Account {
                                user: link.user.clone(),
                                nickname: link.nickname.clone(),
                                state: ConnectionState::Pending,
                                calendar_id: None,
                                active_channel_id: None,
                                needs_resubscribe: false,
                                created_at: link.created_at.clone(),
                                updated_at: link.created_at.clone(),
                            };
                            db.fluent()
                                .update()
                                .in_col(collections::ACCOUNTS)
                                .document_id(&id)
                                .object(&pending)
                                .add_to_transaction(transaction)?;
                        }
                    }

                    db.fluent()
                        .update()
                        .in_col(collections::LINK_REQUESTS)
                        .document_id(&link.link_id)
                        .object(&link)
                        .add_to_transaction(transaction)?;

                    TxResult::Ok(PendingLinkOutcome::Created)
                })
            })
            .await
            .map_err(db_err)
    }

    /// Read a link request without consuming it.
    pub async fn get_link(&self, link_id: &str) -> Result<Option<LinkRequest>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.get_link(link_id)),
            Backend::Firestore(client) => client,
        };

        client
            .fluent()
            .select()
            .by_id_in(collections::LINK_REQUESTS)
            .obj()
            .one(link_id)
            .await
            .map_err(db_err)
    }

    /// Consume a link request and store the connected account + credential.
    ///
    /// The link is deleted even when it turns out to be expired, so a link
    /// can never be completed twice.
    pub async fn complete_link(
        &self,
        link_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
        calendar_id: &str,
        credential: &StoredCredential,
    ) -> Result<CompleteLinkOutcome, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => {
                return Ok(mem.complete_link(link_id, now, ttl, calendar_id, credential))
            }
            Backend::Firestore(client) => client,
        };

        let link_id = link_id.to_string();
        let calendar_id = calendar_id.to_string();
        let credential = credential.clone();
        client
            .run_transaction(move |db, transaction| {
                let link_id = link_id.clone();
                let calendar_id = calendar_id.clone();
                let credential = credential.clone();
                Box::pin(async move {
                    let link: Option<LinkRequest> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::LINK_REQUESTS)
                        .obj()
                        .one(&link_id)
                        .await?;
                    let Some(link) = link else {
                        return Ok(CompleteLinkOutcome::Expired);
                    };

                    db.fluent()
                        .delete()
                        .from(collections::LINK_REQUESTS)
                        .document_id(&link_id)
                        .add_to_transaction(transaction)?;

                    if link.is_expired(now, ttl) {
                        return Ok(CompleteLinkOutcome::Expired);
                    }

                    let id = account_id(&link.user, &link.nickname);
                    let existing: Option<Account> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::ACCOUNTS)
                        .obj()
                        .one(&id)
                        .await?;
                    if existing.as_ref().is_some_and(Account::is_connected) {
                        return Ok(CompleteLinkOutcome::DuplicateNickname);
                    }

                    let account = connected_account(existing, &link, &calendar_id, now);
                    db.fluent()
                        .update()
                        .in_col(collections::ACCOUNTS)
                        .document_id(&id)
                        .object(&account)
                        .add_to_transaction(transaction)?;
                    db.fluent()
                        .update()
                        .in_col(collections::CREDENTIALS)
                        .document_id(&id)
                        .object(&credential)
                        .add_to_transaction(transaction)?;

                    TxResult::Ok(CompleteLinkOutcome::Linked(account))
                })
            })
            .await
            .map_err(db_err)
    }

    /// Delete link requests created before `cutoff` and pending accounts
    /// untouched since then.
    ///
    /// Returns the number of documents deleted.
    pub async fn purge_expired_links(&self, cutoff: DateTime<Utc>) -> Result<usize, AppError> {
        let cutoff = format_utc_rfc3339(cutoff);
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.purge_expired_links(&cutoff)),
            Backend::Firestore(client) => client,
        };

        let before = cutoff.clone();
        let links: Vec<LinkRequest> = client
            .fluent()
            .select()
            .from(collections::LINK_REQUESTS)
            .filter(move |q| q.field("created_at").less_than(before.clone()))
            .obj()
            .query()
            .await
            .map_err(db_err)?;
        self.batch_delete(&links, collections::LINK_REQUESTS, |link: &LinkRequest| {
            link.link_id.clone()
        })
        .await?;

        // Filtered here rather than in the query to avoid a composite index
        let pending: Vec<Account> = client
            .fluent()
            .select()
            .from(collections::ACCOUNTS)
            .filter(|q| q.field("state").eq("pending"))
            .obj()
            .query()
            .await
            .map_err(db_err)?;

        let mut purged = links.len();
        for account in pending.iter().filter(|a| a.updated_at < cutoff) {
            let id = account.id();
            let cutoff = cutoff.clone();
            let deleted = client
                .run_transaction(move |db, transaction| {
                    let id = id.clone();
                    let cutoff = cutoff.clone();
                    Box::pin(async move {
                        // A connect may have completed or been retried since the query
                        let current: Option<Account> = db
                            .fluent()
                            .select()
                            .by_id_in(collections::ACCOUNTS)
                            .obj()
                            .one(&id)
                            .await?;
                        let stale = current.is_some_and(|a| {
                            a.state == ConnectionState::Pending && a.updated_at < cutoff
                        });
                        if stale {
                            db.fluent()
                                .delete()
                                .from(collections::ACCOUNTS)
                                .document_id(&id)
                                .add_to_transaction(transaction)?;
                        }
                        TxResult::Ok(stale)
                    })
                })
                .await
                .map_err(db_err)?;
            if deleted {
                purged += 1;
            }
        }

        if purged > 0 {
            tracing::debug!(purged, "Purged expired links");
        }
        Ok(purged)
    }

    /// Get an account by its document id.
    pub async fn get_account_by_id(&self, account_id: &str) -> Result<Option<Account>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.get_account(account_id)),
            Backend::Firestore(client) => client,
        };

        client
            .fluent()
            .select()
            .by_id_in(collections::ACCOUNTS)
            .obj()
            .one(account_id)
            .await
            .map_err(db_err)
    }

    /// Get an account by user and nickname.
    pub async fn get_account(&self, user: &str, nickname: &str) -> Result<Option<Account>, AppError> {
        self.get_account_by_id(&account_id(user, nickname)).await
    }

    /// All accounts of a user, ordered by nickname.
    pub async fn list_accounts(&self, user: &str) -> Result<Vec<Account>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.list_accounts(user)),
            Backend::Firestore(client) => client,
        };

        let user = user.to_string();
        let mut accounts: Vec<Account> = client
            .fluent()
            .select()
            .from(collections::ACCOUNTS)
            .filter(move |q| q.field("user").eq(user.clone()))
            .obj()
            .query()
            .await
            .map_err(db_err)?;

        // Sorted here rather than in the query to avoid a composite index
        accounts.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        Ok(accounts)
    }

    /// Mark an account `revoked`. Missing accounts are ignored.
    pub async fn mark_revoked(&self, account_id: &str) -> Result<(), AppError> {
        self.update_account(account_id, |account| {
            account.state = ConnectionState::Revoked;
        })
        .await
    }

    /// Set or clear the "please re-subscribe" flag.
    pub async fn set_needs_resubscribe(
        &self,
        account_id: &str,
        needs_resubscribe: bool,
    ) -> Result<(), AppError> {
        self.update_account(account_id, move |account| {
            account.needs_resubscribe = needs_resubscribe;
        })
        .await
    }

    /// Transactional read-modify-write of one account document.
    async fn update_account<F>(&self, account_id: &str, update: F) -> Result<(), AppError>
    where
        F: Fn(&mut Account) + Send + Sync + Clone + 'static,
    {
        let now = format_utc_rfc3339(Utc::now());
        let client = match &self.backend {
            Backend::Memory(mem) => {
                mem.update_account(account_id, |account| {
                    update(account);
                    account.updated_at = now;
                });
                return Ok(());
            }
            Backend::Firestore(client) => client,
        };

        let account_id = account_id.to_string();
        client
            .run_transaction(move |db, transaction| {
                let account_id = account_id.clone();
                let update = update.clone();
                let now = now.clone();
                Box::pin(async move {
                    let account: Option<Account> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::ACCOUNTS)
                        .obj()
                        .one(&account_id)
                        .await?;
                    if let Some(mut account) = account {
                        update(&mut account);
                        account.updated_at = now;
                        db.fluent()
                            .update()
                            .in_col(collections::ACCOUNTS)
                            .document_id(&account_id)
                            .object(&account)
                            .add_to_transaction(transaction)?;
                    }
                    TxResult::Ok(())
                })
            })
            .await
            .map_err(db_err)
    }

    /// Delete an account record and its credential.
    ///
    /// Callers tear down the subscription first so no channel is orphaned.
    pub async fn delete_account(&self, account_id: &str) -> Result<(), AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => {
                mem.delete_account(account_id);
                return Ok(());
            }
            Backend::Firestore(client) => client,
        };

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

        for collection in [collections::CREDENTIALS, collections::ACCOUNTS] {
            client
                .fluent()
                .delete()
                .from(collection)
                .document_id(account_id)
                .add_to_transaction(&mut transaction)
                .map_err(db_err)?;
        }

        transaction
            .commit()
            .await
            .map_err(|e| AppError::Database(format!("Transaction commit failed: {}", e)))?;
        Ok(())
    }

    // ─── Credential Operations ───────────────────────────────────

    /// Get encrypted tokens for an account.
    pub async fn get_credential(
        &self,
        account_id: &str,
    ) -> Result<Option<StoredCredential>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.get_credential(account_id)),
            Backend::Firestore(client) => client,
        };

        client
            .fluent()
            .select()
            .by_id_in(collections::CREDENTIALS)
            .obj()
            .one(account_id)
            .await
            .map_err(db_err)
    }

    /// Store refreshed tokens, unless the account has been deleted since
    /// the refresh started. Returns `false` in that case.
    pub async fn store_refreshed_credential(
        &self,
        account_id: &str,
        credential: &StoredCredential,
    ) -> Result<bool, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.store_refreshed_credential(account_id, credential)),
            Backend::Firestore(client) => client,
        };

        let account_id = account_id.to_string();
        let credential = credential.clone();
        client
            .run_transaction(move |db, transaction| {
                let account_id = account_id.clone();
                let credential = credential.clone();
                Box::pin(async move {
                    let account: Option<Account> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::ACCOUNTS)
                        .obj()
                        .one(&account_id)
                        .await?;
                    if account.is_none() {
                        return Ok(false);
                    }
                    db.fluent()
                        .update()
                        .in_col(collections::CREDENTIALS)
                        .document_id(&account_id)
                        .object(&credential)
                        .add_to_transaction(transaction)?;
                    TxResult::Ok(true)
                })
            })
            .await
            .map_err(db_err)
    }

    // ─── Subscription Operations ─────────────────────────────────

    /// Get a subscription by channel id.
    pub async fn get_subscription(
        &self,
        channel_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.get_subscription(channel_id)),
            Backend::Firestore(client) => client,
        };

        client
            .fluent()
            .select()
            .by_id_in(collections::SUBSCRIPTIONS)
            .obj()
            .one(channel_id)
            .await
            .map_err(db_err)
    }

    /// Store a new subscription and point its account at it, unless the
    /// account already has an active one.
    pub async fn activate_subscription(
        &self,
        sub: &Subscription,
    ) -> Result<ActivateOutcome, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.activate_subscription(sub)),
            Backend::Firestore(client) => client,
        };

        let sub = sub.clone();
        client
            .run_transaction(move |db, transaction| {
                let sub = sub.clone();
                Box::pin(async move {
                    let account: Option<Account> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::ACCOUNTS)
                        .obj()
                        .one(&sub.account_id)
                        .await?;
                    let Some(mut account) = account.filter(Account::is_connected) else {
                        return Ok(ActivateOutcome::AccountUnavailable);
                    };

                    if let Some(active) = &account.active_channel_id {
                        let existing: Option<Subscription> = db
                            .fluent()
                            .select()
                            .by_id_in(collections::SUBSCRIPTIONS)
                            .obj()
                            .one(active)
                            .await?;
                        if existing.is_some() {
                            return Ok(ActivateOutcome::AlreadySubscribed);
                        }
                    }

                    account.active_channel_id = Some(sub.channel_id.clone());
                    account.needs_resubscribe = false;
                    account.updated_at = sub.created_at.clone();

                    db.fluent()
                        .update()
                        .in_col(collections::SUBSCRIPTIONS)
                        .document_id(&sub.channel_id)
                        .object(&sub)
                        .add_to_transaction(transaction)?;
                    db.fluent()
                        .update()
                        .in_col(collections::ACCOUNTS)
                        .document_id(&sub.account_id)
                        .object(&account)
                        .add_to_transaction(transaction)?;

                    TxResult::Ok(ActivateOutcome::Activated)
                })
            })
            .await
            .map_err(db_err)
    }

    /// Atomically replace `old` with its renewal `new`.
    ///
    /// In one transaction: write `new`, repoint the account, delete `old`
    /// and record it as retired. Nothing is written when `old` is no longer
    /// the account's active channel.
    pub async fn swap_subscription(
        &self,
        old: &Subscription,
        new: &Subscription,
    ) -> Result<SwapOutcome, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.swap_subscription(old, new)),
            Backend::Firestore(client) => client,
        };

        let old = old.clone();
        let new = new.clone();
        client
            .run_transaction(move |db, transaction| {
                let old = old.clone();
                let new = new.clone();
                Box::pin(async move {
                    let account: Option<Account> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::ACCOUNTS)
                        .obj()
                        .one(&old.account_id)
                        .await?;
                    let Some(mut account) = account.filter(|a| {
                        a.active_channel_id.as_deref() == Some(old.channel_id.as_str())
                    }) else {
                        return Ok(SwapOutcome::Superseded);
                    };

                    let retired = RetiredChannel::from(&old);
                    account.active_channel_id = Some(new.channel_id.clone());
                    account.updated_at = new.created_at.clone();

                    db.fluent()
                        .update()
                        .in_col(collections::SUBSCRIPTIONS)
                        .document_id(&new.channel_id)
                        .object(&new)
                        .add_to_transaction(transaction)?;
                    db.fluent()
                        .update()
                        .in_col(collections::ACCOUNTS)
                        .document_id(&old.account_id)
                        .object(&account)
                        .add_to_transaction(transaction)?;
                    db.fluent()
                        .delete()
                        .from(collections::SUBSCRIPTIONS)
                        .document_id(&old.channel_id)
                        .add_to_transaction(transaction)?;
                    db.fluent()
                        .update()
                        .in_col(collections::RETIRED_CHANNELS)
                        .document_id(&retired.channel_id)
                        .object(&retired)
                        .add_to_transaction(transaction)?;

                    TxResult::Ok(SwapOutcome::Swapped(retired))
                })
            })
            .await
            .map_err(db_err)
    }

    /// Detach the active subscription from an account.
    ///
    /// Returns the retired channel, or `None` if there was nothing to remove.
    pub async fn remove_subscription(
        &self,
        account_id: &str,
    ) -> Result<Option<RetiredChannel>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.remove_subscription(account_id)),
            Backend::Firestore(client) => client,
        };

        let account_id = account_id.to_string();
        client
            .run_transaction(move |db, transaction| {
                let account_id = account_id.clone();
                Box::pin(async move {
                    let account: Option<Account> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::ACCOUNTS)
                        .obj()
                        .one(&account_id)
                        .await?;
                    let Some(mut account) = account else {
                        return Ok(None);
                    };
                    let Some(channel_id) = account.active_channel_id.take() else {
                        return Ok(None);
                    };

                    let sub: Option<Subscription> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::SUBSCRIPTIONS)
                        .obj()
                        .one(&channel_id)
                        .await?;

                    account.updated_at = format_utc_rfc3339(Utc::now());
                    db.fluent()
                        .update()
                        .in_col(collections::ACCOUNTS)
                        .document_id(&account_id)
                        .object(&account)
                        .add_to_transaction(transaction)?;

                    let Some(sub) = sub else {
                        return Ok(None);
                    };
                    let retired = RetiredChannel::from(&sub);
                    db.fluent()
                        .delete()
                        .from(collections::SUBSCRIPTIONS)
                        .document_id(&channel_id)
                        .add_to_transaction(transaction)?;
                    db.fluent()
                        .update()
                        .in_col(collections::RETIRED_CHANNELS)
                        .document_id(&retired.channel_id)
                        .object(&retired)
                        .add_to_transaction(transaction)?;

                    TxResult::Ok(Some(retired))
                })
            })
            .await
            .map_err(db_err)
    }

    /// Subscriptions whose expiry is at or before `cutoff`, soonest first.
    pub async fn list_subscriptions_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let cutoff = format_utc_rfc3339(cutoff);
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.list_subscriptions_expiring_before(&cutoff)),
            Backend::Firestore(client) => client,
        };

        // RFC 3339 timestamps with a `Z` suffix sort lexicographically
        client
            .fluent()
            .select()
            .from(collections::SUBSCRIPTIONS)
            .filter(move |q| q.field("expires_at").less_than_or_equal(cutoff.clone()))
            .order_by([("expires_at", firestore::FirestoreQueryDirection::Ascending)])
            .obj()
            .query()
            .await
            .map_err(db_err)
    }

    /// Increment and return the consecutive renewal failure count.
    pub async fn record_renewal_failure(&self, channel_id: &str) -> Result<u32, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.record_renewal_failure(channel_id)),
            Backend::Firestore(client) => client,
        };

        let channel_id = channel_id.to_string();
        client
            .run_transaction(move |db, transaction| {
                let channel_id = channel_id.clone();
                Box::pin(async move {
                    let sub: Option<Subscription> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::SUBSCRIPTIONS)
                        .obj()
                        .one(&channel_id)
                        .await?;
                    let Some(mut sub) = sub else {
                        return Ok(0);
                    };
                    sub.renewal_failures += 1;
                    db.fluent()
                        .update()
                        .in_col(collections::SUBSCRIPTIONS)
                        .document_id(&channel_id)
                        .object(&sub)
                        .add_to_transaction(transaction)?;
                    TxResult::Ok(sub.renewal_failures)
                })
            })
            .await
            .map_err(db_err)
    }

    /// Channels still waiting for a stop call.
    pub async fn list_retired_channels(&self) -> Result<Vec<RetiredChannel>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.list_retired_channels()),
            Backend::Firestore(client) => client,
        };

        client
            .fluent()
            .select()
            .from(collections::RETIRED_CHANNELS)
            .obj()
            .query()
            .await
            .map_err(db_err)
    }

    pub async fn delete_retired_channel(&self, channel_id: &str) -> Result<(), AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => {
                mem.delete_retired_channel(channel_id);
                return Ok(());
            }
            Backend::Firestore(client) => client,
        };

        client
            .fluent()
            .delete()
            .from(collections::RETIRED_CHANNELS)
            .document_id(channel_id)
            .execute()
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // ─── Sync State Operations ───────────────────────────────────

    pub async fn get_sync_state(&self, account_id: &str) -> Result<Option<SyncState>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.get_sync_state(account_id)),
            Backend::Firestore(client) => client,
        };

        client
            .fluent()
            .select()
            .by_id_in(collections::SYNC_STATE)
            .obj()
            .one(account_id)
            .await
            .map_err(db_err)
    }

    pub async fn set_sync_state(&self, sync: &SyncState) -> Result<(), AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => {
                mem.set_sync_state(sync);
                return Ok(());
            }
            Backend::Firestore(client) => client,
        };

        let _: () = client
            .fluent()
            .update()
            .in_col(collections::SYNC_STATE)
            .document_id(&sync.account_id)
            .object(sync)
            .execute()
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_tracked_event(
        &self,
        account_id: &str,
        event_id: &str,
    ) -> Result<Option<TrackedEvent>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.get_tracked_event(account_id, event_id)),
            Backend::Firestore(client) => client,
        };

        client
            .fluent()
            .select()
            .by_id_in(collections::TRACKED_EVENTS)
            .obj()
            .one(&tracked_event_doc_id(account_id, event_id))
            .await
            .map_err(db_err)
    }

    pub async fn put_tracked_event(&self, event: &TrackedEvent) -> Result<(), AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => {
                mem.put_tracked_event(event);
                return Ok(());
            }
            Backend::Firestore(client) => client,
        };

        let _: () = client
            .fluent()
            .update()
            .in_col(collections::TRACKED_EVENTS)
            .document_id(tracked_event_doc_id(&event.account_id, &event.event_id))
            .object(event)
            .execute()
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete_tracked_event(
        &self,
        account_id: &str,
        event_id: &str,
    ) -> Result<(), AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => {
                mem.delete_tracked_event(account_id, event_id);
                return Ok(());
            }
            Backend::Firestore(client) => client,
        };

        client
            .fluent()
            .delete()
            .from(collections::TRACKED_EVENTS)
            .document_id(tracked_event_doc_id(account_id, event_id))
            .execute()
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Forget the sync token and all tracked events of an account.
    ///
    /// Returns the number of tracked events deleted.
    pub async fn clear_sync_state(&self, account_id: &str) -> Result<usize, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.clear_sync_state(account_id)),
            Backend::Firestore(client) => client,
        };

        let owner = account_id.to_string();
        let tracked: Vec<TrackedEvent> = client
            .fluent()
            .select()
            .from(collections::TRACKED_EVENTS)
            .filter(move |q| q.field("account_id").eq(owner.clone()))
            .obj()
            .query()
            .await
            .map_err(db_err)?;

        let count = tracked.len();
        self.batch_delete(&tracked, collections::TRACKED_EVENTS, |event: &TrackedEvent| {
            tracked_event_doc_id(&event.account_id, &event.event_id)
        })
        .await?;

        client
            .fluent()
            .delete()
            .from(collections::SYNC_STATE)
            .document_id(account_id)
            .execute()
            .await
            .map_err(db_err)?;

        tracing::debug!(account_id, count, "Cleared sync state");
        Ok(count)
    }

    // ─── Macro Operations ────────────────────────────────────────

    /// Create or overwrite a macro. Returns `true` when it did not exist.
    pub async fn create_macro(&self, m: &Macro) -> Result<bool, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.create_macro(m)),
            Backend::Firestore(client) => client,
        };

        let m = m.clone();
        client
            .run_transaction(move |db, transaction| {
                let m = m.clone();
                Box::pin(async move {
                    let doc_id = macro_doc_id(&m.scope_name, m.is_conv, &m.name);
                    let existing: Option<Macro> = db
                        .fluent()
                        .select()
                        .by_id_in(collections::MACROS)
                        .obj()
                        .one(&doc_id)
                        .await?;
                    db.fluent()
                        .update()
                        .in_col(collections::MACROS)
                        .document_id(&doc_id)
                        .object(&m)
                        .add_to_transaction(transaction)?;
                    TxResult::Ok(existing.is_none())
                })
            })
            .await
            .map_err(db_err)
    }

    /// Look up a macro, preferring the conversation-scoped entry.
    pub async fn get_macro(
        &self,
        scope: &MacroScope,
        name: &str,
    ) -> Result<Option<Macro>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.get_macro(scope, name)),
            Backend::Firestore(client) => client,
        };

        for is_conv in [true, false] {
            let found: Option<Macro> = client
                .fluent()
                .select()
                .by_id_in(collections::MACROS)
                .obj()
                .one(&macro_doc_id(scope.name_for(is_conv), is_conv, name))
                .await
                .map_err(db_err)?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Macros visible in a scope, by name, conversation entries first.
    pub async fn list_macros(&self, scope: &MacroScope) -> Result<Vec<Macro>, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.list_macros(scope)),
            Backend::Firestore(client) => client,
        };

        let mut macros = Vec::new();
        for is_conv in [true, false] {
            let scope_name = scope.name_for(is_conv).to_string();
            let found: Vec<Macro> = client
                .fluent()
                .select()
                .from(collections::MACROS)
                .filter(move |q| {
                    q.for_all([
                        q.field("scope_name").eq(scope_name.clone()),
                        q.field("is_conv").eq(is_conv),
                    ])
                })
                .obj()
                .query()
                .await
                .map_err(db_err)?;
            macros.extend(found);
        }
        sort_macros(&mut macros);
        Ok(macros)
    }

    /// Delete the conversation-scoped macro if present, else the
    /// channel-wide one. Returns `true` if something was deleted.
    pub async fn remove_macro(&self, scope: &MacroScope, name: &str) -> Result<bool, AppError> {
        let client = match &self.backend {
            Backend::Memory(mem) => return Ok(mem.remove_macro(scope, name)),
            Backend::Firestore(client) => client,
        };

        let conv_id = macro_doc_id(&scope.conversation_id, true, name);
        let channel_id = macro_doc_id(&scope.channel_name, false, name);
        client
            .run_transaction(move |db, transaction| {
                let candidates = [conv_id.clone(), channel_id.clone()];
                Box::pin(async move {
                    for doc_id in candidates {
                        let existing: Option<Macro> = db
                            .fluent()
                            .select()
                            .by_id_in(collections::MACROS)
                            .obj()
                            .one(&doc_id)
                            .await?;
                        if existing.is_some() {
                            db.fluent()
                                .delete()
                                .from(collections::MACROS)
                                .document_id(&doc_id)
                                .add_to_transaction(transaction)?;
                            return Ok(true);
                        }
                    }
                    TxResult::Ok(false)
                })
            })
            .await
            .map_err(db_err)
    }

    // ─── Helper Methods ────────────────────────────────────────────

    /// Helper to batch delete documents using transactions.
    async fn batch_delete<T, F>(
        &self,
        items: &[T],
        collection: &str,
        id_extractor: F,
    ) -> Result<(), AppError>
    where
        F: Fn(&T) -> String,
    {
        let Backend::Firestore(client) = &self.backend else {
            return Ok(());
        };

        for chunk in items.chunks(BATCH_SIZE) {
            let mut transaction = client
                .begin_transaction()
                .await
                .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

            for item in chunk {
                let doc_id = id_extractor(item);
                client
                    .fluent()
                    .delete()
                    .from(collection)
                    .document_id(&doc_id)
                    .add_to_transaction(&mut transaction)
                    .map_err(|e| {
                        AppError::Database(format!(
                            "Failed to add deletion to transaction for {}: {}",
                            collection, e
                        ))
                    })?;
            }

            transaction.commit().await.map_err(|e| {
                AppError::Database(format!("Failed to commit batch deletion: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Order macros by name, conversation-scoped entries first.
pub(crate) fn sort_macros(macros: &mut [Macro]) {
    macros.sort_by(|a, b| a.name.cmp(&b.name).then(b.is_conv.cmp(&a.is_conv)));
}
