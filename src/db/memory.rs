// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process storage backend.
//!
//! Mirrors the Firestore collections with plain maps behind one mutex, so
//! every operation is trivially atomic. Used by tests and `memory://` runs.

use super::{
    tracked_event_doc_id, ActivateOutcome, CompleteLinkOutcome, PendingLinkOutcome, SwapOutcome,
    SyncState,
};
use crate::models::macros::macro_doc_id;
use crate::models::{
    Account, ConnectionState, LinkRequest, Macro, MacroScope, RetiredChannel, StoredCredential,
    Subscription, TrackedEvent,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    accounts: BTreeMap<String, Account>,
    credentials: HashMap<String, StoredCredential>,
    links: HashMap<String, LinkRequest>,
    subscriptions: HashMap<String, Subscription>,
    retired: HashMap<String, RetiredChannel>,
    sync: HashMap<String, SyncState>,
    tracked: HashMap<String, TrackedEvent>,
    macros: HashMap<String, Macro>,
}

/// Maps guarded by a single lock.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // Mutations below never panic midway, so a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Accounts ────────────────────────────────────────────────

    pub fn create_pending_link(&self, link: &LinkRequest) -> PendingLinkOutcome {
        let mut state = self.state();
        let id = crate::models::account::account_id(&link.user, &link.nickname);

        match state.accounts.get(&id) {
            Some(existing) if existing.is_connected() => {
                return PendingLinkOutcome::DuplicateNickname
            }
            Some(_) => {
                if let Some(pending) = state.accounts.get_mut(&id) {
                    pending.updated_at = link.created_at.clone();
                }
            }
            None => {
                state.accounts.insert(
                    id,
                    Account {
                        user: link.user.clone(),
                        nickname: link.nickname.clone(),
                        state: ConnectionState::Pending,
                        calendar_id: None,
                        active_channel_id: None,
                        needs_resubscribe: false,
                        created_at: link.created_at.clone(),
                        updated_at: link.created_at.clone(),
                    },
                );
            }
        }

        state.links.insert(link.link_id.clone(), link.clone());
        PendingLinkOutcome::Created
    }

    pub fn get_link(&self, link_id: &str) -> Option<LinkRequest> {
        self.state().links.get(link_id).cloned()
    }

    pub fn purge_expired_links(&self, cutoff: &str) -> usize {
        let mut state = self.state();
        let links_before = state.links.len();
        state.links.retain(|_, l| l.created_at.as_str() >= cutoff);

        let stale: Vec<String> = state
            .accounts
            .iter()
            .filter(|(_, a)| a.state == ConnectionState::Pending && a.updated_at.as_str() < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            state.accounts.remove(id);
        }

        links_before - state.links.len() + stale.len()
    }

    pub fn complete_link(
        &self,
        link_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
        calendar_id: &str,
        credential: &StoredCredential,
    ) -> CompleteLinkOutcome {
        let mut state = self.state();

        let Some(link) = state.links.remove(link_id) else {
            return CompleteLinkOutcome::Expired;
        };
        if link.is_expired(now, ttl) {
            return CompleteLinkOutcome::Expired;
        }

        let id = crate::models::account::account_id(&link.user, &link.nickname);
        let existing = state.accounts.get(&id).cloned();
        if existing.as_ref().is_some_and(Account::is_connected) {
            return CompleteLinkOutcome::DuplicateNickname;
        }

        let account = connected_account(existing, &link, calendar_id, now);
        state.accounts.insert(id.clone(), account.clone());
        state.credentials.insert(id, credential.clone());
        CompleteLinkOutcome::Linked(account)
    }

    pub fn get_account(&self, account_id: &str) -> Option<Account> {
        self.state().accounts.get(account_id).cloned()
    }

    pub fn list_accounts(&self, user: &str) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .state()
            .accounts
            .values()
            .filter(|a| a.user == user)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        accounts
    }

    pub fn update_account(&self, account_id: &str, update: impl FnOnce(&mut Account)) {
        if let Some(account) = self.state().accounts.get_mut(account_id) {
            update(account);
        }
    }

    pub fn delete_account(&self, account_id: &str) {
        let mut state = self.state();
        state.accounts.remove(account_id);
        state.credentials.remove(account_id);
    }

    pub fn get_credential(&self, account_id: &str) -> Option<StoredCredential> {
        self.state().credentials.get(account_id).cloned()
    }

    pub fn store_refreshed_credential(&self, account_id: &str, credential: &StoredCredential) -> bool {
        let mut state = self.state();
        if !state.accounts.contains_key(account_id) {
            return false;
        }
        state
            .credentials
            .insert(account_id.to_string(), credential.clone());
        true
    }

    // ─── Subscriptions ───────────────────────────────────────────

    pub fn get_subscription(&self, channel_id: &str) -> Option<Subscription> {
        self.state().subscriptions.get(channel_id).cloned()
    }

    pub fn activate_subscription(&self, sub: &Subscription) -> ActivateOutcome {
        let mut state = self.state();

        let Some(account) = state.accounts.get(&sub.account_id) else {
            return ActivateOutcome::AccountUnavailable;
        };
        if !account.is_connected() {
            return ActivateOutcome::AccountUnavailable;
        }
        if let Some(active) = &account.active_channel_id {
            if state.subscriptions.contains_key(active) {
                return ActivateOutcome::AlreadySubscribed;
            }
        }

        state
            .subscriptions
            .insert(sub.channel_id.clone(), sub.clone());
        if let Some(account) = state.accounts.get_mut(&sub.account_id) {
            account.active_channel_id = Some(sub.channel_id.clone());
            account.needs_resubscribe = false;
            account.updated_at = sub.created_at.clone();
        }
        ActivateOutcome::Activated
    }

    pub fn swap_subscription(&self, old: &Subscription, new: &Subscription) -> SwapOutcome {
        let mut state = self.state();

        let is_active = state
            .accounts
            .get(&old.account_id)
            .is_some_and(|a| a.active_channel_id.as_deref() == Some(old.channel_id.as_str()));
        if !is_active {
            return SwapOutcome::Superseded;
        }

        let retired = RetiredChannel::from(old);
        state.subscriptions.remove(&old.channel_id);
        state
            .subscriptions
            .insert(new.channel_id.clone(), new.clone());
        state
            .retired
            .insert(retired.channel_id.clone(), retired.clone());
        if let Some(account) = state.accounts.get_mut(&old.account_id) {
            account.active_channel_id = Some(new.channel_id.clone());
            account.updated_at = new.created_at.clone();
        }
        SwapOutcome::Swapped(retired)
    }

    pub fn remove_subscription(&self, account_id: &str) -> Option<RetiredChannel> {
        let mut state = self.state();

        let channel_id = state
            .accounts
            .get_mut(account_id)
            .and_then(|a| a.active_channel_id.take())?;
        let sub = state.subscriptions.remove(&channel_id)?;
        let retired = RetiredChannel::from(&sub);
        state
            .retired
            .insert(retired.channel_id.clone(), retired.clone());
        Some(retired)
    }

    pub fn list_subscriptions_expiring_before(&self, cutoff: &str) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .state()
            .subscriptions
            .values()
            .filter(|s| s.expires_at.as_str() <= cutoff)
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        subs
    }

    pub fn record_renewal_failure(&self, channel_id: &str) -> u32 {
        match self.state().subscriptions.get_mut(channel_id) {
            Some(sub) => {
                sub.renewal_failures += 1;
                sub.renewal_failures
            }
            None => 0,
        }
    }

    pub fn list_retired_channels(&self) -> Vec<RetiredChannel> {
        self.state().retired.values().cloned().collect()
    }

    pub fn delete_retired_channel(&self, channel_id: &str) {
        self.state().retired.remove(channel_id);
    }

    // ─── Sync state ──────────────────────────────────────────────

    pub fn get_sync_state(&self, account_id: &str) -> Option<SyncState> {
        self.state().sync.get(account_id).cloned()
    }

    pub fn set_sync_state(&self, sync: &SyncState) {
        self.state()
            .sync
            .insert(sync.account_id.clone(), sync.clone());
    }

    pub fn get_tracked_event(&self, account_id: &str, event_id: &str) -> Option<TrackedEvent> {
        self.state()
            .tracked
            .get(&tracked_event_doc_id(account_id, event_id))
            .cloned()
    }

    pub fn put_tracked_event(&self, event: &TrackedEvent) {
        self.state().tracked.insert(
            tracked_event_doc_id(&event.account_id, &event.event_id),
            event.clone(),
        );
    }

    pub fn delete_tracked_event(&self, account_id: &str, event_id: &str) {
        self.state()
            .tracked
            .remove(&tracked_event_doc_id(account_id, event_id));
    }

    pub fn clear_sync_state(&self, account_id: &str) -> usize {
        let mut state = self.state();
        state.sync.remove(account_id);
        let before = state.tracked.len();
        state.tracked.retain(|_, t| t.account_id != account_id);
        before - state.tracked.len()
    }

    // ─── Macros ──────────────────────────────────────────────────

    pub fn create_macro(&self, m: &Macro) -> bool {
        self.state()
            .macros
            .insert(macro_doc_id(&m.scope_name, m.is_conv, &m.name), m.clone())
            .is_none()
    }

    pub fn get_macro(&self, scope: &MacroScope, name: &str) -> Option<Macro> {
        let state = self.state();
        state
            .macros
            .get(&macro_doc_id(&scope.conversation_id, true, name))
            .or_else(|| {
                state
                    .macros
                    .get(&macro_doc_id(&scope.channel_name, false, name))
            })
            .cloned()
    }

    pub fn list_macros(&self, scope: &MacroScope) -> Vec<Macro> {
        let mut macros: Vec<Macro> = self
            .state()
            .macros
            .values()
            .filter(|m| m.scope_name == scope.name_for(m.is_conv))
            .cloned()
            .collect();
        super::firestore::sort_macros(&mut macros);
        macros
    }

    pub fn remove_macro(&self, scope: &MacroScope, name: &str) -> bool {
        let mut state = self.state();
        state
            .macros
            .remove(&macro_doc_id(&scope.conversation_id, true, name))
            .or_else(|| {
                state
                    .macros
                    .remove(&macro_doc_id(&scope.channel_name, false, name))
            })
            .is_some()
    }
}

/// The account record written when a link completes.
pub(crate) fn connected_account(
    existing: Option<Account>,
    link: &LinkRequest,
    calendar_id: &str,
    now: DateTime<Utc>,
) -> Account {
    let now = crate::time_utils::format_utc_rfc3339(now);
    match existing {
        Some(mut account) => {
            account.state = ConnectionState::Connected;
            account.calendar_id = Some(calendar_id.to_string());
            account.updated_at = now;
            account
        }
        None => Account {
            user: link.user.clone(),
            nickname: link.nickname.clone(),
            state: ConnectionState::Connected,
            calendar_id: Some(calendar_id.to_string()),
            active_channel_id: None,
            needs_resubscribe: false,
            created_at: now.clone(),
            updated_at: now,
        },
    }
}
