//! Calendar change tracking.
//!
//! Keeps a per-account sync token and a ledger of invited events we have
//! already announced. Pulling changes turns the raw event stream into
//! [`EventDelta`]s; the ledger is updated in the same pass so a redelivered
//! notification yields nothing new.

use crate::db::{FirestoreDb, SyncState};
use crate::error::AppError;
use crate::models::{EventDelta, EventSummary, TrackedEvent};
use crate::services::google::{CalendarEvent, EventQuery, GoogleClient};
use crate::services::locks::AccountLocks;
use crate::services::tokens::TokenManager;
use crate::time_utils::format_utc_rfc3339;
use chrono::{DateTime, Utc};

/// Result of one incremental pull.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub deltas: Vec<EventDelta>,
    /// The sync token had expired and a full listing was done instead
    pub resynced: bool,
}

#[derive(Clone)]
pub struct CalendarSync {
    google: GoogleClient,
    db: FirestoreDb,
    tokens: TokenManager,
    /// Serializes sync work per account
    locks: AccountLocks,
}

impl CalendarSync {
    pub fn new(google: GoogleClient, db: FirestoreDb, tokens: TokenManager) -> Self {
        Self {
            google,
            db,
            tokens,
            locks: AccountLocks::new(),
        }
    }

    /// Record upcoming invites without announcing them and store a fresh
    /// sync token. Returns the number of invites now tracked.
    pub async fn baseline(&self, account_id: &str, calendar_id: &str) -> Result<usize, AppError> {
        let _guard = self.locks.lock(account_id).await;
        let access_token = self.tokens.get_valid_token(account_id).await?;

        let (events, sync_token) = self
            .list_all(&access_token, calendar_id, full_query(Utc::now()))
            .await?;

        let mut tracked = 0;
        for event in events.iter().filter(|e| !e.is_cancelled() && e.is_invitee()) {
            self.db
                .put_tracked_event(&tracked_event(account_id, event))
                .await?;
            tracked += 1;
        }

        self.store_sync_token(account_id, sync_token).await?;
        tracing::info!(account_id, tracked, "Sync baseline established");
        Ok(tracked)
    }

    /// Pull everything that changed since the last sync and classify it.
    pub async fn pull_changes(
        &self,
        account_id: &str,
        calendar_id: &str,
    ) -> Result<SyncOutcome, AppError> {
        let _guard = self.locks.lock(account_id).await;
        let access_token = self.tokens.get_valid_token(account_id).await?;

        let stored = self.db.get_sync_state(account_id).await?;
        let mut resynced = false;

        let listing = match stored {
            Some(state) => {
                let query = EventQuery::Incremental {
                    sync_token: state.sync_token,
                };
                match self.list_all(&access_token, calendar_id, query).await {
                    Err(AppError::Gone(_)) => {
                        tracing::info!(account_id, "Sync token expired, running full resync");
                        resynced = true;
                        self.list_all(&access_token, calendar_id, full_query(Utc::now()))
                            .await
                    }
                    other => other,
                }
            }
            None => {
                resynced = true;
                self.list_all(&access_token, calendar_id, full_query(Utc::now()))
                    .await
            }
        };

        let (events, sync_token) = listing.inspect_err(|e| {
            if e.is_token_error() {
                self.tokens.evict(account_id);
            }
        })?;

        let mut deltas = Vec::new();
        for event in &events {
            let tracked = self.db.get_tracked_event(account_id, &event.id).await?;
            let Some(delta) = classify(event, tracked.as_ref()) else {
                continue;
            };

            match &delta {
                EventDelta::NewInvite(_) | EventDelta::Updated(_) => {
                    self.db
                        .put_tracked_event(&tracked_event(account_id, event))
                        .await?;
                }
                EventDelta::Cancelled(_) => {
                    self.db.delete_tracked_event(account_id, &event.id).await?;
                }
            }
            deltas.push(delta);
        }

        self.store_sync_token(account_id, sync_token).await?;

        tracing::debug!(
            account_id,
            changed = events.len(),
            deltas = deltas.len(),
            resynced,
            "Pulled calendar changes"
        );
        Ok(SyncOutcome { deltas, resynced })
    }

    /// Follow pagination to the end, returning all events and the final sync token.
    async fn list_all(
        &self,
        access_token: &str,
        calendar_id: &str,
        query: EventQuery,
    ) -> Result<(Vec<CalendarEvent>, Option<String>), AppError> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .google
                .list_events(access_token, calendar_id, &query, page_token.as_deref())
                .await?;
            events.extend(page.items);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok((events, page.next_sync_token)),
            }
        }
    }

    async fn store_sync_token(
        &self,
        account_id: &str,
        sync_token: Option<String>,
    ) -> Result<(), AppError> {
        let Some(sync_token) = sync_token else {
            tracing::warn!(account_id, "Event listing returned no sync token");
            return Ok(());
        };
        self.db
            .set_sync_state(&SyncState {
                account_id: account_id.to_string(),
                sync_token,
                updated_at: format_utc_rfc3339(Utc::now()),
            })
            .await
    }
}

fn full_query(now: DateTime<Utc>) -> EventQuery {
    EventQuery::Full {
        time_min: format_utc_rfc3339(now),
    }
}

fn tracked_event(account_id: &str, event: &CalendarEvent) -> TrackedEvent {
    TrackedEvent {
        account_id: account_id.to_string(),
        event_id: event.id.clone(),
        updated: event.updated.clone().unwrap_or_default(),
        summary: event.summary.clone(),
    }
}

/// Classify one changed event against what we last announced.
///
/// Returns `None` for changes the user does not need to hear about.
pub fn classify(event: &CalendarEvent, tracked: Option<&TrackedEvent>) -> Option<EventDelta> {
    let updated = event.updated.clone().unwrap_or_default();

    match tracked {
        Some(tracked) if event.is_cancelled() => {
            Some(EventDelta::Cancelled(summarize(event, Some(tracked))))
        }
        None if event.is_cancelled() => None,
        Some(tracked) if tracked.updated == updated => None,
        Some(tracked) if event.is_invitee() => {
            Some(EventDelta::Updated(summarize(event, Some(tracked))))
        }
        // Removed from the guest list
        Some(tracked) => Some(EventDelta::Cancelled(summarize(event, Some(tracked)))),
        None if event.is_invitee() => Some(EventDelta::NewInvite(summarize(event, None))),
        None => None,
    }
}

/// Chat-facing view of an event. Cancelled events carry little more than
/// their id, so the title falls back to the tracked copy.
pub fn summarize(event: &CalendarEvent, tracked: Option<&TrackedEvent>) -> EventSummary {
    let title = event
        .summary
        .clone()
        .or_else(|| tracked.and_then(|t| t.summary.clone()))
        .unwrap_or_else(|| "(no title)".to_string());

    let when = event.start.as_ref().and_then(|start| {
        if let Some(dt) = start.date_time.as_deref() {
            let formatted = DateTime::parse_from_rfc3339(dt)
                .map(|t| t.format("%a %b %-d, %Y %H:%M").to_string())
                .unwrap_or_else(|_| dt.to_string());
            Some(match start.time_zone.as_deref() {
                Some(tz) => format!("{} ({})", formatted, tz),
                None => formatted,
            })
        } else {
            start.date.as_ref().map(|d| format!("{} (all day)", d))
        }
    });

    let organizer = event.organizer.as_ref().and_then(|o| {
        o.display_name
            .clone()
            .or_else(|| o.email.clone())
    });

    EventSummary {
        event_id: event.id.clone(),
        title,
        when,
        organizer,
        location: event.location.clone(),
        link: event.html_link.clone(),
        updated: event.updated.clone().unwrap_or_default(),
    }
}
