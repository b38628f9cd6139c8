// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Background renewal of watch channels.
//!
//! Every tick lists subscriptions expiring inside the renewal window and
//! renews each one independently. A failure only affects its own account:
//! transient errors are retried on the next tick, and after too many
//! consecutive failures (or a revoked grant) the subscription is torn down
//! and the user is asked to re-subscribe. Each tick also sweeps retired
//! channels and purges expired connect links.

use crate::config::Config;
use crate::db::FirestoreDb;
use crate::error::AppError;
use crate::models::Subscription;
use crate::services::notify::NotificationDispatcher;
use crate::services::subscriptions::SubscriptionManager;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Maximum concurrent renewals per tick.
const MAX_CONCURRENT_RENEWALS: usize = 8;

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub renewed: u32,
    /// Failed but left in place for the next tick
    pub failed: u32,
    pub torn_down: u32,
    /// Retired channels stopped or expired
    pub swept: usize,
    /// Expired link requests and abandoned pending accounts deleted
    pub purged: usize,
}

enum Renewal {
    Renewed,
    Failed,
    TornDown,
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the scheduler and wait for the current tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

#[derive(Clone)]
pub struct RenewalScheduler {
    config: Arc<Config>,
    db: FirestoreDb,
    subscriptions: SubscriptionManager,
    dispatcher: NotificationDispatcher,
}

impl RenewalScheduler {
    pub fn new(
        config: Arc<Config>,
        db: FirestoreDb,
        subscriptions: SubscriptionManager,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            config,
            db,
            subscriptions,
            dispatcher,
        }
    }

    /// Spawn the tick loop. The first tick runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let period = self
            .config
            .renewal_interval
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(3600));

        let handle = tokio::spawn(async move {
            tracing::info!(period_secs = period.as_secs(), "Renewal scheduler started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.tick().await;
                        tracing::info!(
                            renewed = report.renewed,
                            failed = report.failed,
                            torn_down = report.torn_down,
                            swept = report.swept,
                            purged = report.purged,
                            "Renewal tick complete"
                        );
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Renewal scheduler stopping");
                        break;
                    }
                }
            }
        });

        SchedulerHandle {
            shutdown_tx,
            handle,
        }
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as if the current time were `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let due = match self
            .db
            .list_subscriptions_expiring_before(now + self.config.renewal_window)
            .await
        {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list subscriptions due for renewal");
                return report;
            }
        };

        let results: Vec<Renewal> = stream::iter(due)
            .map(|sub| async move { self.renew_one(sub).await })
            .buffer_unordered(MAX_CONCURRENT_RENEWALS)
            .collect()
            .await;

        for result in results {
            match result {
                Renewal::Renewed => report.renewed += 1,
                Renewal::Failed => report.failed += 1,
                Renewal::TornDown => report.torn_down += 1,
            }
        }

        report.swept = match self.subscriptions.sweep_retired().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Retired channel sweep failed");
                0
            }
        };

        report.purged = match self.db.purge_expired_links(now - self.config.link_ttl).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Expired link purge failed");
                0
            }
        };

        report
    }

    async fn renew_one(&self, sub: Subscription) -> Renewal {
        let error = match self.subscriptions.renew(&sub).await {
            Ok(_) => return Renewal::Renewed,
            Err(e) => e,
        };

        if matches!(error, AppError::AuthRevoked(_)) {
            tracing::warn!(
                account_id = %sub.account_id,
                channel_id = %sub.channel_id,
                "Renewal failed, authorization revoked"
            );
            self.tear_down(&sub, TeardownReason::Revoked).await;
            return Renewal::TornDown;
        }

        let failures = match self.db.record_renewal_failure(&sub.channel_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, channel_id = %sub.channel_id, "Failed to record renewal failure");
                return Renewal::Failed;
            }
        };

        tracing::warn!(
            error = %error,
            account_id = %sub.account_id,
            channel_id = %sub.channel_id,
            failures,
            "Subscription renewal failed"
        );

        if failures >= self.config.max_renewal_failures {
            self.tear_down(&sub, TeardownReason::TooManyFailures).await;
            return Renewal::TornDown;
        }
        Renewal::Failed
    }

    async fn tear_down(&self, sub: &Subscription, reason: TeardownReason) {
        if let Err(e) = self.subscriptions.tear_down(&sub.account_id).await {
            tracing::error!(error = %e, account_id = %sub.account_id, "Subscription teardown failed");
            return;
        }
        if let Err(e) = self.db.set_needs_resubscribe(&sub.account_id, true).await {
            tracing::warn!(error = %e, account_id = %sub.account_id, "Failed to flag account for re-subscribe");
        }

        let body = match reason {
            TeardownReason::Revoked => format!(
                "Google access for `{0}` was revoked, so invite notifications have stopped. Reconnect with `accounts connect {0}`, then run `subscribe invites {0}`.",
                sub.nickname
            ),
            TeardownReason::TooManyFailures => format!(
                "Invite notifications for `{0}` stopped because the calendar subscription could not be renewed. Run `subscribe invites {0}` to resume.",
                sub.nickname
            ),
        };
        self.dispatcher.notify(&sub.user, body);

        tracing::info!(account_id = %sub.account_id, "Subscription torn down, user notified");
    }
}

#[derive(Clone, Copy)]
enum TeardownReason {
    Revoked,
    TooManyFailures,
}
