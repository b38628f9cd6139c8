// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! gcal-invites: Google Calendar invite notifications for chat users
//!
//! This crate links chat users' Google accounts under nicknames, keeps their
//! OAuth credentials fresh, maintains calendar watch channels, and turns
//! push notifications into chat messages about invites.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use db::FirestoreDb;
use error::AppError;
use services::{
    AccountLocks, CalendarSync, CommandHandler, ConnectionFlow, GoogleClient, KmsService,
    NotificationDispatcher, Outbox, RenewalScheduler, SubscriptionManager, TokenManager,
    WebhookIngress,
};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub db: FirestoreDb,
    pub tokens: TokenManager,
    pub subscriptions: SubscriptionManager,
    pub ingress: WebhookIngress,
    pub dispatcher: NotificationDispatcher,
    pub connections: ConnectionFlow,
    pub commands: CommandHandler,
    pub scheduler: RenewalScheduler,
}

impl AppState {
    /// Wire all services together.
    ///
    /// Outbound chat messages are sent to `outbox`.
    pub fn build(
        config: Config,
        db: FirestoreDb,
        kms: KmsService,
        outbox: Outbox,
    ) -> Result<Self, AppError> {
        let config = Arc::new(config);
        let google = GoogleClient::new(&config)?;

        let tokens = TokenManager::new(google.clone(), db.clone(), kms);
        let sync = CalendarSync::new(google.clone(), db.clone(), tokens.clone());
        let locks = AccountLocks::new();

        let subscriptions = SubscriptionManager::new(
            config.clone(),
            db.clone(),
            google.clone(),
            tokens.clone(),
            sync.clone(),
            locks.clone(),
        );
        let dispatcher = NotificationDispatcher::new(google.clone(), tokens.clone(), outbox);
        let ingress = WebhookIngress::new(subscriptions.clone(), sync, dispatcher.clone());
        let connections = ConnectionFlow::new(
            config.clone(),
            db.clone(),
            google,
            tokens.clone(),
            subscriptions.clone(),
            locks,
        );
        let commands = CommandHandler::new(
            config.clone(),
            db.clone(),
            connections.clone(),
            subscriptions.clone(),
            dispatcher.clone(),
        );
        let scheduler = RenewalScheduler::new(
            config.clone(),
            db.clone(),
            subscriptions.clone(),
            dispatcher.clone(),
        );

        Ok(Self {
            config,
            db,
            tokens,
            subscriptions,
            ingress,
            dispatcher,
            connections,
            commands,
            scheduler,
        })
    }
}
