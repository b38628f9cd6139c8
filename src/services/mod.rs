// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod chat;
pub mod commands;
pub mod connect;
pub mod google;
pub mod ingress;
pub mod kms;
pub mod locks;
pub mod notify;
pub mod renewal;
pub mod subscriptions;
pub mod sync;
pub mod tokens;

pub use chat::ChatBridge;
pub use commands::{Command, CommandHandler};
pub use connect::ConnectionFlow;
pub use google::GoogleClient;
pub use ingress::{IngressOutcome, Notification, WebhookIngress};
pub use kms::KmsService;
pub use locks::AccountLocks;
pub use notify::{ChatMessage, NotificationDispatcher, Outbox};
pub use renewal::{RenewalScheduler, SchedulerHandle, TickReport};
pub use subscriptions::SubscriptionManager;
pub use sync::CalendarSync;
pub use tokens::TokenManager;
