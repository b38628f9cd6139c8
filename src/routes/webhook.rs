// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook route for Google Calendar push notifications.

use crate::services::ingress::Notification;
use crate::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use std::sync::Arc;

/// Webhook routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(handle_notification))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Handle a push notification (POST).
///
/// Always answers 200 right away; Google retries anything else with
/// backoff and eventually stops delivering. The actual work runs in a
/// spawned task.
async fn handle_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> StatusCode {
    let Some(channel_id) = header(&headers, "x-goog-channel-id") else {
        tracing::warn!("Webhook call without channel id, ignoring");
        return StatusCode::OK;
    };

    let notification = Notification {
        channel_id,
        resource_state: header(&headers, "x-goog-resource-state").unwrap_or_default(),
        channel_token: header(&headers, "x-goog-channel-token"),
    };

    tracing::debug!(
        channel_id = %notification.channel_id,
        resource_state = %notification.resource_state,
        message_number = header(&headers, "x-goog-message-number").as_deref().unwrap_or(""),
        "Webhook notification received"
    );

    tokio::spawn(async move {
        if let Err(e) = state.ingress.handle_notification(&notification).await {
            tracing::error!(
                error = %e,
                channel_id = %notification.channel_id,
                "Failed to process calendar notification"
            );
        }
    });

    StatusCode::OK
}
