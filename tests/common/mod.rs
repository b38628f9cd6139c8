// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use chrono::{Duration, Utc};
use gcal_invites::config::{Config, GoogleEndpoints};
use gcal_invites::db::FirestoreDb;
use gcal_invites::models::Account;
use gcal_invites::routes::create_router;
use gcal_invites::services::{ChatMessage, KmsService};
use gcal_invites::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Config whose Google endpoints all point at `server`.
#[allow(dead_code)]
pub fn test_config(server: &MockServer) -> Config {
    let base = server.uri();
    Config {
        google: GoogleEndpoints {
            auth_url: format!("{}/o/oauth2/v2/auth", base),
            token_url: format!("{}/token", base),
            revoke_url: format!("{}/revoke", base),
            api_base: format!("{}/calendar/v3", base),
        },
        provider_timeout: std::time::Duration::from_secs(5),
        ..Config::test_default()
    }
}

/// A wired application against an in-memory store and a mock Google.
#[allow(dead_code)]
pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: axum::Router,
    pub google: MockServer,
    pub outbox: mpsc::UnboundedReceiver<ChatMessage>,
}

#[allow(dead_code)]
impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Build with tweaks applied to the test config.
    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let google = MockServer::start().await;
        let mut config = test_config(&google);
        tweak(&mut config);

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(
            AppState::build(config, FirestoreDb::new_in_memory(), KmsService::new_mock(), tx)
                .expect("Failed to build app state"),
        );

        Self {
            router: create_router(state.clone()),
            state,
            google,
            outbox: rx,
        }
    }

    /// Run `accounts connect` and the OAuth callback for `user`/`nickname`.
    ///
    /// The account's primary calendar id is `cal-<nickname>`, and Google
    /// issues `access-<nickname>` / `refresh-<nickname>` valid for
    /// `expires_in` seconds.
    pub async fn connect_with_expiry(&self, user: &str, nickname: &str, expires_in: i64) -> Account {
        let code = format!("code-{}-{}", user, nickname);
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains(format!("code={}", code).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": format!("access-{}", nickname),
                "refresh_token": format!("refresh-{}", nickname),
                "expires_in": expires_in,
                "scope": "https://www.googleapis.com/auth/calendar.readonly https://www.googleapis.com/auth/calendar.events",
                "token_type": "Bearer"
            })))
            .mount(&self.google)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendar/v3/calendars/primary"))
            .and(wiremock::matchers::header(
                "authorization",
                format!("Bearer access-{}", nickname).as_str(),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": format!("cal-{}", nickname),
                "summary": "Primary",
                "timeZone": "America/Los_Angeles"
            })))
            .mount(&self.google)
            .await;

        let url = self
            .state
            .connections
            .start_link(user, nickname)
            .await
            .expect("start_link failed");
        let link_token = state_param(&url).expect("consent URL has no state");

        self.state
            .connections
            .handle_callback(&link_token, &code)
            .await
            .expect("OAuth callback failed")
    }

    pub async fn connect(&self, user: &str, nickname: &str) -> Account {
        self.connect_with_expiry(user, nickname, 3600).await
    }

    /// Messages queued for chat so far.
    pub fn drain_outbox(&mut self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        while let Ok(m) = self.outbox.try_recv() {
            messages.push(m);
        }
        messages
    }
}

/// Extract the `state` query parameter from a consent URL.
#[allow(dead_code)]
pub fn state_param(url: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let value = pair.strip_prefix("state=")?;
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}

/// Google accepts watch requests, echoing the requested channel id.
#[allow(dead_code)]
pub async fn mount_watch(server: &MockServer) {
    mount_watch_with_delay(server, std::time::Duration::ZERO).await;
}

#[allow(dead_code)]
pub async fn mount_watch_with_delay(server: &MockServer, delay: std::time::Duration) {
    Mock::given(method("POST"))
        .and(path_regex(r"^/calendar/v3/calendars/[^/]+/events/watch$"))
        .respond_with(move |req: &Request| watch_response(req).set_delay(delay))
        .mount(server)
        .await;
}

/// Build a successful `events.watch` answer for `req`.
#[allow(dead_code)]
pub fn watch_response(req: &Request) -> ResponseTemplate {
    let body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
    let expiration = (Utc::now() + Duration::days(7)).timestamp_millis();
    ResponseTemplate::new(200).set_body_json(json!({
        "kind": "api#channel",
        "id": body["id"],
        "resourceId": format!("res-{}", body["id"].as_str().unwrap_or("")),
        "resourceUri": "https://www.googleapis.com/calendar/v3/calendars/primary/events",
        "expiration": expiration.to_string()
    }))
}

/// Google accepts channel stop calls.
#[allow(dead_code)]
pub async fn mount_stop(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/calendar/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

/// Full listing for `calendar_id` (no sync token in the query).
#[allow(dead_code)]
pub async fn mount_full_listing(
    server: &MockServer,
    calendar_id: &str,
    items: Value,
    next_sync_token: &str,
) {
    Mock::given(method("GET"))
        .and(path(format!("/calendar/v3/calendars/{}/events", calendar_id)))
        .and(wiremock::matchers::query_param_is_missing("syncToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kind": "calendar#events",
            "items": items,
            "nextSyncToken": next_sync_token
        })))
        .mount(server)
        .await;
}

/// Incremental listing for `calendar_id` starting at `sync_token`.
#[allow(dead_code)]
pub async fn mount_incremental(
    server: &MockServer,
    calendar_id: &str,
    sync_token: &str,
    items: Value,
    next_sync_token: &str,
) {
    Mock::given(method("GET"))
        .and(path(format!("/calendar/v3/calendars/{}/events", calendar_id)))
        .and(wiremock::matchers::query_param("syncToken", sync_token))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kind": "calendar#events",
            "items": items,
            "nextSyncToken": next_sync_token
        })))
        .mount(server)
        .await;
}

/// An event on which the calendar owner is a guest.
#[allow(dead_code)]
pub fn invite(id: &str, summary: &str, updated: &str) -> Value {
    json!({
        "id": id,
        "status": "confirmed",
        "summary": summary,
        "updated": updated,
        "htmlLink": format!("https://calendar.google.com/event?eid={}", id),
        "start": { "dateTime": "2026-11-03T10:00:00-08:00", "timeZone": "America/Los_Angeles" },
        "organizer": { "email": "boss@example.com", "displayName": "The Boss" },
        "attendees": [
            { "email": "boss@example.com", "organizer": true, "responseStatus": "accepted" },
            { "email": "me@example.com", "self": true, "responseStatus": "needsAction" }
        ]
    })
}

/// A cancelled event as it appears in an incremental listing.
#[allow(dead_code)]
pub fn cancelled(id: &str) -> Value {
    json!({ "id": id, "status": "cancelled" })
}
