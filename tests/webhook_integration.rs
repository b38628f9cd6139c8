// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Integration tests for webhook handling.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{
    cancelled, invite, mount_full_listing, mount_incremental, mount_stop, mount_watch, TestApp,
};
use gcal_invites::models::Subscription;
use gcal_invites::services::{IngressOutcome, Notification};
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

/// Connect alice's `work` account and subscribe with an empty calendar.
async fn subscribed_app() -> (TestApp, Subscription) {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    mount_stop(&app.google).await;
    let sub = app.state.subscriptions.subscribe(&account).await.unwrap();
    (app, sub)
}

fn exists(sub: &Subscription) -> Notification {
    Notification {
        channel_id: sub.channel_id.clone(),
        resource_state: "exists".to_string(),
        channel_token: Some(sub.verification_token.clone()),
    }
}

#[tokio::test]
async fn test_new_invite_is_dispatched_once() {
    let (mut app, sub) = subscribed_app().await;
    mount_incremental(
        &app.google,
        "cal-work",
        "sync-1",
        json!([invite("ev1", "Design review", "2026-10-19T09:00:00Z")]),
        "sync-2",
    )
    .await;
    // Redelivery after the token advanced: same event, unchanged
    mount_incremental(
        &app.google,
        "cal-work",
        "sync-2",
        json!([invite("ev1", "Design review", "2026-10-19T09:00:00Z")]),
        "sync-3",
    )
    .await;

    let outcome = app.state.ingress.handle_notification(&exists(&sub)).await.unwrap();
    assert_eq!(
        outcome,
        IngressOutcome::Processed {
            dispatched: 1,
            resynced: false
        }
    );

    let messages = app.drain_outbox();
    let invite_messages: Vec<_> = messages.iter().filter(|m| m.body.contains("New invite")).collect();
    assert_eq!(invite_messages.len(), 1);
    let message = invite_messages[0];
    assert_eq!(message.user, "alice");
    assert!(message.body.contains("Design review"));
    assert!(message.body.contains("(work)"));
    assert_eq!(message.actions.len(), 3);
    assert!(message.actions.iter().all(|a| a.event_id == "ev1" && a.nickname == "work"));

    let outcome = app.state.ingress.handle_notification(&exists(&sub)).await.unwrap();
    assert_eq!(
        outcome,
        IngressOutcome::Processed {
            dispatched: 0,
            resynced: false
        }
    );
    assert!(app.drain_outbox().is_empty());
}

#[tokio::test]
async fn test_simultaneous_deliveries_dispatch_once() {
    let (mut app, sub) = subscribed_app().await;
    // Slow first page so both deliveries are in flight together
    Mock::given(method("GET"))
        .and(path("/calendar/v3/calendars/cal-work/events"))
        .and(query_param("syncToken", "sync-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "kind": "calendar#events",
                    "items": [invite("ev1", "Design review", "2026-10-19T09:00:00Z")],
                    "nextSyncToken": "sync-2"
                }))
                .set_delay(std::time::Duration::from_millis(150)),
        )
        .mount(&app.google)
        .await;
    mount_incremental(
        &app.google,
        "cal-work",
        "sync-2",
        json!([invite("ev1", "Design review", "2026-10-19T09:00:00Z")]),
        "sync-3",
    )
    .await;

    let notification = exists(&sub);
    let (first, second) = tokio::join!(
        app.state.ingress.handle_notification(&notification),
        app.state.ingress.handle_notification(&notification),
    );

    let dispatched: Vec<usize> = [first.unwrap(), second.unwrap()]
        .into_iter()
        .map(|outcome| match outcome {
            IngressOutcome::Processed { dispatched, .. } => dispatched,
            other => panic!("unexpected outcome {:?}", other),
        })
        .collect();
    assert_eq!(dispatched.iter().sum::<usize>(), 1);

    let messages = app.drain_outbox();
    let invites: Vec<_> = messages.iter().filter(|m| m.body.contains("Design review")).collect();
    assert_eq!(invites.len(), 1);
}

#[tokio::test]
async fn test_update_and_cancellation() {
    let (mut app, sub) = subscribed_app().await;
    mount_incremental(
        &app.google,
        "cal-work",
        "sync-1",
        json!([invite("ev1", "Planning", "2026-10-19T09:00:00Z")]),
        "sync-2",
    )
    .await;
    mount_incremental(
        &app.google,
        "cal-work",
        "sync-2",
        json!([invite("ev1", "Planning (moved)", "2026-10-19T11:00:00Z")]),
        "sync-3",
    )
    .await;
    mount_incremental(&app.google, "cal-work", "sync-3", json!([cancelled("ev1")]), "sync-4").await;

    for _ in 0..3 {
        app.state.ingress.handle_notification(&exists(&sub)).await.unwrap();
    }

    let bodies: Vec<String> = app.drain_outbox().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies.len(), 3);
    assert!(bodies[0].starts_with("New invite"));
    assert!(bodies[1].contains("Planning (moved)"));
    assert!(!bodies[1].starts_with("New invite"));
    assert!(bodies[2].contains("Planning (moved)"), "cancellation names the event");

    assert!(app
        .state
        .db
        .get_tracked_event(&sub.account_id, "ev1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_cancellation_of_unknown_event_is_silent() {
    let (mut app, sub) = subscribed_app().await;
    mount_incremental(&app.google, "cal-work", "sync-1", json!([cancelled("other")]), "sync-2").await;

    let outcome = app.state.ingress.handle_notification(&exists(&sub)).await.unwrap();
    assert_eq!(
        outcome,
        IngressOutcome::Processed {
            dispatched: 0,
            resynced: false
        }
    );
    assert!(app.drain_outbox().is_empty());
}

#[tokio::test]
async fn test_own_events_are_ignored() {
    let (mut app, sub) = subscribed_app().await;
    let own = json!({
        "id": "mine",
        "status": "confirmed",
        "summary": "Focus time",
        "updated": "2026-10-19T09:00:00Z",
        "organizer": { "email": "me@example.com", "self": true },
        "attendees": [{ "email": "me@example.com", "self": true, "organizer": true }]
    });
    mount_incremental(&app.google, "cal-work", "sync-1", json!([own]), "sync-2").await;

    app.state.ingress.handle_notification(&exists(&sub)).await.unwrap();
    assert!(app.drain_outbox().is_empty());
}

#[tokio::test]
async fn test_expired_sync_token_triggers_resync() {
    let (mut app, sub) = subscribed_app().await;

    // ev1 was known before the token expired; ev2 is new
    app.state
        .db
        .put_tracked_event(&gcal_invites::models::TrackedEvent {
            account_id: sub.account_id.clone(),
            event_id: "ev1".to_string(),
            updated: "2026-10-18T09:00:00Z".to_string(),
            summary: Some("Old".to_string()),
        })
        .await
        .unwrap();

    // Drop the baseline listing mounted by subscribed_app
    app.google.reset().await;
    Mock::given(method("GET"))
        .and(path("/calendar/v3/calendars/cal-work/events"))
        .and(query_param("syncToken", "sync-1"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&app.google)
        .await;
    mount_full_listing(
        &app.google,
        "cal-work",
        json!([
            invite("ev1", "Old", "2026-10-18T09:00:00Z"),
            invite("ev2", "Brand new", "2026-10-19T09:00:00Z")
        ]),
        "sync-fresh",
    )
    .await;

    let outcome = app.state.ingress.handle_notification(&exists(&sub)).await.unwrap();
    assert_eq!(
        outcome,
        IngressOutcome::Processed {
            dispatched: 1,
            resynced: true
        }
    );

    let messages = app.drain_outbox();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].body.contains("Brand new"));

    let sync = app.state.db.get_sync_state(&sub.account_id).await.unwrap().unwrap();
    assert_eq!(sync.sync_token, "sync-fresh");
}

#[tokio::test]
async fn test_unknown_channel() {
    let (mut app, sub) = subscribed_app().await;
    let mut notification = exists(&sub);
    notification.channel_id = "nope".to_string();

    let outcome = app.state.ingress.handle_notification(&notification).await.unwrap();
    assert_eq!(outcome, IngressOutcome::UnknownChannel);
    assert!(app.drain_outbox().is_empty());
}

#[tokio::test]
async fn test_superseded_channel_is_unknown() {
    let (mut app, old) = subscribed_app().await;
    let new = app.state.subscriptions.renew(&old).await.unwrap();

    let outcome = app.state.ingress.handle_notification(&exists(&old)).await.unwrap();
    assert_eq!(outcome, IngressOutcome::UnknownChannel);

    // The old token does not work on the new channel either
    let mut forged = exists(&new);
    forged.channel_token = Some(old.verification_token.clone());
    let outcome = app.state.ingress.handle_notification(&forged).await.unwrap();
    assert_eq!(outcome, IngressOutcome::InvalidToken);
    assert!(app.drain_outbox().is_empty());
}

#[tokio::test]
async fn test_invalid_or_missing_token() {
    let (app, sub) = subscribed_app().await;
    // Any listing would be a bug
    Mock::given(method("GET"))
        .and(path("/calendar/v3/calendars/cal-work/events"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&app.google)
        .await;

    let mut notification = exists(&sub);
    notification.channel_token = Some("wrong".to_string());
    assert_eq!(
        app.state.ingress.handle_notification(&notification).await.unwrap(),
        IngressOutcome::InvalidToken
    );

    notification.channel_token = None;
    assert_eq!(
        app.state.ingress.handle_notification(&notification).await.unwrap(),
        IngressOutcome::InvalidToken
    );
}

#[tokio::test]
async fn test_sync_handshake_does_not_pull() {
    let (app, sub) = subscribed_app().await;
    Mock::given(method("GET"))
        .and(path("/calendar/v3/calendars/cal-work/events"))
        .and(query_param("syncToken", "sync-1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&app.google)
        .await;

    let mut notification = exists(&sub);
    notification.resource_state = "sync".to_string();
    assert_eq!(
        app.state.ingress.handle_notification(&notification).await.unwrap(),
        IngressOutcome::Handshake
    );
}

#[tokio::test]
async fn test_webhook_route_always_acks() {
    let (app, sub) = subscribed_app().await;
    mount_incremental(&app.google, "cal-work", "sync-1", json!([]), "sync-2").await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("X-Goog-Channel-ID", &sub.channel_id)
                .header("X-Goog-Resource-State", "exists")
                .header("X-Goog-Channel-Token", &sub.verification_token)
                .header("X-Goog-Message-Number", "2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown channel and bad token are acknowledged too
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("X-Goog-Channel-ID", "unknown")
                .header("X-Goog-Resource-State", "exists")
                .header("X-Goog-Channel-Token", "bogus")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Even without any Google headers
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_webhook_route_processes_in_background() {
    let (mut app, sub) = subscribed_app().await;
    mount_incremental(
        &app.google,
        "cal-work",
        "sync-1",
        json!([invite("ev9", "Offsite", "2026-10-19T09:00:00Z")]),
        "sync-2",
    )
    .await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("X-Goog-Channel-ID", &sub.channel_id)
                .header("X-Goog-Resource-State", "exists")
                .header("X-Goog-Channel-Token", &sub.verification_token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let message = tokio::time::timeout(std::time::Duration::from_secs(5), app.outbox.recv())
        .await
        .expect("no chat message")
        .expect("outbox closed");
    assert!(message.body.contains("Offsite"));
}
