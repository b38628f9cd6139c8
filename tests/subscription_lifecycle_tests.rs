// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Subscribe / renew / unsubscribe against a mocked Google Calendar.

mod common;

use common::{invite, mount_full_listing, mount_stop, mount_watch, mount_watch_with_delay, TestApp};
use gcal_invites::error::AppError;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn test_subscribe_activates_channel_and_baselines() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;

    mount_full_listing(
        &app.google,
        "cal-work",
        json!([invite("ev1", "Standup", "2026-10-18T10:00:00Z")]),
        "sync-1",
    )
    .await;
    mount_watch(&app.google).await;

    let sub = app.state.subscriptions.subscribe(&account).await.unwrap();
    assert_eq!(sub.account_id, account.id());
    assert_eq!(sub.calendar_id, "cal-work");
    assert!(!sub.verification_token.is_empty());
    assert_ne!(sub.channel_id, sub.verification_token);

    let stored = app.state.db.get_account_by_id(&account.id()).await.unwrap().unwrap();
    assert_eq!(stored.active_channel_id.as_deref(), Some(sub.channel_id.as_str()));

    // Existing invites are tracked but not announced
    assert!(app
        .state
        .db
        .get_tracked_event(&account.id(), "ev1")
        .await
        .unwrap()
        .is_some());
    let sync = app.state.db.get_sync_state(&account.id()).await.unwrap().unwrap();
    assert_eq!(sync.sync_token, "sync-1");

    let (resolved, _) = app
        .state
        .subscriptions
        .resolve_by_channel_id(&sub.channel_id)
        .await
        .unwrap();
    assert_eq!(resolved.channel_id, sub.channel_id);
}

#[tokio::test]
async fn test_subscribe_twice_is_rejected() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;

    app.state.subscriptions.subscribe(&account).await.unwrap();
    let err = app.state.subscriptions.subscribe(&account).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadySubscribed(n) if n == "work"));
}

#[tokio::test]
async fn test_subscribe_requires_connected_account() {
    let app = TestApp::new().await;
    let mut account = app.connect("alice", "work").await;
    account.nickname = "personal".to_string();

    let err = app.state.subscriptions.subscribe(&account).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_watch_failure_leaves_no_subscription() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    Mock::given(method("POST"))
        .and(path_regex(r"/events/watch$"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&app.google)
        .await;

    let err = app.state.subscriptions.subscribe(&account).await.unwrap_err();
    assert!(err.is_transient());

    let stored = app.state.db.get_account_by_id(&account.id()).await.unwrap().unwrap();
    assert!(stored.active_channel_id.is_none());
}

#[tokio::test]
async fn test_renew_swaps_channels() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    Mock::given(method("POST"))
        .and(path("/calendar/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&app.google)
        .await;

    let old = app.state.subscriptions.subscribe(&account).await.unwrap();
    let new = app.state.subscriptions.renew(&old).await.unwrap();

    assert_ne!(new.channel_id, old.channel_id);
    assert_ne!(new.verification_token, old.verification_token);
    assert!(new.expires_at_utc() >= old.expires_at_utc());

    assert!(matches!(
        app.state.subscriptions.resolve_by_channel_id(&old.channel_id).await,
        Err(AppError::UnknownChannel(_))
    ));
    app.state
        .subscriptions
        .resolve_by_channel_id(&new.channel_id)
        .await
        .unwrap();

    // The old channel was stopped, so nothing is left to sweep
    assert!(app.state.db.list_retired_channels().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_renew_of_superseded_channel_is_noop() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    mount_stop(&app.google).await;

    let old = app.state.subscriptions.subscribe(&account).await.unwrap();
    let new = app.state.subscriptions.renew(&old).await.unwrap();

    let again = app.state.subscriptions.renew(&old).await.unwrap();
    assert_eq!(again.channel_id, new.channel_id);
}

#[tokio::test]
async fn test_concurrent_renewals_open_one_channel() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_stop(&app.google).await;
    Mock::given(method("POST"))
        .and(path_regex(r"/events/watch$"))
        .respond_with(common::watch_response)
        // subscribe + exactly one renewal
        .expect(2)
        .mount(&app.google)
        .await;

    let old = app.state.subscriptions.subscribe(&account).await.unwrap();

    let a = {
        let subs = app.state.subscriptions.clone();
        let old = old.clone();
        tokio::spawn(async move { subs.renew(&old).await })
    };
    let b = {
        let subs = app.state.subscriptions.clone();
        let old = old.clone();
        tokio::spawn(async move { subs.renew(&old).await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_eq!(a.channel_id, b.channel_id);

    let stored = app.state.db.get_account_by_id(&account.id()).await.unwrap().unwrap();
    assert_eq!(stored.active_channel_id.as_deref(), Some(a.channel_id.as_str()));
}

#[tokio::test]
async fn test_old_channel_stays_live_until_swap() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_stop(&app.google).await;
    mount_watch(&app.google).await;

    let old = app.state.subscriptions.subscribe(&account).await.unwrap();

    // Slow down the renewal's watch call
    app.google.reset().await;
    mount_stop(&app.google).await;
    mount_watch_with_delay(&app.google, Duration::from_millis(300)).await;

    let renewal = {
        let subs = app.state.subscriptions.clone();
        let old = old.clone();
        tokio::spawn(async move { subs.renew(&old).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Mid-renewal the old channel still routes
    app.state
        .subscriptions
        .resolve_by_channel_id(&old.channel_id)
        .await
        .unwrap();

    let new = renewal.await.unwrap().unwrap();
    assert!(app
        .state
        .subscriptions
        .resolve_by_channel_id(&old.channel_id)
        .await
        .is_err());
    app.state
        .subscriptions
        .resolve_by_channel_id(&new.channel_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    mount_stop(&app.google).await;

    let sub = app.state.subscriptions.subscribe(&account).await.unwrap();
    app.state.subscriptions.unsubscribe(&account).await.unwrap();
    app.state.subscriptions.unsubscribe(&account).await.unwrap();

    assert!(matches!(
        app.state.subscriptions.resolve_by_channel_id(&sub.channel_id).await,
        Err(AppError::UnknownChannel(_))
    ));
    let stored = app.state.db.get_account_by_id(&account.id()).await.unwrap().unwrap();
    assert!(stored.active_channel_id.is_none());

    // Subscribing again works after an unsubscribe
    let again = app.state.subscriptions.subscribe(&account).await.unwrap();
    assert_ne!(again.channel_id, sub.channel_id);
}

#[tokio::test]
async fn test_failed_stop_is_swept_later() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    Mock::given(method("POST"))
        .and(path("/calendar/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&app.google)
        .await;
    mount_stop(&app.google).await;

    app.state.subscriptions.subscribe(&account).await.unwrap();
    app.state.subscriptions.unsubscribe(&account).await.unwrap();
    assert_eq!(app.state.db.list_retired_channels().await.unwrap().len(), 1);

    assert_eq!(app.state.subscriptions.sweep_retired().await.unwrap(), 1);
    assert!(app.state.db.list_retired_channels().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_of_expired_channel_counts_as_stopped() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    Mock::given(method("POST"))
        .and(path("/calendar/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&app.google)
        .await;

    app.state.subscriptions.subscribe(&account).await.unwrap();
    app.state.subscriptions.unsubscribe(&account).await.unwrap();
    assert!(app.state.db.list_retired_channels().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disconnect_keeps_account_until_channel_stopped() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    Mock::given(method("POST"))
        .and(path("/calendar/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&app.google)
        .await;

    let sub = app.state.subscriptions.subscribe(&account).await.unwrap();

    let err = app
        .state
        .connections
        .disconnect("alice", "work")
        .await
        .unwrap_err();
    assert!(err.is_transient());

    // Still live at Google, so nothing that could stop it is thrown away
    assert!(app.state.db.get_account_by_id(&account.id()).await.unwrap().is_some());
    assert!(app.state.db.get_credential(&account.id()).await.unwrap().is_some());
    let retired = app.state.db.list_retired_channels().await.unwrap();
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].channel_id, sub.channel_id);

    // Google recovers; the sweep really stops the channel
    app.google.reset().await;
    Mock::given(method("POST"))
        .and(path("/calendar/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&app.google)
        .await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&app.google)
        .await;

    assert_eq!(app.state.subscriptions.sweep_retired().await.unwrap(), 1);
    assert!(app.state.db.list_retired_channels().await.unwrap().is_empty());

    app.state.connections.disconnect("alice", "work").await.unwrap();
    assert!(app.state.db.get_account_by_id(&account.id()).await.unwrap().is_none());
    assert!(app.state.db.get_credential(&account.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_sweep_keeps_channel_without_credential() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    Mock::given(method("POST"))
        .and(path("/calendar/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&app.google)
        .await;

    app.state.subscriptions.subscribe(&account).await.unwrap();
    app.state.subscriptions.unsubscribe(&account).await.unwrap();
    assert_eq!(app.state.db.list_retired_channels().await.unwrap().len(), 1);

    // No token can be had any more
    app.state.db.delete_account(&account.id()).await.unwrap();
    app.state.tokens.evict(&account.id());

    Mock::given(method("POST"))
        .and(path("/calendar/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&app.google)
        .await;

    assert_eq!(app.state.subscriptions.sweep_retired().await.unwrap(), 0);
    assert_eq!(app.state.db.list_retired_channels().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_disconnect_with_revoked_grant_lets_channel_expire() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    Mock::given(method("POST"))
        .and(path("/calendar/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&app.google)
        .await;

    app.state.subscriptions.subscribe(&account).await.unwrap();
    app.state.subscriptions.unsubscribe(&account).await.unwrap();
    assert_eq!(app.state.db.list_retired_channels().await.unwrap().len(), 1);

    // The user revoked access at Google and the access token has run out
    app.state.tokens.evict(&account.id());
    app.google.reset().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&app.google)
        .await;
    let mut credential = app.state.db.get_credential(&account.id()).await.unwrap().unwrap();
    credential.expires_at = "2026-01-01T00:00:00Z".to_string();
    app.state
        .db
        .store_refreshed_credential(&account.id(), &credential)
        .await
        .unwrap();

    app.state.connections.disconnect("alice", "work").await.unwrap();
    assert!(app.state.db.get_account_by_id(&account.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_renew_racing_disconnect_leaves_nothing_behind() {
    let app = TestApp::new().await;
    let account = app.connect("alice", "work").await;
    mount_full_listing(&app.google, "cal-work", json!([]), "sync-1").await;
    mount_watch(&app.google).await;
    mount_stop(&app.google).await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&app.google)
        .await;

    let old = app.state.subscriptions.subscribe(&account).await.unwrap();

    app.google.reset().await;
    mount_stop(&app.google).await;
    mount_watch_with_delay(&app.google, Duration::from_millis(100)).await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&app.google)
        .await;

    let (renewed, disconnected) = tokio::join!(
        app.state.subscriptions.renew(&old),
        app.state.connections.disconnect("alice", "work"),
    );
    disconnected.unwrap();

    assert!(app.state.db.get_account_by_id(&account.id()).await.unwrap().is_none());
    assert!(app.state.db.get_subscription(&old.channel_id).await.unwrap().is_none());
    if let Ok(new) = renewed {
        assert!(app.state.db.get_subscription(&new.channel_id).await.unwrap().is_none());
    }
    assert!(app.state.db.list_retired_channels().await.unwrap().is_empty());
}
