// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::http::StatusCode;
use axum::response::IntoResponse;
use gcal_invites::error::AppError;

#[test]
fn test_is_token_error_matches() {
    let err = AppError::Provider(AppError::PROVIDER_TOKEN_ERROR.to_string());
    assert!(err.is_token_error());

    let err = AppError::Provider(format!("{} (401)", AppError::PROVIDER_TOKEN_ERROR));
    assert!(err.is_token_error());
}

#[test]
fn test_is_token_error_no_match() {
    let err = AppError::Provider(AppError::PROVIDER_RATE_LIMIT.to_string());
    assert!(!err.is_token_error());

    let err = AppError::AuthRevoked("invalid_grant".to_string());
    assert!(!err.is_token_error());

    let err = AppError::BadRequest(AppError::PROVIDER_TOKEN_ERROR.to_string());
    assert!(!err.is_token_error());
}

#[test]
fn test_is_transient() {
    assert!(AppError::Transient("timeout".to_string()).is_transient());
    assert!(!AppError::Provider("HTTP 400".to_string()).is_transient());
    assert!(!AppError::AuthRevoked("x".to_string()).is_transient());
}

#[test]
fn test_user_messages_hide_internals() {
    let internal = [
        AppError::Database("permission denied on projects/secret".to_string()),
        AppError::Internal(anyhow::anyhow!("kms key projects/secret")),
        AppError::Provider("HTTP 400: {\"error\": \"secret\"}".to_string()),
        AppError::UnknownChannel("chan-secret".to_string()),
        AppError::Transient("connect to 10.0.0.1 failed".to_string()),
    ];
    for err in internal {
        let message = err.user_message();
        assert!(!message.contains("secret"), "{}", message);
        assert!(!message.contains("10.0.0.1"), "{}", message);
        assert!(!message.is_empty());
    }
}

#[test]
fn test_user_messages_are_actionable() {
    assert!(AppError::AuthRevoked("x".to_string())
        .user_message()
        .contains("accounts connect"));
    assert!(AppError::ExpiredLinkToken
        .user_message()
        .contains("accounts connect"));
    assert!(AppError::DuplicateNickname("work".to_string())
        .user_message()
        .contains("`work`"));
    assert_eq!(
        AppError::BadRequest("Nicknames cannot contain spaces".to_string()).user_message(),
        "Nicknames cannot contain spaces"
    );
}

#[test]
fn test_http_status_mapping() {
    let cases = [
        (AppError::ExpiredLinkToken, StatusCode::GONE),
        (AppError::DuplicateNickname("w".to_string()), StatusCode::CONFLICT),
        (AppError::BadRequest("x".to_string()), StatusCode::BAD_REQUEST),
        (AppError::NotFound("x".to_string()), StatusCode::NOT_FOUND),
        (AppError::InvalidVerificationToken, StatusCode::FORBIDDEN),
        (AppError::Transient("x".to_string()), StatusCode::SERVICE_UNAVAILABLE),
        (AppError::Provider("x".to_string()), StatusCode::BAD_GATEWAY),
        (AppError::Database("x".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (err, status) in cases {
        assert_eq!(err.into_response().status(), status);
    }
}
