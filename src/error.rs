// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Refresh token rejected by Google; the account must be reconnected.
    #[error("Authorization revoked: {0}")]
    AuthRevoked(String),

    /// Network failure, timeout, rate limit or 5xx from Google.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Non-retriable provider error (4xx other than auth).
    #[error("Google API error: {0}")]
    Provider(String),

    #[error("Nickname already in use: {0}")]
    DuplicateNickname(String),

    #[error("Already subscribed: {0}")]
    AlreadySubscribed(String),

    #[error("Link token expired or already used")]
    ExpiredLinkToken,

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Provider answered 410 Gone (expired sync token, deleted event).
    #[error("Resource gone: {0}")]
    Gone(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Invalid verification token")]
    InvalidVerificationToken,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Marker included in provider errors caused by a rejected access token.
    pub const PROVIDER_TOKEN_ERROR: &'static str = "Access token rejected";

    /// Marker included in provider errors caused by rate limiting.
    pub const PROVIDER_RATE_LIMIT: &'static str = "Rate limit exceeded";

    /// Whether the operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }

    /// Whether Google rejected the access token used for an API call.
    pub fn is_token_error(&self) -> bool {
        matches!(self, AppError::Provider(msg) if msg.contains(Self::PROVIDER_TOKEN_ERROR))
    }

    /// Short, actionable text for chat users. Never includes storage or
    /// provider details.
    pub fn user_message(&self) -> String {
        match self {
            AppError::AuthRevoked(_) => {
                "That account is disconnected from Google, please reconnect it with `accounts connect`."
                    .to_string()
            }
            AppError::Transient(_) => {
                "Google Calendar is not responding right now, please try again in a few minutes."
                    .to_string()
            }
            AppError::DuplicateNickname(nickname) => format!(
                "You already have an account connected as `{}`. Pick another nickname or disconnect it first.",
                nickname
            ),
            AppError::AlreadySubscribed(nickname) => {
                format!("You are already subscribed to invites for `{}`.", nickname)
            }
            AppError::ExpiredLinkToken => {
                "That connection link has expired, please run `accounts connect` again.".to_string()
            }
            AppError::NotFound(_) => {
                "No connected account with that nickname. See `accounts list`.".to_string()
            }
            AppError::EventNotFound(_) | AppError::Gone(_) => {
                "That event no longer exists, nothing to respond to.".to_string()
            }
            AppError::BadRequest(msg) => msg.clone(),
            AppError::Provider(_)
            | AppError::UnknownChannel(_)
            | AppError::InvalidVerificationToken
            | AppError::Database(_)
            | AppError::Internal(_) => {
                "Something went wrong on our side, please try again later.".to_string()
            }
        }
    }
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::ExpiredLinkToken => (
                StatusCode::GONE,
                "link_expired",
                Some("Link expired, please retry `accounts connect` from chat".to_string()),
            ),
            AppError::DuplicateNickname(nickname) => (
                StatusCode::CONFLICT,
                "duplicate_nickname",
                Some(format!("Nickname {} is already connected", nickname)),
            ),
            AppError::AlreadySubscribed(_) => (StatusCode::CONFLICT, "already_subscribed", None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            AppError::UnknownChannel(_) | AppError::EventNotFound(_) | AppError::Gone(_) => {
                (StatusCode::NOT_FOUND, "not_found", None)
            }
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone()))
            }
            AppError::InvalidVerificationToken => (StatusCode::FORBIDDEN, "forbidden", None),
            AppError::AuthRevoked(_) => (StatusCode::UNAUTHORIZED, "auth_revoked", None),
            AppError::Transient(msg) => {
                tracing::warn!(error = %msg, "Transient provider error");
                (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable", None)
            }
            AppError::Provider(msg) => {
                tracing::warn!(error = %msg, "Google API error");
                (StatusCode::BAD_GATEWAY, "provider_error", None)
            }
            AppError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
