// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Google OAuth callback for `accounts connect`.

use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/oauth/callback", get(oauth_callback))
}

/// Query parameters from Google's redirect.
#[derive(Deserialize)]
pub struct CallbackParams {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
}

/// Finish linking the account named in the signed `state` parameter.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Html<String>> {
    if let Some(error) = params.error {
        tracing::info!(error = %error, "User declined Google authorization");
        return Err(AppError::BadRequest(format!(
            "Google authorization was not granted ({}). Run `accounts connect` again to retry.",
            error
        )));
    }

    let link_token = params
        .state
        .ok_or_else(|| AppError::BadRequest("Missing state parameter".to_string()))?;
    let code = params
        .code
        .ok_or_else(|| AppError::BadRequest("Missing authorization code".to_string()))?;

    let account = state
        .connections
        .handle_callback(&link_token, &code)
        .await?;

    state.dispatcher.notify(
        &account.user,
        format!(
            "Connected your Google account as `{}`. Run `subscribe invites {}` to get notified about new invites.",
            account.nickname, account.nickname
        ),
    );

    Ok(Html(page(&format!(
        "Your Google account is now connected as <b>{}</b>. You can close this window and return to chat.",
        html_escape(&account.nickname)
    ))))
}

fn page(body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Calendar connected</title></head><body><p>{}</p></body></html>",
        body
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
