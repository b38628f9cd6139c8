// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Inbound chat commands from the chat bridge.

use crate::services::Command;
use crate::AppState;
use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/chat/command", post(run_command))
}

#[derive(Deserialize)]
pub struct CommandRequest {
    /// Chat username the command came from
    pub user: String,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Serialize)]
pub struct CommandReply {
    pub reply: String,
}

/// Run one command and return the text to show the user.
///
/// Command failures are part of the reply, not an HTTP error.
async fn run_command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandReply> {
    tracing::debug!(user = %request.user, command = ?request.command, "Chat command");
    let reply = state.commands.execute(&request.user, request.command).await;
    Json(CommandReply { reply })
}
