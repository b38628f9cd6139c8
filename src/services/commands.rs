//! Typed chat commands.
//!
//! The chat transport parses user input into a [`Command`] and sends the
//! returned text back to the user. Every failure becomes a short message;
//! internal details only go to the log.

use crate::config::Config;
use crate::db::FirestoreDb;
use crate::error::AppError;
use crate::models::{Macro, MacroScope, ResponseStatus};
use crate::services::connect::ConnectionFlow;
use crate::services::notify::NotificationDispatcher;
use crate::services::subscriptions::SubscriptionManager;
use serde::Deserialize;
use std::sync::Arc;

/// A chat command, already parsed.
///
/// The chat bridge sends these as JSON tagged by `command`, e.g.
/// `{"command": "subscribe_invites", "nickname": "work"}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    AccountsConnect { nickname: String },
    AccountsDisconnect { nickname: String },
    AccountsList,
    ListCalendars { nickname: String },
    SubscribeInvites { nickname: String },
    UnsubscribeInvites { nickname: String },
    /// Button press on a new invite
    Respond {
        nickname: String,
        event_id: String,
        status: ResponseStatus,
    },
    MacroCreate {
        scope: MacroScope,
        #[serde(default)]
        is_conv: bool,
        name: String,
        message: String,
    },
    MacroRun { scope: MacroScope, name: String },
    MacroList { scope: MacroScope },
    MacroRemove { scope: MacroScope, name: String },
}

#[derive(Clone)]
pub struct CommandHandler {
    config: Arc<Config>,
    db: FirestoreDb,
    connections: ConnectionFlow,
    subscriptions: SubscriptionManager,
    dispatcher: NotificationDispatcher,
}

impl CommandHandler {
    pub fn new(
        config: Arc<Config>,
        db: FirestoreDb,
        connections: ConnectionFlow,
        subscriptions: SubscriptionManager,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            config,
            db,
            connections,
            subscriptions,
            dispatcher,
        }
    }

    /// Run a command for `user` and produce the reply text.
    pub async fn execute(&self, user: &str, command: Command) -> String {
        match self.run(user, command).await {
            Ok(reply) => reply,
            Err(e) => {
                if matches!(e, AppError::Database(_) | AppError::Internal(_) | AppError::Provider(_)) {
                    tracing::error!(error = %e, user, "Command failed");
                } else {
                    tracing::debug!(error = %e, user, "Command rejected");
                }
                e.user_message()
            }
        }
    }

    async fn run(&self, user: &str, command: Command) -> Result<String, AppError> {
        match command {
            Command::AccountsConnect { nickname } => {
                let url = self.connections.start_link(user, &nickname).await?;
                Ok(format!(
                    "Open this link within {} minutes to connect your Google account as `{}`:\n{}",
                    self.config.link_ttl.num_minutes(),
                    nickname,
                    url
                ))
            }
            Command::AccountsDisconnect { nickname } => {
                self.connections.disconnect(user, &nickname).await?;
                Ok(format!("Disconnected `{}`.", nickname))
            }
            Command::AccountsList => self.list_accounts(user).await,
            Command::ListCalendars { nickname } => {
                let calendars = self.connections.list_calendars(user, &nickname).await?;
                if calendars.is_empty() {
                    return Ok(format!("No calendars found for `{}`.", nickname));
                }
                let lines: Vec<String> = calendars
                    .iter()
                    .map(|c| {
                        if c.primary {
                            format!("- {} (primary)", c.display_name())
                        } else {
                            format!("- {}", c.display_name())
                        }
                    })
                    .collect();
                Ok(format!("Calendars for `{}`:\n{}", nickname, lines.join("\n")))
            }
            Command::SubscribeInvites { nickname } => {
                let account = self.connections.connected_account(user, &nickname).await?;
                self.subscriptions.subscribe(&account).await?;
                Ok(format!(
                    "Subscribed to invites for `{}`. New invites will show up here.",
                    nickname
                ))
            }
            Command::UnsubscribeInvites { nickname } => {
                let account = self
                    .db
                    .get_account(user, &nickname)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("Account {}", nickname)))?;
                self.subscriptions.unsubscribe(&account).await?;
                Ok(format!("Unsubscribed from invites for `{}`.", nickname))
            }
            Command::Respond {
                nickname,
                event_id,
                status,
            } => {
                let account = self.connections.connected_account(user, &nickname).await?;
                self.dispatcher
                    .record_response(&account, &event_id, status)
                    .await?;
                Ok(format!("Responded \"{}\" to the invite.", status.label()))
            }
            Command::MacroCreate {
                scope,
                is_conv,
                name,
                message,
            } => {
                let created = self
                    .db
                    .create_macro(&Macro {
                        scope_name: scope.name_for(is_conv).to_string(),
                        is_conv,
                        name: name.clone(),
                        message,
                    })
                    .await?;
                Ok(if created {
                    format!("Created macro `{}`.", name)
                } else {
                    format!("Updated macro `{}`.", name)
                })
            }
            Command::MacroRun { scope, name } => match self.db.get_macro(&scope, &name).await? {
                Some(m) => Ok(m.message),
                None => Ok(format!("No macro named `{}`.", name)),
            },
            Command::MacroList { scope } => {
                let macros = self.db.list_macros(&scope).await?;
                if macros.is_empty() {
                    return Ok("No macros defined here.".to_string());
                }
                let names: Vec<String> = macros
                    .iter()
                    .map(|m| {
                        if m.is_conv {
                            format!("- {} (this conversation)", m.name)
                        } else {
                            format!("- {}", m.name)
                        }
                    })
                    .collect();
                Ok(names.join("\n"))
            }
            Command::MacroRemove { scope, name } => {
                if self.db.remove_macro(&scope, &name).await? {
                    Ok(format!("Removed macro `{}`.", name))
                } else {
                    Ok(format!("No macro named `{}`.", name))
                }
            }
        }
    }

    async fn list_accounts(&self, user: &str) -> Result<String, AppError> {
        let accounts = self.db.list_accounts(user).await?;
        let lines: Vec<String> = accounts
            .iter()
            .filter(|a| a.state != crate::models::ConnectionState::Pending)
            .map(|a| {
                let status = if !a.is_connected() {
                    "disconnected from Google, reconnect with `accounts connect`".to_string()
                } else if a.active_channel_id.is_some() {
                    "subscribed to invites".to_string()
                } else if a.needs_resubscribe {
                    format!("invites paused, run `subscribe invites {}`", a.nickname)
                } else {
                    "connected".to_string()
                };
                format!("- {} ({})", a.nickname, status)
            })
            .collect();

        if lines.is_empty() {
            return Ok("No connected accounts. Use `accounts connect <nickname>` to add one.".to_string());
        }
        Ok(format!("Your accounts:\n{}", lines.join("\n")))
    }
}
