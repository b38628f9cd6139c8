// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Google OAuth and Calendar API client.
//!
//! Handles:
//! - Authorization code exchange, token refresh and revocation
//! - Calendar lookups (primary calendar, calendar list)
//! - Watch channels (create, stop)
//! - Event listing (full and incremental), event reads and attendee patches
//!
//! Every call is bounded by the configured provider timeout. Failures are
//! classified so callers can tell retriable conditions (`Transient`) from
//! revoked authorization (`AuthRevoked`) and everything else (`Provider`).

use crate::config::{Config, GoogleEndpoints};
use crate::error::AppError;
use serde::{Deserialize, Serialize};

/// Google API client.
#[derive(Clone)]
pub struct GoogleClient {
    http: reqwest::Client,
    endpoints: GoogleEndpoints,
    client_id: String,
    client_secret: String,
}

impl GoogleClient {
    /// Create a client with the OAuth credentials and endpoints from `config`.
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(config.provider_timeout)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoints: config.google.clone(),
            client_id: config.google_client_id.clone(),
            client_secret: config.google_client_secret.clone(),
        })
    }

    /// Consent URL for `accounts connect`.
    ///
    /// Requests offline access and forces the consent prompt so Google
    /// always returns a refresh token, even for previously linked accounts.
    pub fn authorize_url(&self, redirect_uri: &str, scopes: &[String], state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
            self.endpoints.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" ")),
            urlencoding::encode(state)
        )
    }

    // ─── OAuth ───────────────────────────────────────────────────

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, AppError> {
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(|e| transport_error("Token exchange", e))?;

        self.check_token_response(response).await
    }

    /// Refresh an expired access token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, AppError> {
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| transport_error("Token refresh", e))?;

        self.check_token_response(response).await
    }

    /// Revoke a token (and the grant it belongs to).
    pub async fn revoke(&self, token: &str) -> Result<(), AppError> {
        let response = self
            .http
            .post(&self.endpoints.revoke_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| transport_error("Token revocation", e))?;

        check_response(response).await?;
        tracing::info!("Google token revoked");
        Ok(())
    }

    // ─── Calendars ───────────────────────────────────────────────

    /// The account's primary calendar.
    pub async fn get_primary_calendar(&self, access_token: &str) -> Result<Calendar, AppError> {
        let url = format!("{}/calendars/primary", self.endpoints.api_base);
        self.get_json(&url, access_token, &[]).await
    }

    /// All calendars on the account's calendar list.
    pub async fn list_calendars(
        &self,
        access_token: &str,
    ) -> Result<Vec<CalendarListEntry>, AppError> {
        let url = format!("{}/users/me/calendarList", self.endpoints.api_base);
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = Vec::new();
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let page: CalendarListPage = self.get_json(&url, access_token, &query).await?;
            calendars.extend(page.items);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(calendars)
    }

    // ─── Watch Channels ──────────────────────────────────────────

    /// Open a watch channel on a calendar's events.
    pub async fn watch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> Result<WatchResponse, AppError> {
        let url = format!(
            "{}/calendars/{}/events/watch",
            self.endpoints.api_base,
            urlencoding::encode(calendar_id)
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error("Watch request", e))?;

        check_response_json(response).await
    }

    /// Stop a watch channel. Google answers 404 for channels that already
    /// expired or were stopped; that is reported as `NotFound`.
    pub async fn stop_channel(
        &self,
        access_token: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), AppError> {
        let url = format!("{}/channels/stop", self.endpoints.api_base);
        let body = serde_json::json!({
            "id": channel_id,
            "resourceId": resource_id,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Channel stop", e))?;

        check_response(response).await
    }

    // ─── Events ──────────────────────────────────────────────────

    /// Fetch one page of events.
    ///
    /// A `410 Gone` answer to an incremental query means the sync token
    /// expired and is reported as `AppError::Gone`.
    pub async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        query: &EventQuery,
        page_token: Option<&str>,
    ) -> Result<EventPage, AppError> {
        let url = format!(
            "{}/calendars/{}/events",
            self.endpoints.api_base,
            urlencoding::encode(calendar_id)
        );

        let mut params = vec![("maxResults", "250".to_string())];
        match query {
            EventQuery::Incremental { sync_token } => {
                params.push(("syncToken", sync_token.clone()));
            }
            EventQuery::Full { time_min } => {
                params.push(("timeMin", time_min.clone()));
                params.push(("showDeleted", "false".to_string()));
            }
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        self.get_json(&url, access_token, &params).await
    }

    /// Get a single event.
    pub async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<CalendarEvent, AppError> {
        self.get_json(&self.event_url(calendar_id, event_id), access_token, &[])
            .await
    }

    /// Replace an event's attendee list.
    pub async fn patch_attendees(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        attendees: &[Attendee],
    ) -> Result<CalendarEvent, AppError> {
        let body = serde_json::json!({ "attendees": attendees });

        let response = self
            .http
            .patch(self.event_url(calendar_id, event_id))
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Event patch", e))?;

        check_response_json(response).await
    }

    fn event_url(&self, calendar_id: &str, event_id: &str) -> String {
        format!(
            "{}/calendars/{}/events/{}",
            self.endpoints.api_base,
            urlencoding::encode(calendar_id),
            urlencoding::encode(event_id)
        )
    }

    /// Generic GET request with JSON response.
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<T, AppError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error("GET request", e))?;

        check_response_json(response).await
    }

    /// Parse a token endpoint response.
    ///
    /// `invalid_grant` means the refresh token (or code) is no longer valid
    /// and the user has to reconnect.
    async fn check_token_response(
        &self,
        response: reqwest::Response,
    ) -> Result<TokenResponse, AppError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| AppError::Provider(format!("Failed to parse token response: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        let oauth_error = serde_json::from_str::<OAuthErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_default();

        if oauth_error == "invalid_grant" {
            return Err(AppError::AuthRevoked(
                "Google rejected the refresh token (invalid_grant)".to_string(),
            ));
        }

        tracing::warn!(status = %status, error = %oauth_error, "Google token endpoint error");
        Err(classify_status(status, &body))
    }
}

/// Map a reqwest transport failure (connect, timeout, body) to `Transient`.
fn transport_error(what: &str, e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Transient(format!("{} timed out", what))
    } else {
        AppError::Transient(format!("{} failed: {}", what, e))
    }
}

/// Classify a non-success HTTP status.
fn classify_status(status: reqwest::StatusCode, body: &str) -> AppError {
    match status.as_u16() {
        401 => AppError::Provider(AppError::PROVIDER_TOKEN_ERROR.to_string()),
        404 => AppError::NotFound(format!("Google resource ({})", status)),
        410 => AppError::Gone(format!("Google resource ({})", status)),
        429 => {
            tracing::warn!("Google rate limit hit (429)");
            AppError::Transient(AppError::PROVIDER_RATE_LIMIT.to_string())
        }
        s if s >= 500 => AppError::Transient(format!("HTTP {}", status)),
        _ => AppError::Provider(format!("HTTP {}: {}", status, body)),
    }
}

/// Check response status and return error if not successful.
async fn check_response(response: reqwest::Response) -> Result<(), AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

/// Check response and parse JSON body.
async fn check_response_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, AppError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::Provider(format!("JSON parse error: {}", e)))
}

#[derive(Debug, Default, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: String,
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Lifetime in seconds
    pub expires_in: i64,
    /// Only present on code exchange (and rarely on refresh)
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Space separated granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }
}

/// `GET calendars/{id}` response (subset).
#[derive(Debug, Clone, Deserialize)]
pub struct Calendar {
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, rename = "timeZone")]
    pub time_zone: Option<String>,
}

/// Calendar list entry (subset).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarListEntry {
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub summary_override: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub access_role: Option<String>,
}

impl CalendarListEntry {
    /// Name as the user sees it in Google Calendar.
    pub fn display_name(&self) -> &str {
        self.summary_override
            .as_deref()
            .or(self.summary.as_deref())
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListPage {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// `events.watch` request body.
#[derive(Debug, Clone, Serialize)]
pub struct WatchRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub address: String,
    pub token: String,
    pub params: WatchParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchParams {
    /// Requested lifetime in seconds; Google may shorten it
    pub ttl: String,
}

impl WatchRequest {
    pub fn web_hook(channel_id: &str, address: &str, token: &str, ttl_secs: i64) -> Self {
        Self {
            id: channel_id.to_string(),
            kind: "web_hook",
            address: address.to_string(),
            token: token.to_string(),
            params: WatchParams {
                ttl: ttl_secs.to_string(),
            },
        }
    }
}

/// `events.watch` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    pub id: String,
    pub resource_id: String,
    /// Expiry in milliseconds since the epoch, as a decimal string
    #[serde(default)]
    pub expiration: Option<String>,
}

impl WatchResponse {
    pub fn expires_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(chrono::DateTime::from_timestamp_millis)
    }
}

/// Which events to list.
#[derive(Debug, Clone)]
pub enum EventQuery {
    /// Changes since the sync token was issued
    Incremental { sync_token: String },
    /// Everything from `time_min` on (establishes a new sync token)
    Full { time_min: String },
}

/// One page of `events.list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    #[serde(default)]
    pub items: Vec<CalendarEvent>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    /// Only on the last page
    #[serde(default)]
    pub next_sync_token: Option<String>,
}

/// Calendar event (subset).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub start: Option<EventDateTime>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub html_link: Option<String>,
    #[serde(default)]
    pub organizer: Option<Person>,
    #[serde(default)]
    pub attendees: Vec<Attendee>,
}

impl CalendarEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }

    /// The attendee entry of the calendar owner, if invited.
    pub fn self_attendee(&self) -> Option<&Attendee> {
        self.attendees.iter().find(|a| a.is_self)
    }

    /// Whether the calendar owner is an invitee (attendee, not organizer).
    pub fn is_invitee(&self) -> bool {
        let organizer_is_self = self.organizer.as_ref().is_some_and(|o| o.is_self);
        !organizer_is_self && self.self_attendee().is_some_and(|a| !a.organizer)
    }
}

/// Start or end of an event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    #[serde(default)]
    pub date_time: Option<String>,
    /// All-day events
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

/// Organizer / creator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "self")]
    pub is_self: bool,
}

/// Event attendee. Unknown fields are kept so a patch writes them back
/// unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, rename = "self", skip_serializing)]
    pub is_self: bool,
    #[serde(default, skip_serializing)]
    pub organizer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
