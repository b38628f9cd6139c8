//! Application configuration loaded from environment variables.
//!
//! Secrets arrive as environment variables (Cloud Run secret bindings or a
//! local `.env` file) and are read once at startup.

use chrono::Duration;
use std::env;

/// Default OAuth scopes: read calendars and set invite response status.
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/calendar.readonly",
    "https://www.googleapis.com/auth/calendar.events",
];

/// Where account, subscription and macro data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    /// Firestore in the given GCP project (`firestore://<project>`).
    Firestore { project_id: String },
    /// Process-local storage (`memory://`), for tests and local runs.
    Memory,
}

impl StorageTarget {
    /// Parse a `DATABASE_URL` style connection string.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        if let Some(project) = url.strip_prefix("firestore://") {
            let project_id = project.trim_end_matches('/');
            if project_id.is_empty() {
                return Err(ConfigError::Invalid("DATABASE_URL", url.to_string()));
            }
            return Ok(Self::Firestore {
                project_id: project_id.to_string(),
            });
        }
        if url == "memory://" {
            return Ok(Self::Memory);
        }
        Err(ConfigError::Invalid("DATABASE_URL", url.to_string()))
    }
}

/// Google endpoints. Overridden in tests to point at a mock server.
#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub api_base: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            api_base: "https://www.googleapis.com/calendar/v3".to_string(),
        }
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Environment Variables (non-sensitive) ---
    /// Google OAuth client ID (public)
    pub google_client_id: String,
    /// Scopes requested during `accounts connect`
    pub google_scopes: Vec<String>,
    /// Externally reachable base URL (webhook + OAuth redirect)
    pub public_base_url: String,
    /// Storage backend
    pub storage: StorageTarget,
    /// GCP region of the KMS key ring
    pub gcp_region: String,
    /// KMS key used to encrypt OAuth tokens
    pub kms_key_name: String,
    /// Server port
    pub port: u16,
    /// Optional HTTP endpoint that delivers outbound chat messages
    pub chat_bridge_url: Option<String>,
    /// Google endpoints
    pub google: GoogleEndpoints,

    // --- Lifecycle tuning ---
    /// Subscriptions expiring within this window are renewed
    pub renewal_window: Duration,
    /// Time between scheduler ticks
    pub renewal_interval: Duration,
    /// Requested watch channel lifetime (Google caps it at 7 days)
    pub channel_ttl: Duration,
    /// Lifetime of an unfinished `accounts connect` link
    pub link_ttl: Duration,
    /// Upper bound on any single Google API call
    pub provider_timeout: std::time::Duration,
    /// Consecutive renewal failures before a subscription is torn down
    pub max_renewal_failures: u32,

    // --- Secrets ---
    /// Google OAuth client secret
    pub google_client_secret: String,
    /// HMAC key for OAuth state (link token) signatures
    pub oauth_state_key: Vec<u8>,
    /// Bearer token the chat bridge presents on `/chat/command`.
    /// The route rejects everything when unset.
    pub chat_bridge_secret: Option<String>,
}

impl Config {
    /// Config for tests only.
    pub fn test_default() -> Self {
        Self {
            google_client_id: "test_client_id".to_string(),
            google_scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            public_base_url: "https://bot.example.com".to_string(),
            storage: StorageTarget::Memory,
            gcp_region: "us-west1".to_string(),
            kms_key_name: "token-encryption".to_string(),
            port: 8080,
            chat_bridge_url: None,
            google: GoogleEndpoints::default(),
            renewal_window: Duration::hours(24),
            renewal_interval: Duration::hours(1),
            channel_ttl: Duration::days(7),
            link_ttl: Duration::minutes(10),
            provider_timeout: std::time::Duration::from_secs(30),
            max_renewal_failures: 3,
            google_client_secret: "test_secret".to_string(),
            oauth_state_key: b"test_state_key_32_bytes_minimum!".to_vec(),
            chat_bridge_secret: Some("test_bridge_secret".to_string()),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let storage = StorageTarget::parse(
            &env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
        )?;

        let google_scopes = env::var("GOOGLE_SCOPES")
            .map(|v| {
                v.split([',', ' '])
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|_| DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect());

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .map_err(|_| ConfigError::Missing("PUBLIC_BASE_URL"))?
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            google_client_id: env::var("GOOGLE_CLIENT_ID")
                .map_err(|_| ConfigError::Missing("GOOGLE_CLIENT_ID"))?,
            google_scopes,
            public_base_url,
            storage,
            gcp_region: env::var("GCP_REGION").unwrap_or_else(|_| "us-west1".to_string()),
            kms_key_name: env::var("KMS_KEY_NAME")
                .unwrap_or_else(|_| "token-encryption".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            chat_bridge_url: env::var("CHAT_BRIDGE_URL").ok().filter(|v| !v.is_empty()),
            google: GoogleEndpoints::default(),

            renewal_window: Duration::seconds(secs_var("RENEWAL_WINDOW_SECS", 24 * 3600)?),
            renewal_interval: Duration::seconds(secs_var("RENEWAL_INTERVAL_SECS", 3600)?),
            channel_ttl: Duration::seconds(secs_var("CHANNEL_TTL_SECS", 7 * 24 * 3600)?),
            link_ttl: Duration::seconds(secs_var("LINK_TTL_SECS", 600)?),
            provider_timeout: std::time::Duration::from_secs(
                secs_var("PROVIDER_TIMEOUT_SECS", 30)? as u64,
            ),
            max_renewal_failures: env::var("MAX_RENEWAL_FAILURES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),

            google_client_secret: env::var("GOOGLE_CLIENT_SECRET")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("GOOGLE_CLIENT_SECRET"))?,
            oauth_state_key: env::var("OAUTH_STATE_KEY")
                .map_err(|_| ConfigError::Missing("OAUTH_STATE_KEY"))?
                .into_bytes(),
            chat_bridge_secret: env::var("CHAT_BRIDGE_SECRET")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }

    /// Address Google pushes watch notifications to.
    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.public_base_url)
    }

    /// OAuth redirect URI registered with Google.
    pub fn oauth_redirect_url(&self) -> String {
        format!("{}/oauth/callback", self.public_base_url)
    }
}

/// Read a positive number of seconds, falling back to `default` when unset.
fn secs_var(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    match env::var(name) {
        Ok(v) => match v.trim().parse::<i64>() {
            Ok(secs) if secs > 0 => Ok(secs),
            _ => Err(ConfigError::Invalid(name, v)),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
