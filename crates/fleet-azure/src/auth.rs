//! Service-principal authentication
//!
//! Access tokens come from the Microsoft identity platform's client
//! credentials flow and are cached until shortly before they expire.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use fleet_common::{Error, Result};

/// Default identity endpoint
pub const DEFAULT_LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";

/// Scope granting access to Azure Resource Manager
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN_SECS: i64 = 300;

const SUBJECT: &str = "azure credentials";

/// Service-principal credentials and the subscription they act on
#[derive(Clone)]
pub struct AzureCredentials {
    /// Azure AD tenant
    pub tenant_id: String,
    /// Application (client) ID
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Subscription holding the scale sets
    pub subscription_id: String,
}

impl std::fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

impl AzureCredentials {
    /// Read `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET` and
    /// `AZURE_SUBSCRIPTION_ID`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::validation_for_field(SUBJECT, key, format!("{key} is not set")))
        };
        Ok(Self {
            tenant_id: get("AZURE_TENANT_ID")?,
            client_id: get("AZURE_CLIENT_ID")?,
            client_secret: get("AZURE_CLIENT_SECRET")?,
            subscription_id: get("AZURE_SUBSCRIPTION_ID")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

/// Fetches and caches ARM access tokens
pub struct TokenProvider {
    http: reqwest::Client,
    credentials: AzureCredentials,
    login_endpoint: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// Provider for `credentials` against `login_endpoint`
    pub fn new(http: reqwest::Client, credentials: AzureCredentials, login_endpoint: impl Into<String>) -> Self {
        Self {
            http,
            credentials,
            login_endpoint: login_endpoint.into(),
            cached: Mutex::new(None),
        }
    }

    /// A bearer token valid for at least the expiry margin
    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.token.clone());
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_endpoint.trim_end_matches('/'),
            self.credentials.tenant_id
        );
        debug!(tenant = %self.credentials.tenant_id, "requesting access token");

        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("scope", MANAGEMENT_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| Error::cloud(SUBJECT, format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("token request returned {status}: {}", crate::model::error_message(&body));
            return Err(if status.is_server_error() {
                Error::cloud(SUBJECT, message)
            } else {
                Error::cloud_permanent(SUBJECT, message)
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::cloud_permanent(SUBJECT, format!("invalid token response: {e}")))?;
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}
