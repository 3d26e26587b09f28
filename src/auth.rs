use std::sync::Arc;

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

const TOKEN_URL: &str = "https://wbsapi.withings.net/v2/oauth2";

/// Refresh this long before the access token actually expires. Withings
/// rotates the refresh token on every grant, so an expired access token
/// mid-batch would cost an extra round trip at best.
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    status: i64,
    body: Option<TokenBody>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// Withings OAuth2 token manager. Holds the rotating refresh token and a
/// cached access token; clones share state so one refresh serves every
/// handle.
#[derive(Clone)]
pub struct WithingsAuth {
    client: Client,
    client_id: String,
    client_secret: String,
    refresh_token: Arc<Mutex<String>>,
    cached_token: Arc<Mutex<Option<CachedToken>>>,
}

impl WithingsAuth {
    pub fn new(client_id: String, client_secret: String, refresh_token: String) -> Self {
        Self {
            client: Client::new(),
            client_id,
            client_secret,
            refresh_token: Arc::new(Mutex::new(refresh_token)),
            cached_token: Arc::new(Mutex::new(None)),
        }
    }

    /// Current refresh token. Callers persisting credentials should read
    /// this after a sync, since Withings rotates it on every refresh.
    pub async fn current_refresh_token(&self) -> String {
        self.refresh_token.lock().await.clone()
    }

    pub async fn get_access_token(&self) -> Result<String> {
        {
            let cached = self.cached_token.lock().await;
            if let Some(ref token) = *cached {
                if token.expires_at
                    > chrono::Utc::now() + chrono::Duration::seconds(REFRESH_MARGIN_SECS)
                {
                    return Ok(token.access_token.clone());
                }
            }
        }

        self.refresh_access_token().await
    }

    async fn refresh_access_token(&self) -> Result<String> {
        let refresh_token = self.refresh_token.lock().await.clone();

        let resp = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("action", "requesttoken"),
                ("grant_type", "refresh_token"),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("refresh_token", &refresh_token),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Token refresh failed: {} - {}", status, body));
        }

        let envelope: TokenEnvelope = resp.json().await?;
        if envelope.status != 0 {
            return Err(anyhow!(
                "Token refresh rejected: status {} - {}",
                envelope.status,
                envelope.error.unwrap_or_default()
            ));
        }
        let body = envelope
            .body
            .ok_or_else(|| anyhow!("Token refresh response missing body"))?;

        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(body.expires_in);

        // The old refresh token is dead as soon as this grant succeeds
        *self.refresh_token.lock().await = body.refresh_token;

        let access_token = body.access_token.clone();
        *self.cached_token.lock().await = Some(CachedToken {
            access_token: body.access_token,
            expires_at,
        });

        Ok(access_token)
    }
}
