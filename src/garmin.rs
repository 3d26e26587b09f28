use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::models::RawWeighIn;
use crate::sync::{DayQuery, RecordSink};

const CONNECT_URL: &str = "https://connect.garmin.com";
const SSO_URL: &str = "https://sso.garmin.com/sso";

/// The opaque token pair Garmin hands out at login. Persisted as JSON so
/// a session survives across process runs; the blobs are never
/// interpreted, only replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokens {
    pub oauth1_token: String,
    pub oauth2_token: String,
}

impl SessionTokens {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading session tokens from {}", path.display()))?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("writing session tokens to {}", path.display()))?;
        Ok(())
    }
}

/// Garmin Connect credentials for the full-login fallback.
#[derive(Debug, Clone)]
pub struct GarminCredentials {
    pub email: String,
    pub password: String,
}

/// An authenticated Garmin Connect session: the destination side of the
/// sync. One of these is constructed per sync operation and passed into
/// the snapshot builder, locator, and upload driver.
pub struct GarminSession {
    client: Client,
    tokens: SessionTokens,
}

impl GarminSession {
    /// Establish a session: restore the persisted token pair if it still
    /// works, otherwise fall back to a fresh login and save the new pair.
    pub async fn connect(
        credentials: &GarminCredentials,
        token_path: &Path,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .cookie_store(true)
            .build()
            .map_err(anyhow::Error::from)?;

        if let Ok(tokens) = SessionTokens::load(token_path) {
            let session = Self {
                client: client.clone(),
                tokens,
            };
            match session.validate().await {
                Ok(()) => {
                    debug!("restored garmin session from saved tokens");
                    return Ok(session);
                }
                Err(err) => {
                    warn!(error = %err, "saved garmin session invalid, re-authenticating");
                }
            }
        }

        let session = Self::login(client, credentials).await?;
        if let Err(err) = session.tokens.save(token_path) {
            warn!(error = %err, "could not persist garmin session tokens");
        }
        Ok(session)
    }

    /// Build a session from an already-validated token pair. Used by
    /// callers that manage persistence themselves.
    pub fn from_tokens(tokens: SessionTokens) -> Result<Self, SyncError> {
        let client = Client::builder()
            .cookie_store(true)
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(Self { client, tokens })
    }

    async fn login(client: Client, credentials: &GarminCredentials) -> Result<Self, SyncError> {
        let resp = client
            .post(format!("{SSO_URL}/signin"))
            .query(&[("service", CONNECT_URL), ("gauthHost", SSO_URL)])
            .form(&[
                ("username", credentials.email.as_str()),
                ("password", credentials.password.as_str()),
                ("embed", "false"),
            ])
            .send()
            .await
            .map_err(anyhow::Error::from)?;

        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            return Err(SyncError::Authentication(
                "garmin rejected the supplied credentials".to_string(),
            ));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Provider(anyhow!(
                "SSO signin failed: {} - {}",
                status,
                body
            )));
        }

        let body = resp.text().await.map_err(anyhow::Error::from)?;
        let ticket = extract_ticket(&body).ok_or_else(|| {
            SyncError::Authentication("no service ticket in garmin SSO response".to_string())
        })?;

        let resp = client
            .post(format!("{CONNECT_URL}/modern/di-oauth/exchange"))
            .form(&[("ticket", ticket.as_str())])
            .send()
            .await
            .map_err(anyhow::Error::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Provider(anyhow!(
                "ticket exchange failed: {} - {}",
                status,
                body
            )));
        }

        let exchange: Value = resp.json().await.map_err(anyhow::Error::from)?;
        let oauth2 = exchange
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SyncError::Authentication("ticket exchange returned no access token".to_string())
            })?;

        Ok(Self {
            client,
            tokens: SessionTokens {
                oauth1_token: ticket,
                oauth2_token: oauth2.to_string(),
            },
        })
    }

    /// Cheap authenticated call to prove the restored tokens still work.
    async fn validate(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!(
                "{CONNECT_URL}/userprofile-service/socialProfile"
            ))
            .bearer_auth(&self.tokens.oauth2_token)
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            return Err(anyhow!("session tokens expired"));
        }
        if !resp.status().is_success() {
            return Err(anyhow!("profile check failed: {}", resp.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl DayQuery for GarminSession {
    async fn day_entries(&self, day: NaiveDate) -> Result<Vec<RawWeighIn>> {
        let url = format!(
            "{CONNECT_URL}/weight-service/weight/dayview/{}",
            day.format("%Y-%m-%d")
        );

        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.tokens.oauth2_token)
            .send()
            .await?;

        // A day with no data is a valid answer
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            return Err(anyhow!("garmin session no longer authorized"));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("dayview {} failed: {} - {}", day, status, body));
        }

        let data: Value = resp.json().await?;
        Ok(parse_day_view(&data))
    }
}

#[async_trait]
impl RecordSink for GarminSession {
    async fn upload_fit(&self, bytes: Vec<u8>) -> Result<bool> {
        let part = Part::bytes(bytes)
            .file_name("weigh_in.fit")
            .mime_str("application/octet-stream")?;
        let form = Form::new().part("file", part);

        let resp = self
            .client
            .post(format!("{CONNECT_URL}/upload-service/upload/.fit"))
            .bearer_auth(&self.tokens.oauth2_token)
            .multipart(form)
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            return Err(anyhow!("garmin session no longer authorized"));
        }

        // The core only cares about truthy success, not the import detail
        Ok(resp.status().is_success())
    }
}

/// Pull the SSO service ticket out of the signin response body.
fn extract_ticket(body: &str) -> Option<String> {
    let start = body.find("ticket=")? + "ticket=".len();
    let rest = &body[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .unwrap_or(rest.len());
    let ticket = &rest[..end];
    (!ticket.is_empty()).then(|| ticket.to_string())
}

/// Parse the dayview payload into raw entries, preserving provider
/// order. Entries without a weight or timestamp are dropped.
fn parse_day_view(data: &Value) -> Vec<RawWeighIn> {
    let Some(list) = data.get("dateWeightList").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|entry| {
            let weight_grams = entry.get("weight").and_then(|v| v.as_f64())?;
            let timestamp_millis = entry.get("date").and_then(|v| v.as_i64())?;
            Some(RawWeighIn {
                weight_grams,
                timestamp_millis,
                body_fat: entry.get("bodyFat").and_then(|v| v.as_f64()),
                muscle_mass_grams: entry.get("muscleMass").and_then(|v| v.as_f64()),
            })
        })
        .collect()
}
