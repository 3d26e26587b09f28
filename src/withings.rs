use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;

use crate::auth::WithingsAuth;
use crate::models::SourceMeasurement;

const MEASURE_URL: &str = "https://wbsapi.withings.net/measure";

// Withings measure type codes
const TYPE_WEIGHT: i64 = 1;
const TYPE_FAT_FREE_MASS: i64 = 5;
const TYPE_FAT_RATIO: i64 = 6;
const TYPE_FAT_MASS_WEIGHT: i64 = 8;
const TYPE_DIASTOLIC: i64 = 9;
const TYPE_SYSTOLIC: i64 = 10;
const TYPE_HEART_PULSE: i64 = 11;
const TYPE_MUSCLE_MASS: i64 = 76;
const TYPE_HYDRATION: i64 = 77;
const TYPE_BONE_MASS: i64 = 88;

/// Client for the Withings measure API — the source of truth for dated
/// health readings.
#[derive(Clone)]
pub struct WithingsClient {
    client: Client,
    pub auth: WithingsAuth,
}

impl WithingsClient {
    pub fn new(auth: WithingsAuth) -> Self {
        Self {
            client: Client::new(),
            auth,
        }
    }

    /// Get all measurements in the date range, newest first.
    ///
    /// Each Withings measure group becomes one `SourceMeasurement`; groups
    /// carrying none of the fields we sync are dropped here so the engine
    /// only ever sees meaningful readings.
    pub async fn get_measurements(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SourceMeasurement>> {
        let token = self.auth.get_access_token().await?;

        let meastypes = format!(
            "{TYPE_WEIGHT},{TYPE_FAT_FREE_MASS},{TYPE_FAT_RATIO},{TYPE_FAT_MASS_WEIGHT},\
             {TYPE_DIASTOLIC},{TYPE_SYSTOLIC},{TYPE_HEART_PULSE},{TYPE_MUSCLE_MASS},\
             {TYPE_HYDRATION},{TYPE_BONE_MASS}"
        );

        let resp = self
            .client
            .post(MEASURE_URL)
            .bearer_auth(&token)
            .form(&[
                ("action", "getmeas"),
                ("meastypes", &meastypes),
                ("category", "1"),
                ("startdate", &start.timestamp().to_string()),
                ("enddate", &end.timestamp().to_string()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("getmeas failed: {} - {}", status, body));
        }

        let data: Value = resp.json().await?;
        let status = data.get("status").and_then(|v| v.as_i64()).unwrap_or(-1);
        if status != 0 {
            return Err(anyhow!("getmeas rejected: status {} - {}", status, data));
        }

        let mut measurements = Vec::new();

        if let Some(groups) = data
            .pointer("/body/measuregrps")
            .and_then(|v| v.as_array())
        {
            for group in groups {
                if let Some(m) = parse_measure_group(group) {
                    measurements.push(m);
                }
            }
        }

        measurements.sort_by_key(|m| std::cmp::Reverse(m.date));
        Ok(measurements)
    }
}

/// Parse one measure group into a `SourceMeasurement`. Returns `None` for
/// malformed groups and for groups with no syncable field set.
fn parse_measure_group(group: &Value) -> Option<SourceMeasurement> {
    let epoch = group.get("date").and_then(|v| v.as_i64())?;
    let date = Utc.timestamp_opt(epoch, 0).single()?;

    let mut m = SourceMeasurement::empty(date);

    if let Some(measures) = group.get("measures").and_then(|v| v.as_array()) {
        for measure in measures {
            let value = measure.get("value").and_then(|v| v.as_i64());
            let unit = measure.get("unit").and_then(|v| v.as_i64());
            let mtype = measure.get("type").and_then(|v| v.as_i64());
            let (Some(value), Some(unit), Some(mtype)) = (value, unit, mtype) else {
                continue;
            };

            // Real value is value * 10^unit (unit is typically negative)
            let real = value as f64 * 10f64.powi(unit as i32);

            match mtype {
                TYPE_WEIGHT => m.weight = Some(real),
                TYPE_FAT_RATIO => m.fat_ratio = Some(real),
                TYPE_FAT_FREE_MASS => m.fat_free_mass = Some(real),
                TYPE_FAT_MASS_WEIGHT => m.fat_mass_weight = Some(real),
                TYPE_BONE_MASS => m.bone_mass = Some(real),
                TYPE_MUSCLE_MASS => m.muscle_mass = Some(real),
                TYPE_HYDRATION => m.hydration = Some(real),
                TYPE_SYSTOLIC => m.systolic = Some(real),
                TYPE_DIASTOLIC => m.diastolic = Some(real),
                TYPE_HEART_PULSE => m.heart_pulse = Some(real),
                _ => {}
            }
        }
    }

    m.has_data().then_some(m)
}
