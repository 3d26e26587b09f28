use chrono::{Days, Utc};
use tokio_util::sync::CancellationToken;

use scale_sync::garmin::{GarminCredentials, GarminSession};
use scale_sync::sync;
use scale_sync::withings::WithingsClient;

fn withings_client() -> Option<WithingsClient> {
    dotenvy::dotenv().ok();
    let client_id = std::env::var("WITHINGS_CLIENT_ID").ok()?;
    let client_secret = std::env::var("WITHINGS_CLIENT_SECRET").ok()?;
    let refresh_token = std::env::var("WITHINGS_REFRESH_TOKEN").ok()?;
    Some(WithingsClient::new(scale_sync::auth::WithingsAuth::new(
        client_id,
        client_secret,
        refresh_token,
    )))
}

async fn garmin_session() -> Option<GarminSession> {
    dotenvy::dotenv().ok();
    let email = std::env::var("GARMIN_EMAIL").ok()?;
    let password = std::env::var("GARMIN_PASSWORD").ok()?;
    let token_path = std::env::temp_dir().join("scale-sync-garmin-tokens.json");
    GarminSession::connect(&GarminCredentials { email, password }, &token_path)
        .await
        .ok()
}

#[tokio::test]
async fn fetch_measurements_descending() {
    let Some(client) = withings_client() else {
        eprintln!("skipping fetch_measurements_descending: no credentials");
        return;
    };

    let end = Utc::now();
    let start = end.checked_sub_days(Days::new(30)).unwrap();
    let measurements = client.get_measurements(start, end).await.unwrap();

    // Newest first, every reading carries at least one syncable field
    assert!(measurements.windows(2).all(|w| w[0].date >= w[1].date));
    assert!(measurements.iter().all(|m| m.has_data()));
}

#[tokio::test]
async fn snapshot_and_last_entry_agree() {
    let Some(session) = garmin_session().await else {
        eprintln!("skipping snapshot_and_last_entry_agree: no credentials");
        return;
    };

    let today = Utc::now().date_naive();
    let start = today.checked_sub_days(Days::new(13)).unwrap();

    let snapshot = sync::build_snapshot(&session, start, today).await.unwrap();
    let last = sync::find_last_entry_date(&session, today, 14).await;

    match last {
        Some(day) => assert!(snapshot.contains_key(&day)),
        None => assert!(snapshot.is_empty()),
    }
}

#[tokio::test]
async fn full_sync_converges() {
    let (Some(client), Some(session)) = (withings_client(), garmin_session().await) else {
        eprintln!("skipping full_sync_converges: no credentials");
        return;
    };

    let end = Utc::now();
    let start = end.checked_sub_days(Days::new(7)).unwrap();
    let measurements = client.get_measurements(start, end).await.unwrap();
    if measurements.is_empty() {
        eprintln!("skipping full_sync_converges: no source measurements this week");
        return;
    }

    let snapshot = sync::build_snapshot(&session, start.date_naive(), end.date_naive())
        .await
        .unwrap();
    let classified = sync::classify(&measurements, &snapshot, &Utc);

    let cancel = CancellationToken::new();
    let results = sync::sync_measurements(&session, &classified.new, &Utc, &cancel).await;
    assert_eq!(results.len(), classified.new.len());

    // Re-running immediately must upload nothing new
    let again = sync::sync_measurements(&session, &classified.new, &Utc, &cancel).await;
    assert!(again.iter().all(|r| r.is_skipped_duplicate() || !r.success));
}
