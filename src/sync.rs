//! The reconciliation core: decides which source measurements are new on
//! the destination and drives the serial, rate-limited upload loop.
//!
//! Everything here is either pure (day keys, classification, range
//! validation) or generic over the [`DayQuery`]/[`RecordSink`] traits so
//! the algorithms can be tested without a live Garmin session.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::fit;
use crate::models::{Classified, DayRecord, RawWeighIn, Snapshot, SourceMeasurement, SyncResult};

/// Two weight readings closer than this are the same reading. Unit
/// conversions between the providers introduce small deltas, so exact
/// equality would re-upload everything.
pub const WEIGHT_TOLERANCE_KG: f64 = 0.1;

/// How far back the last-entry search will walk before giving up.
pub const MAX_LOOKBACK_DAYS: u64 = 90;

/// Largest date span (inclusive days) a snapshot build will accept. The
/// destination has no range query, so every day costs one round trip.
pub const MAX_RANGE_DAYS: i64 = 90;

/// Hard sleep between consecutive upload attempts. Applied to uploads
/// only, never to lookups.
pub const UPLOAD_DELAY: Duration = Duration::from_secs(1);

/// Slack for f64 representation error in the tolerance comparison.
/// `(w + 0.1) - w` computes slightly below 0.1 for most real weights,
/// which would put an exactly-at-tolerance reading on the wrong side of
/// the boundary.
const TOLERANCE_EPSILON: f64 = 1e-9;

/// One-day-at-a-time read access to the destination. Absence of data for
/// a day is an empty vec, not an error.
#[async_trait]
pub trait DayQuery {
    async fn day_entries(&self, day: NaiveDate) -> Result<Vec<RawWeighIn>>;
}

/// A destination that also accepts FIT uploads.
#[async_trait]
pub trait RecordSink: DayQuery {
    /// Upload one encoded record. `Ok(false)` means the destination
    /// answered but rejected the file.
    async fn upload_fit(&self, bytes: Vec<u8>) -> Result<bool>;
}

/// Truncate a timestamp to its calendar day in the given timezone.
///
/// Day keys drive the whole diff, so this lives in one place instead of
/// being re-derived inline wherever a timestamp meets a map.
pub fn calendar_day_key<Tz: TimeZone>(ts: DateTime<Utc>, tz: &Tz) -> NaiveDate {
    ts.with_timezone(tz).date_naive()
}

/// Reject bad date ranges before any network activity.
pub fn validate_range(start: NaiveDate, end: NaiveDate) -> Result<(), SyncError> {
    if start > end {
        return Err(SyncError::Validation(format!(
            "start {start} is after end {end}"
        )));
    }
    let span = (end - start).num_days() + 1;
    if span > MAX_RANGE_DAYS {
        return Err(SyncError::Validation(format!(
            "range of {span} days exceeds the {MAX_RANGE_DAYS}-day cap"
        )));
    }
    Ok(())
}

/// Walk every day from `start` to `end` inclusive and build the sparse
/// day map of what the destination already holds.
///
/// One query per day, strictly sequential. A failed day is logged and
/// treated as having no data; it never aborts the build. When a day
/// returns multiple raw entries the last one in provider order wins and
/// the collapse count is kept for duplicate warnings.
pub async fn build_snapshot<D>(
    dest: &D,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Snapshot, SyncError>
where
    D: DayQuery + ?Sized,
{
    validate_range(start, end)?;

    let mut snapshot = Snapshot::new();
    let mut day = start;
    while day <= end {
        match dest.day_entries(day).await {
            Ok(entries) => {
                if let Some(record) = DayRecord::from_raw(&entries) {
                    if record.count > 1 {
                        warn!(%day, count = record.count, "multiple destination entries for day");
                    }
                    snapshot.insert(day, record);
                }
            }
            Err(err) => {
                warn!(%day, error = %err, "day query failed, treating as no data");
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    Ok(snapshot)
}

/// Whether the destination record for a measurement's day already covers
/// that measurement.
///
/// This is the single tolerance rule shared by [`classify`] and the
/// driver's just-in-time guard, so the two checks cannot drift apart. A
/// source measurement without a weight cannot be compared and is treated
/// as covered whenever any record exists for its day.
fn matches_existing(measurement: &SourceMeasurement, record: Option<&DayRecord>) -> bool {
    match (record, measurement.weight) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(record), Some(weight)) => {
            // A diff of exactly 0.1 kg must land on the "new" side
            (weight - record.weight).abs() < WEIGHT_TOLERANCE_KG - TOLERANCE_EPSILON
        }
    }
}

/// Split source measurements into new and already-synced relative to a
/// destination snapshot. Pure: no I/O, deterministic.
///
/// A measurement is new when its day is absent from the snapshot or when
/// its weight differs from the day's record by >= 0.1 kg.
pub fn classify<Tz: TimeZone>(
    measurements: &[SourceMeasurement],
    snapshot: &Snapshot,
    tz: &Tz,
) -> Classified {
    let mut classified = Classified::default();
    for m in measurements {
        let key = calendar_day_key(m.date, tz);
        if matches_existing(m, snapshot.get(&key)) {
            classified.already_synced.push(m.clone());
        } else {
            classified.new.push(m.clone());
        }
    }
    classified
}

/// Find the most recent day with at least one destination entry, walking
/// backward from `today` up to `max_lookback_days`.
///
/// `None` means no history within the window, which is a valid answer,
/// not an error. A failed day query is logged and skipped like an empty
/// day. This walk deliberately stays separate from [`build_snapshot`]:
/// opposite direction, different stopping condition.
pub async fn find_last_entry_date<D>(
    dest: &D,
    today: NaiveDate,
    max_lookback_days: u64,
) -> Option<NaiveDate>
where
    D: DayQuery + ?Sized,
{
    for offset in 0..max_lookback_days {
        let day = today.checked_sub_days(Days::new(offset))?;
        match dest.day_entries(day).await {
            Ok(entries) if !entries.is_empty() => return Some(day),
            Ok(_) => {}
            Err(err) => {
                warn!(%day, error = %err, "day query failed during last-entry search");
            }
        }
    }
    None
}

/// The "smart sync" candidate filter: measurements strictly after the
/// last known destination entry, ordered oldest-first for upload.
pub fn measurements_after<Tz: TimeZone>(
    measurements: &[SourceMeasurement],
    cutoff: NaiveDate,
    tz: &Tz,
) -> Vec<SourceMeasurement> {
    let mut candidates: Vec<SourceMeasurement> = measurements
        .iter()
        .filter(|m| calendar_day_key(m.date, tz) > cutoff)
        .cloned()
        .collect();
    candidates.sort_by_key(|m| m.date);
    candidates
}

/// Live single-day duplicate check against the destination, using the
/// same tolerance rule as the bulk classifier.
pub async fn is_already_present<D, Tz>(
    measurement: &SourceMeasurement,
    dest: &D,
    tz: &Tz,
) -> Result<bool>
where
    D: DayQuery + ?Sized,
    Tz: TimeZone,
{
    let day = calendar_day_key(measurement.date, tz);
    let entries = dest.day_entries(day).await?;
    let record = DayRecord::from_raw(&entries);
    Ok(matches_existing(measurement, record.as_ref()))
}

/// Upload measurements one at a time, in the order supplied.
///
/// Each item gets a just-in-time duplicate re-check (the candidate list
/// may be stale by the time the loop reaches it), then an encode and
/// upload wrapped so one failure never aborts the batch. A fixed 1 s
/// sleep separates consecutive upload attempts. Cancellation is honored
/// between items; work already recorded is always returned.
pub async fn sync_measurements<D, Tz>(
    dest: &D,
    measurements: &[SourceMeasurement],
    tz: &Tz,
    cancel: &CancellationToken,
) -> Vec<SyncResult>
where
    D: RecordSink + ?Sized,
    Tz: TimeZone,
{
    let mut results = Vec::with_capacity(measurements.len());
    let mut uploaded_any = false;

    for m in measurements {
        if cancel.is_cancelled() {
            debug!(remaining = measurements.len() - results.len(), "sync cancelled");
            break;
        }

        match is_already_present(m, dest, tz).await {
            Ok(true) => {
                debug!(date = %m.date, "destination already has an equivalent record");
                results.push(SyncResult {
                    success: true,
                    message: "Already exists (skipped)".to_string(),
                    measurement_date: m.date,
                });
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(date = %m.date, error = %err, "duplicate check failed");
                results.push(SyncResult {
                    success: false,
                    message: format!("Duplicate check failed: {err:#}"),
                    measurement_date: m.date,
                });
                continue;
            }
        }

        // Delay between upload attempts only, not before the first and
        // never for the lookups above.
        if uploaded_any {
            tokio::time::sleep(UPLOAD_DELAY).await;
        }
        uploaded_any = true;

        let bytes = fit::encode(m);
        match dest.upload_fit(bytes).await {
            Ok(true) => {
                debug!(date = %m.date, "uploaded");
                results.push(SyncResult {
                    success: true,
                    message: "Uploaded".to_string(),
                    measurement_date: m.date,
                });
            }
            Ok(false) => {
                results.push(SyncResult {
                    success: false,
                    message: "Upload rejected by destination".to_string(),
                    measurement_date: m.date,
                });
            }
            Err(err) => {
                warn!(date = %m.date, error = %err, "upload failed");
                results.push(SyncResult {
                    success: false,
                    message: format!("Upload failed: {err:#}"),
                    measurement_date: m.date,
                });
            }
        }
    }

    results
}
