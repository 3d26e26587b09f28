//! Sync engine that reconciles Withings health measurements against
//! Garmin Connect and uploads whatever is missing.
//!
//! The flow: fetch source measurements ([`withings`]), build a per-day
//! snapshot of what the destination already holds ([`sync::build_snapshot`]),
//! classify what is new ([`sync::classify`]), then drive the serial,
//! rate-limited upload loop ([`sync::sync_measurements`]) which encodes
//! each measurement as a FIT file ([`fit::encode`]).

pub mod auth;
pub mod error;
pub mod fit;
pub mod garmin;
pub mod models;
pub mod sync;
pub mod withings;

pub use error::SyncError;
pub use models::{
    Classified, DayRecord, RawWeighIn, Snapshot, SourceMeasurement, SyncResult, SyncSummary,
};
pub use sync::{
    build_snapshot, calendar_day_key, classify, find_last_entry_date, is_already_present,
    measurements_after, sync_measurements, validate_range, DayQuery, RecordSink,
    MAX_LOOKBACK_DAYS, MAX_RANGE_DAYS, UPLOAD_DELAY, WEIGHT_TOLERANCE_KG,
};
