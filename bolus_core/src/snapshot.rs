//! Boundary loaders for upstream glucose and treatment-history data.
//!
//! The CGM bridge and the treatment uploader drop small JSON files; this
//! module turns them into an [`IOBCOBSnapshot`] and a current BG reading.
//! Collaborator failures (missing files, malformed JSON, timed-out fetches
//! that never wrote) degrade to `Unavailable` status here instead of
//! propagating raw errors into the calculator.

use crate::{
    BolusBreakdownEntry, IOBCOBSnapshot, Result, SignalStatus, TrendDirection,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::Path;

/// Readings older than this are flagged stale
pub const DEFAULT_MAX_AGE_MINUTES: i64 = 15;

/// Snapshot file format (matches the uploader's output).
/// Absent fields mean the uploader could not compute that signal.
#[derive(Debug, Deserialize)]
struct SnapshotFile {
    as_of: DateTime<Utc>,
    iob_u: Option<f64>,
    cob_g: Option<f64>,
    #[serde(default)]
    breakdown: Vec<BolusBreakdownEntry>,
}

/// BG reading file format (matches the CGM bridge's output)
#[derive(Debug, Deserialize)]
struct BgFile {
    bg_mgdl: f64,
    trend: Option<String>,
    at: DateTime<Utc>,
}

/// A current glucose reading with trend
#[derive(Clone, Debug, PartialEq)]
pub struct BgReading {
    pub bg_mgdl: f64,
    pub trend: TrendDirection,
    pub at: DateTime<Utc>,
    pub stale: bool,
}

/// Load the IOB/COB snapshot, degrading failures to `Unavailable`.
///
/// Never returns an error for collaborator problems: a missing, unreadable
/// or malformed file yields an unavailable snapshot, and an old file yields
/// stale statuses.
pub fn load_snapshot(path: &Path, now: DateTime<Utc>, max_age_minutes: i64) -> IOBCOBSnapshot {
    if !path.exists() {
        tracing::debug!("No snapshot file at {:?}; treating IOB/COB as unavailable", path);
        return IOBCOBSnapshot::unavailable();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!("Failed to read snapshot {:?}: {}. Treating as unavailable.", path, e);
            return IOBCOBSnapshot::unavailable();
        }
    };

    let file: SnapshotFile = match serde_json::from_str(&contents) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("Failed to parse snapshot {:?}: {}. Treating as unavailable.", path, e);
            return IOBCOBSnapshot::unavailable();
        }
    };

    let age = now - file.as_of;
    let freshness = if age > Duration::minutes(max_age_minutes) {
        SignalStatus::Stale
    } else {
        SignalStatus::Ok
    };

    let status_of = |value: Option<f64>| match value {
        Some(_) => freshness,
        None => SignalStatus::Unavailable,
    };

    let snapshot = IOBCOBSnapshot {
        iob_u: file.iob_u.unwrap_or(0.0),
        cob_g: file.cob_g.unwrap_or(0.0),
        iob_status: status_of(file.iob_u),
        cob_status: status_of(file.cob_g),
        breakdown: file.breakdown,
        as_of: Some(file.as_of),
    };

    tracing::info!(
        "Loaded snapshot: IOB {:.2} U ({:?}), COB {:.0} g ({:?}), age {} min",
        snapshot.iob_u,
        snapshot.iob_status,
        snapshot.cob_g,
        snapshot.cob_status,
        age.num_minutes()
    );
    snapshot
}

/// Load the current BG reading; None when the source is unavailable.
///
/// Returns an error only on programmer mistakes, never on collaborator
/// failures.
pub fn load_bg_reading(
    path: &Path,
    now: DateTime<Utc>,
    max_age_minutes: i64,
) -> Result<Option<BgReading>> {
    if !path.exists() {
        tracing::debug!("No BG reading file at {:?}", path);
        return Ok(None);
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!("Failed to read BG file {:?}: {}. Ignoring reading.", path, e);
            return Ok(None);
        }
    };

    let file: BgFile = match serde_json::from_str(&contents) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("Failed to parse BG file {:?}: {}. Ignoring reading.", path, e);
            return Ok(None);
        }
    };

    let stale = now - file.at > Duration::minutes(max_age_minutes);
    let trend = file
        .trend
        .as_deref()
        .map(parse_trend)
        .unwrap_or(TrendDirection::Flat);

    Ok(Some(BgReading {
        bg_mgdl: file.bg_mgdl,
        trend,
        at: file.at,
        stale,
    }))
}

fn parse_trend(s: &str) -> TrendDirection {
    match s.to_lowercase().as_str() {
        "rising" | "up" | "double_up" => TrendDirection::Rising,
        "falling" | "down" | "double_down" => TrendDirection::Falling,
        _ => TrendDirection::Flat,
    }
}
