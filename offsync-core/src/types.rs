//! Core domain types for offsync
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Sample** | One location fix with its metadata and delivery state |
//! | **Batch** | A bounded, ordered list of pending samples sent in one upload attempt |
//! | **Delivery state** | `Pending` (not yet acknowledged) or `Delivered` (server accepted) |
//!
//! `captured_at` is an ISO-8601 string and the only ordering and retention
//! key. Timestamps produced by this crate use [`TIMESTAMP_FORMAT`] so that
//! lexical order matches chronological order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// UTC, millisecond precision, `Z` suffix (`2024-01-31T08:15:00.000Z`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp the way `captured_at` values and prune cutoffs are stored.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Rewrite any RFC 3339 timestamp into [`TIMESTAMP_FORMAT`].
///
/// Offsets are folded into UTC and precision is fixed at milliseconds, so
/// `09:00:00+05:00` becomes `04:00:00.000Z`.
pub fn normalize_timestamp(raw: &str) -> Result<String> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim()).map_err(|e| {
        Error::Validation(format!(
            "captured_at {:?} is not an ISO-8601 timestamp: {}",
            raw, e
        ))
    })?;
    Ok(format_timestamp(parsed.with_timezone(&Utc)))
}

// ============================================
// Delivery state
// ============================================

/// Whether the server has acknowledged a sample.
///
/// Only ever moves from `Pending` to `Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivered => "delivered",
        }
    }

    /// Column encoding used by the store (`delivered` flag).
    pub(crate) fn from_flag(flag: i64) -> Self {
        if flag == 0 {
            DeliveryState::Pending
        } else {
            DeliveryState::Delivered
        }
    }
}

impl std::str::FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "delivered" => Ok(DeliveryState::Delivered),
            _ => Err(format!("unknown delivery state: {}", s)),
        }
    }
}

// ============================================
// Samples
// ============================================

/// A location fix as handed over by the capture side, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSample {
    pub captured_at: String,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub provider: Option<String>,
    pub battery_pct: Option<u8>,
    pub is_charging: Option<bool>,
    pub accuracy_mode: Option<String>,
}

impl NewSample {
    /// Minimal sample with only the required fields set.
    pub fn new(captured_at: impl Into<String>, lat: f64, lng: f64, accuracy_m: f64) -> Self {
        Self {
            captured_at: captured_at.into(),
            lat,
            lng,
            accuracy_m,
            provider: None,
            battery_pct: None,
            is_charging: None,
            accuracy_mode: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_battery(mut self, pct: u8, is_charging: bool) -> Self {
        self.battery_pct = Some(pct);
        self.is_charging = Some(is_charging);
        self
    }

    pub fn with_accuracy_mode(mut self, mode: impl Into<String>) -> Self {
        self.accuracy_mode = Some(mode.into());
        self
    }

    /// Reject samples that must never enter the store.
    ///
    /// Coordinate ranges follow what the ingest endpoint accepts, so a sample
    /// that passes here is not bounced by the server for its shape.
    pub fn validate(&self) -> Result<()> {
        if self.captured_at.trim().is_empty() {
            return Err(Error::Validation("captured_at is required".to_string()));
        }
        normalize_timestamp(&self.captured_at)?;
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::Validation(format!(
                "lat {} outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(Error::Validation(format!(
                "lng {} outside [-180, 180]",
                self.lng
            )));
        }
        if !self.accuracy_m.is_finite() || self.accuracy_m < 0.0 {
            return Err(Error::Validation(format!(
                "accuracy_m {} must be a non-negative number",
                self.accuracy_m
            )));
        }
        if let Some(pct) = self.battery_pct {
            if pct > 100 {
                return Err(Error::Validation(format!(
                    "battery_pct {} outside [0, 100]",
                    pct
                )));
            }
        }
        Ok(())
    }
}

/// A stored location fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Locally assigned, monotonically increasing, never reused
    pub id: i64,
    pub captured_at: String,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub provider: Option<String>,
    pub battery_pct: Option<u8>,
    pub is_charging: Option<bool>,
    pub accuracy_mode: Option<String>,
    pub delivery_state: DeliveryState,
}

impl Sample {
    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }
}

/// Credentials written by the pairing flow. Either half may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub device_id: Option<String>,
    pub device_token: Option<String>,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        self.device_id.is_some() && self.device_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp_is_lexically_ordered() {
        let a = Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let (fa, fb) = (format_timestamp(a), format_timestamp(b));
        assert_eq!(fa, "2024-01-09T23:59:59.000Z");
        assert!(fa < fb);
    }

    #[test]
    fn test_delivery_state_roundtrip() {
        for state in [DeliveryState::Pending, DeliveryState::Delivered] {
            assert_eq!(state.as_str().parse::<DeliveryState>().unwrap(), state);
        }
        assert!("uploaded".parse::<DeliveryState>().is_err());
        assert_eq!(DeliveryState::from_flag(0), DeliveryState::Pending);
        assert_eq!(DeliveryState::from_flag(1), DeliveryState::Delivered);
    }

    #[test]
    fn test_validate_accepts_full_sample() {
        let sample = NewSample::new("2024-05-01T10:00:00.000Z", 52.52, 13.405, 8.5)
            .with_provider("gps")
            .with_battery(80, true)
            .with_accuracy_mode("high_accuracy");
        assert!(sample.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_samples() {
        let base = NewSample::new("2024-05-01T10:00:00.000Z", 0.0, 0.0, 5.0);

        let mut s = base.clone();
        s.captured_at = String::new();
        assert!(matches!(s.validate(), Err(Error::Validation(_))));

        let mut s = base.clone();
        s.captured_at = "yesterday".to_string();
        assert!(s.validate().is_err());

        let mut s = base.clone();
        s.lat = 91.0;
        assert!(s.validate().is_err());

        let mut s = base.clone();
        s.lng = f64::NAN;
        assert!(s.validate().is_err());

        let mut s = base.clone();
        s.accuracy_m = -1.0;
        assert!(s.validate().is_err());

        let mut s = base;
        s.battery_pct = Some(101);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_normalize_timestamp_orders_lexically() {
        assert_eq!(
            normalize_timestamp("2024-03-01T08:00:00Z").unwrap(),
            "2024-03-01T08:00:00.000Z"
        );
        assert_eq!(
            normalize_timestamp("2024-03-01T08:00:00.5Z").unwrap(),
            "2024-03-01T08:00:00.500Z"
        );
        assert_eq!(
            normalize_timestamp("2024-03-01T09:00:00+05:00").unwrap(),
            "2024-03-01T04:00:00.000Z"
        );
        assert_eq!(
            normalize_timestamp("2024-03-01T08:00:00.123456-01:00").unwrap(),
            "2024-03-01T09:00:00.123Z"
        );
        assert!(matches!(
            normalize_timestamp("2024-03-01 08:00"),
            Err(Error::Validation(_))
        ));
    }
}
