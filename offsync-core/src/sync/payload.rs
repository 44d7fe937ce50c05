//! Wire format for uploaded batches
//!
//! A batch is a bare JSON array, one object per sample, in dequeue order:
//!
//! ```json
//! [{"capturedAt":"2024-03-01T08:00:00.000Z","lat":1.5,"lng":2.5,"accuracyM":3.0,"provider":null}]
//! ```
//!
//! `provider` is always present (possibly `null`); `batteryPct`,
//! `isCharging` and `accuracyMode` only appear when the sample has them.

use serde::Serialize;

use crate::error::Result;
use crate::types::Sample;

/// One sample as the ingest endpoint expects it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSample<'a> {
    pub captured_at: &'a str,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub provider: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_charging: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_mode: Option<&'a str>,
}

impl<'a> From<&'a Sample> for WireSample<'a> {
    fn from(sample: &'a Sample) -> Self {
        Self {
            captured_at: &sample.captured_at,
            lat: sample.lat,
            lng: sample.lng,
            accuracy_m: sample.accuracy_m,
            provider: sample.provider.as_deref(),
            battery_pct: sample.battery_pct,
            is_charging: sample.is_charging,
            accuracy_mode: sample.accuracy_mode.as_deref(),
        }
    }
}

/// Serialize a batch to the exact body that is signed and sent.
pub fn encode_batch(batch: &[Sample]) -> Result<String> {
    let wire: Vec<WireSample<'_>> = batch.iter().map(WireSample::from).collect();
    Ok(serde_json::to_string(&wire)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryState;

    fn sample(id: i64, captured_at: &str) -> Sample {
        Sample {
            id,
            captured_at: captured_at.to_string(),
            lat: 1.5,
            lng: 2.5,
            accuracy_m: 3.0,
            provider: None,
            battery_pct: None,
            is_charging: None,
            accuracy_mode: None,
            delivery_state: DeliveryState::Pending,
        }
    }

    #[test]
    fn test_empty_batch() {
        assert_eq!(encode_batch(&[]).unwrap(), "[]");
    }

    #[test]
    fn test_minimal_sample_shape() {
        let body = encode_batch(&[sample(1, "2024-03-01T08:00:00.000Z")]).unwrap();
        assert_eq!(
            body,
            r#"[{"capturedAt":"2024-03-01T08:00:00.000Z","lat":1.5,"lng":2.5,"accuracyM":3.0,"provider":null}]"#
        );
    }

    #[test]
    fn test_optional_fields_only_when_present() {
        let mut full = sample(2, "2024-03-01T09:00:00.000Z");
        full.provider = Some("gps".to_string());
        full.battery_pct = Some(42);
        full.is_charging = Some(true);
        full.accuracy_mode = Some("high_accuracy".to_string());

        let mut partial = sample(3, "2024-03-01T10:00:00.000Z");
        partial.is_charging = Some(false);

        let body = encode_batch(&[full, partial]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        let items = value.as_array().unwrap();

        assert_eq!(items[0]["provider"], "gps");
        assert_eq!(items[0]["batteryPct"], 42);
        assert_eq!(items[0]["isCharging"], true);
        assert_eq!(items[0]["accuracyMode"], "high_accuracy");

        let partial = items[1].as_object().unwrap();
        assert_eq!(partial["isCharging"], false);
        assert!(partial["provider"].is_null());
        assert!(!partial.contains_key("batteryPct"));
        assert!(!partial.contains_key("accuracyMode"));
        // Local bookkeeping never goes on the wire
        assert!(!partial.contains_key("id"));
        assert!(!partial.contains_key("deliveryState"));
    }

    #[test]
    fn test_order_is_preserved() {
        let body = encode_batch(&[
            sample(5, "2024-03-01T08:00:00.000Z"),
            sample(4, "2024-03-01T09:00:00.000Z"),
        ])
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value[0]["capturedAt"], "2024-03-01T08:00:00.000Z");
        assert_eq!(value[1]["capturedAt"], "2024-03-01T09:00:00.000Z");
    }
}
