//! Decoding of raw telemetry payloads.
//!
//! Payloads are JSON objects carrying exactly `Battery`, `Kilometers`,
//! `Latitude` and `Longitude`. Only the structure is checked; values are
//! copied through without range validation.

use crate::error::DecodeError;
use crate::models::TelemetryReading;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct TelemetryPayload {
    #[serde(rename = "Battery", alias = "battery")]
    battery: i32,
    #[serde(rename = "Kilometers", alias = "kilometers")]
    kilometers: i64,
    #[serde(rename = "Latitude", alias = "latitude")]
    latitude: f64,
    #[serde(rename = "Longitude", alias = "longitude")]
    longitude: f64,
}

pub fn decode(raw: &[u8]) -> Result<TelemetryReading, DecodeError> {
    let payload: TelemetryPayload =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    Ok(TelemetryReading::new(
        payload.battery,
        payload.kilometers,
        payload.latitude,
        payload.longitude,
    ))
}
