//! Wire codec for telemetry uplinks.
//!
//! The canonical shape is the flat reading (`sensor_id`, `battery`, `humidity`,
//! `temperature`, `watermarks`, `raw`). Decoding is strict on the measured
//! fields and lenient inside `raw`, which is carried through untouched.
//!
//! Network servers deliver a nested LoRaWAN envelope instead;
//! [`decode_uplink`] folds that into the flat shape, keeping everything except
//! the decoded payload as opaque metadata.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::models::{truncate_micros, SensorReading, UplinkMetadata, Watermark};

// ---

/// Serialize a reading in canonical form. Field order is fixed by the struct
/// definition, so equal readings encode to equal bytes.
pub fn encode(reading: &SensorReading) -> Vec<u8> {
    // Serializing plain structs and a string-keyed map cannot fail.
    serde_json::to_vec(reading).unwrap_or_default()
}

/// Parse a canonical flat reading.
pub fn decode(bytes: &[u8]) -> Result<SensorReading, DecodeError> {
    // ---
    let reading: SensorReading = serde_json::from_slice(bytes)?;
    validate(reading)
}

/// Check the invariants serde cannot express.
pub fn validate(mut reading: SensorReading) -> Result<SensorReading, DecodeError> {
    // ---
    reading.sensor_id = reading.sensor_id.trim().to_string();
    reading.received_at = reading.received_at.map(truncate_micros);
    if reading.sensor_id.is_empty() {
        return Err(DecodeError::MissingSensorId);
    }
    if let Some((index, w)) = reading
        .watermarks
        .iter()
        .enumerate()
        .find(|(_, w)| w.depth < 0)
    {
        return Err(DecodeError::NegativeDepth {
            index,
            depth: w.depth,
        });
    }
    Ok(reading)
}

/// Measured values as emitted by the device payload formatter.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DecodedPayload {
    battery: f64,
    humidity: i32,
    temperature: f64,
    watermarks: Vec<Watermark>,
}

/// Parse a nested LoRaWAN network-server uplink into a canonical reading.
///
/// The device identifier comes from `end_device_ids.device_id`; the receive
/// timestamp from `uplink_message.received_at`, falling back to the envelope's
/// `received_at`. `uplink_message.decoded_payload` is parsed strictly and
/// removed; the remainder of the envelope becomes `raw`.
pub fn decode_uplink(bytes: &[u8]) -> Result<SensorReading, DecodeError> {
    // ---
    let mut envelope: Map<String, Value> = serde_json::from_slice(bytes)?;

    let sensor_id = envelope
        .get("end_device_ids")
        .and_then(|ids| ids.get("device_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(DecodeError::MissingSensorId)?;

    let decoded = match envelope
        .get_mut("uplink_message")
        .and_then(Value::as_object_mut)
        .and_then(|m| m.remove("decoded_payload"))
    {
        Some(v) => serde_json::from_value::<DecodedPayload>(v)?,
        None => DecodedPayload::default(),
    };

    let received_at = received_at(&envelope)?;

    validate(SensorReading {
        id: 0,
        sensor_id,
        received_at,
        battery: decoded.battery,
        humidity: decoded.humidity,
        temperature: decoded.temperature,
        watermarks: decoded.watermarks,
        raw: UplinkMetadata(envelope),
    })
}

fn received_at(envelope: &Map<String, Value>) -> Result<Option<DateTime<Utc>>, DecodeError> {
    // ---
    let value = envelope
        .get("uplink_message")
        .and_then(|m| m.get("received_at"))
        .or_else(|| envelope.get("received_at"));

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
    }
}
