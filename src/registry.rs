//! Sensor registry: CRUD over sensor devices.
//!
//! All validation happens here, before the store is touched. Status is
//! whatever the caller last asserted; nothing on the ingest path changes it.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::cancel::Cancel;
use crate::codec;
use crate::error::{Error, Result};
use crate::models::{
    NewSensor, Page, Paginated, Sensor, SensorChanges, SensorReading, SensorStatus,
};
use crate::store::Store;

// ---

/// Reject coordinates outside the Earth range.
pub fn validate_location(latitude: f64, longitude: f64) -> Result<()> {
    // ---
    validate_latitude(latitude)?;
    validate_longitude(longitude)
}

fn validate_latitude(latitude: f64) -> Result<()> {
    if (-90.0..=90.0).contains(&latitude) {
        Ok(())
    } else {
        Err(Error::InvalidLatitude(latitude))
    }
}

fn validate_longitude(longitude: f64) -> Result<()> {
    if (-180.0..=180.0).contains(&longitude) {
        Ok(())
    } else {
        Err(Error::InvalidLongitude(longitude))
    }
}

fn require_id(id: &str) -> Result<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(Error::BadRequest("sensor identifier must not be empty".into()));
    }
    Ok(id)
}

/// Attach readings to `sensor_id`, filling in a missing identifier and
/// rejecting readings that name a different sensor.
fn bind_readings(sensor_id: &str, readings: Vec<SensorReading>) -> Result<Vec<SensorReading>> {
    // ---
    readings
        .into_iter()
        .map(|mut r| {
            if r.sensor_id.trim().is_empty() {
                r.sensor_id = sensor_id.to_string();
            }
            let r = codec::validate(r)?;
            if r.sensor_id != sensor_id {
                return Err(Error::BadRequest(format!(
                    "reading for '{}' cannot be attached to sensor '{}'",
                    r.sensor_id, sensor_id
                )));
            }
            Ok(r)
        })
        .collect()
}

/// Input for [`Registry::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateSensor {
    /// Generated when absent.
    pub id: Option<String>,
    pub status: Option<SensorStatus>,
    pub latitude: f64,
    pub longitude: f64,
    pub readings: Vec<SensorReading>,
}

/// One change applied by [`Registry::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum SensorMutation {
    SetStatus(SensorStatus),
    /// Either coordinate may be left unchanged.
    SetLocation {
        latitude: Option<f64>,
        longitude: Option<f64>,
    },
    AppendReadings(Vec<SensorReading>),
}

#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn Store>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Registry { store }
    }

    pub async fn create(&self, req: CreateSensor, cancel: &Cancel) -> Result<Sensor> {
        // ---
        validate_location(req.latitude, req.longitude)?;

        let id = match req.id.as_deref().map(str::trim) {
            Some("") => {
                return Err(Error::BadRequest("sensor identifier must not be empty".into()))
            }
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let readings = bind_readings(&id, req.readings)?;

        let new = NewSensor {
            id,
            status: req.status.unwrap_or_default(),
            latitude: req.latitude,
            longitude: req.longitude,
        };
        let sensor = cancel.run(self.store.create_sensor(new, &readings)).await?;

        info!(
            "Created sensor {} ({}) with {} initial readings",
            sensor.id,
            sensor.status,
            readings.len()
        );
        Ok(sensor)
    }

    pub async fn update(
        &self,
        id: &str,
        mutations: Vec<SensorMutation>,
        cancel: &Cancel,
    ) -> Result<Sensor> {
        // ---
        let id = require_id(id)?;

        let mut changes = SensorChanges::default();
        let mut readings = Vec::new();
        for mutation in mutations {
            match mutation {
                SensorMutation::SetStatus(status) => changes.status = Some(status),
                SensorMutation::SetLocation {
                    latitude,
                    longitude,
                } => {
                    if let Some(lat) = latitude {
                        validate_latitude(lat)?;
                        changes.latitude = Some(lat);
                    }
                    if let Some(lon) = longitude {
                        validate_longitude(lon)?;
                        changes.longitude = Some(lon);
                    }
                }
                SensorMutation::AppendReadings(batch) => {
                    readings.extend(bind_readings(id, batch)?);
                }
            }
        }

        let sensor = cancel
            .run(self.store.update_sensor(id, changes, &readings))
            .await?;
        info!("Updated sensor {}", sensor.id);
        Ok(sensor)
    }

    pub async fn delete(&self, id: &str, cancel: &Cancel) -> Result<()> {
        // ---
        let id = require_id(id)?;
        cancel.run(self.store.delete_sensor(id)).await?;
        info!("Deleted sensor {} (readings retained)", id);
        Ok(())
    }

    pub async fn get_by_id(&self, id: &str, cancel: &Cancel) -> Result<Sensor> {
        let id = require_id(id)?;
        cancel.run(self.store.get_sensor(id)).await
    }

    pub async fn get_all(
        &self,
        status: Option<SensorStatus>,
        page: Page,
        cancel: &Cancel,
    ) -> Result<Paginated<Sensor>> {
        // ---
        let (data, total) = cancel.run(self.store.list_sensors(status, page)).await?;
        Ok(Paginated {
            data,
            pagination: page.pagination(total),
        })
    }

    pub async fn get_status(&self, id: &str, cancel: &Cancel) -> Result<SensorStatus> {
        Ok(self.get_by_id(id, cancel).await?.status)
    }
}
