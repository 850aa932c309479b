//! Telemetry intake and reading queries.
//!
//! Readings arrive already decoded by `codec`; this layer enforces the
//! identifier invariant, runs every store call under the caller's [`Cancel`],
//! and shapes paged results.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cancel::Cancel;
use crate::codec;
use crate::error::{Error, Result};
use crate::models::{InsertOutcome, Page, Paginated, SensorReading, TimeRange};
use crate::store::Store;

// ---

#[derive(Clone)]
pub struct Telemetry {
    store: Arc<dyn Store>,
}

impl Telemetry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Telemetry { store }
    }

    /// Append a reading. A repeat of an existing dedup key returns the stored
    /// row as [`InsertOutcome::Duplicate`] instead of writing again.
    pub async fn insert(&self, reading: SensorReading, cancel: &Cancel) -> Result<InsertOutcome> {
        // ---
        let reading = codec::validate(reading)?;
        let outcome = cancel.run(self.store.insert_reading(&reading)).await?;

        match &outcome {
            InsertOutcome::Created(r) => info!(
                "Stored reading {} for sensor {} (humidity={}, battery={})",
                r.id, r.sensor_id, r.humidity, r.battery
            ),
            InsertOutcome::Duplicate(r) => debug!(
                "Reading for sensor {} already stored as {}",
                r.sensor_id, r.id
            ),
        }
        Ok(outcome)
    }

    pub async fn latest(&self, sensor_id: &str, cancel: &Cancel) -> Result<SensorReading> {
        // ---
        cancel.run(self.store.get_sensor(sensor_id)).await?;
        cancel.run(self.store.latest_reading(sensor_id)).await
    }

    /// Readings of a registered sensor, newest first.
    pub async fn by_sensor(
        &self,
        sensor_id: &str,
        page: Page,
        range: TimeRange,
        cancel: &Cancel,
    ) -> Result<Paginated<SensorReading>> {
        // ---
        if let (Some(start), Some(end)) = (range.start, range.end) {
            if start > end {
                return Err(Error::BadRequest(
                    "start_time must not be after end_time".into(),
                ));
            }
        }

        // Orphaned readings stay reachable by reading id only.
        cancel.run(self.store.get_sensor(sensor_id)).await?;

        let (data, total) = cancel
            .run(self.store.readings_by_sensor(sensor_id, page, range))
            .await?;
        Ok(Paginated {
            data,
            pagination: page.pagination(total),
        })
    }

    pub async fn by_tree(&self, tree_id: i64, cancel: &Cancel) -> Result<Vec<SensorReading>> {
        cancel.run(self.store.readings_by_tree(tree_id)).await
    }

    pub async fn by_id(&self, id: i64, cancel: &Cancel) -> Result<SensorReading> {
        cancel.run(self.store.reading_by_id(id)).await
    }

    /// Oldest stored reading; diagnostics only.
    pub async fn first(&self, cancel: &Cancel) -> Result<SensorReading> {
        cancel.run(self.store.first_reading()).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{NewSensor, SensorStatus};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    async fn telemetry_with_sensor(id: &str) -> Telemetry {
        // ---
        let store = Arc::new(MemoryStore::new());
        store
            .create_sensor(
                NewSensor {
                    id: id.into(),
                    status: SensorStatus::Online,
                    latitude: 0.0,
                    longitude: 0.0,
                },
                &[],
            )
            .await
            .unwrap();
        Telemetry::new(store)
    }

    #[tokio::test]
    async fn test_latest_observes_acknowledged_insert() {
        // ---
        let telemetry = telemetry_with_sensor("s1").await;
        let cancel = Cancel::new();

        let mut r1 = SensorReading::new("s1");
        r1.received_at = Some(Utc.with_ymd_and_hms(2024, 8, 1, 6, 0, 0).unwrap());
        r1.humidity = 45;
        let mut r2 = r1.clone();
        r2.received_at = Some(Utc.with_ymd_and_hms(2024, 8, 1, 7, 0, 0).unwrap());
        r2.humidity = 30;

        telemetry.insert(r1, &cancel).await.unwrap();
        let ack = telemetry.insert(r2, &cancel).await.unwrap();

        let latest = telemetry.latest("s1", &cancel).await.unwrap();
        assert_eq!(latest.id, ack.reading().id);
        assert_eq!(latest.humidity, 30);
    }

    #[tokio::test]
    async fn test_insert_twice_returns_same_id() {
        // ---
        let telemetry = telemetry_with_sensor("s1").await;
        let cancel = Cancel::new();
        let mut reading = SensorReading::new("s1");
        reading.received_at = Some(Utc.with_ymd_and_hms(2024, 8, 1, 6, 0, 0).unwrap());

        let a = telemetry.insert(reading.clone(), &cancel).await.unwrap();
        let b = telemetry.insert(reading, &cancel).await.unwrap();
        assert_eq!(a.reading().id, b.reading().id);
        assert!(b.is_duplicate());
    }

    #[tokio::test]
    async fn test_insert_rejects_empty_sensor_id() {
        // ---
        let telemetry = telemetry_with_sensor("s1").await;
        let err = telemetry
            .insert(SensorReading::new(""), &Cancel::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_by_sensor_requires_registered_sensor() {
        // ---
        let telemetry = telemetry_with_sensor("s1").await;
        let cancel = Cancel::new();

        let page = telemetry
            .by_sensor("s1", Page::default(), TimeRange::default(), &cancel)
            .await
            .unwrap();
        assert!(page.data.is_empty());
        assert_eq!(page.pagination.total_records, 0);

        assert!(matches!(
            telemetry
                .by_sensor("nope", Page::default(), TimeRange::default(), &cancel)
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_by_sensor_rejects_inverted_range() {
        // ---
        let telemetry = telemetry_with_sensor("s1").await;
        let range = TimeRange {
            start: Some(Utc.with_ymd_and_hms(2024, 8, 2, 0, 0, 0).unwrap()),
            end: Some(Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap()),
        };
        assert!(matches!(
            telemetry
                .by_sensor("s1", Page::default(), range, &Cancel::new())
                .await,
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_orphaned_readings_reachable_by_id_only() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store
            .create_sensor(
                NewSensor {
                    id: "s1".into(),
                    status: SensorStatus::Unknown,
                    latitude: 0.0,
                    longitude: 0.0,
                },
                &[],
            )
            .await
            .unwrap();
        let telemetry = Telemetry::new(store.clone());
        let cancel = Cancel::new();

        let stored = telemetry
            .insert(SensorReading::new("s1"), &cancel)
            .await
            .unwrap();
        store.delete_sensor("s1").await.unwrap();

        assert!(matches!(
            telemetry.latest("s1", &cancel).await,
            Err(Error::NotFound(_))
        ));
        let orphan = telemetry.by_id(stored.reading().id, &cancel).await.unwrap();
        assert_eq!(orphan.sensor_id, "s1");
    }
}
