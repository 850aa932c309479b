//! In-process store with the same contract as the PostgreSQL backend.
//!
//! All state sits behind one `RwLock`; a write guard is the transaction, so
//! every multi-step operation is applied or rejected as a whole before any
//! other task can observe it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::Store;
use crate::error::{Error, Result};
use crate::models::{
    InsertOutcome, NewSensor, NewTree, Page, Sensor, SensorChanges, SensorReading, SensorStatus,
    TimeRange, Tree,
};

// ---

#[derive(Debug)]
struct StoredReading {
    reading: SensorReading,
    effective_at: DateTime<Utc>,
}

type DedupKey = (String, DateTime<Utc>, i64);

#[derive(Debug, Default)]
struct State {
    sensors: BTreeMap<String, Sensor>,
    /// Reading `id` lives at index `id - 1`.
    readings: Vec<StoredReading>,
    by_sensor: HashMap<String, Vec<usize>>,
    latest: HashMap<String, usize>,
    dedup: HashMap<DedupKey, usize>,
    trees: BTreeMap<i64, Tree>,
    assignments: BTreeMap<i64, BTreeSet<String>>,
}

impl State {
    fn sensor(&self, id: &str) -> Result<&Sensor> {
        self.sensors
            .get(id)
            .ok_or_else(|| Error::not_found(format!("sensor '{id}'")))
    }

    fn tree(&self, id: i64) -> Result<&Tree> {
        self.trees
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("tree {id}")))
    }

    fn insert_reading(&mut self, reading: &SensorReading) -> Result<InsertOutcome> {
        // ---
        self.sensor(&reading.sensor_id)?;

        let effective_at = reading.effective_at(Utc::now());
        let key = (
            reading.sensor_id.clone(),
            effective_at,
            reading.raw.frame_counter(),
        );
        if let Some(&idx) = self.dedup.get(&key) {
            return Ok(InsertOutcome::Duplicate(self.readings[idx].reading.clone()));
        }

        let idx = self.readings.len();
        let mut stored = reading.clone();
        stored.id = idx as i64 + 1;

        let newer = match self.latest.get(&stored.sensor_id) {
            Some(&cur) => {
                let cur = &self.readings[cur];
                (effective_at, stored.id) > (cur.effective_at, cur.reading.id)
            }
            None => true,
        };
        if newer {
            self.latest.insert(stored.sensor_id.clone(), idx);
        }
        self.by_sensor
            .entry(stored.sensor_id.clone())
            .or_default()
            .push(idx);
        self.dedup.insert(key, idx);
        self.readings.push(StoredReading {
            reading: stored.clone(),
            effective_at,
        });

        Ok(InsertOutcome::Created(stored))
    }

    /// Indices of a sensor's readings, newest first.
    fn sensor_history(&self, sensor_id: &str, range: TimeRange) -> Vec<usize> {
        // ---
        let mut idxs: Vec<usize> = self
            .by_sensor
            .get(sensor_id)
            .map(|v| {
                v.iter()
                    .copied()
                    .filter(|&i| range.contains(self.readings[i].effective_at))
                    .collect()
            })
            .unwrap_or_default();

        idxs.sort_by(|&a, &b| {
            let (a, b) = (&self.readings[a], &self.readings[b]);
            (b.effective_at, b.reading.id).cmp(&(a.effective_at, a.reading.id))
        });
        idxs
    }
}

/// Volatile [`Store`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

fn check_readings_belong(sensor_id: &str, readings: &[SensorReading]) -> Result<()> {
    match readings.iter().find(|r| r.sensor_id != sensor_id) {
        Some(r) => Err(Error::BadRequest(format!(
            "reading for '{}' cannot be stored under sensor '{}'",
            r.sensor_id, sensor_id
        ))),
        None => Ok(()),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_sensor(&self, sensor: NewSensor, readings: &[SensorReading]) -> Result<Sensor> {
        // ---
        check_readings_belong(&sensor.id, readings)?;

        let mut state = self.state.write().await;
        if state.sensors.contains_key(&sensor.id) {
            return Err(Error::Conflict(format!("sensor '{}' already exists", sensor.id)));
        }

        let now = Utc::now();
        let created = Sensor {
            id: sensor.id,
            status: sensor.status,
            latitude: sensor.latitude,
            longitude: sensor.longitude,
            created_at: now,
            updated_at: now,
        };
        state.sensors.insert(created.id.clone(), created.clone());
        for reading in readings {
            state.insert_reading(reading)?;
        }
        Ok(created)
    }

    async fn update_sensor(
        &self,
        id: &str,
        changes: SensorChanges,
        readings: &[SensorReading],
    ) -> Result<Sensor> {
        // ---
        check_readings_belong(id, readings)?;

        let mut state = self.state.write().await;
        state.sensor(id)?;

        for reading in readings {
            state.insert_reading(reading)?;
        }

        let sensor = state
            .sensors
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("sensor '{id}'")))?;
        if let Some(status) = changes.status {
            sensor.status = status;
        }
        if let Some(lat) = changes.latitude {
            sensor.latitude = lat;
        }
        if let Some(lon) = changes.longitude {
            sensor.longitude = lon;
        }
        if !changes.is_empty() || !readings.is_empty() {
            sensor.updated_at = Utc::now();
        }
        Ok(sensor.clone())
    }

    async fn delete_sensor(&self, id: &str) -> Result<()> {
        // ---
        let mut state = self.state.write().await;
        if state.sensors.remove(id).is_none() {
            return Err(Error::not_found(format!("sensor '{id}'")));
        }
        for assigned in state.assignments.values_mut() {
            assigned.remove(id);
        }

        // Detach the history: a sensor re-created under this id starts empty,
        // while the old rows stay reachable by reading id.
        state.latest.remove(id);
        state.by_sensor.remove(id);
        state.dedup.retain(|(sensor_id, _, _), _| sensor_id != id);
        Ok(())
    }

    async fn get_sensor(&self, id: &str) -> Result<Sensor> {
        self.state.read().await.sensor(id).cloned()
    }

    async fn list_sensors(
        &self,
        status: Option<SensorStatus>,
        page: Page,
    ) -> Result<(Vec<Sensor>, u64)> {
        // ---
        let state = self.state.read().await;
        let matching: Vec<&Sensor> = state
            .sensors
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .collect();
        let total = matching.len() as u64;
        let data = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok((data, total))
    }

    async fn insert_reading(&self, reading: &SensorReading) -> Result<InsertOutcome> {
        self.state.write().await.insert_reading(reading)
    }

    async fn latest_reading(&self, sensor_id: &str) -> Result<SensorReading> {
        // ---
        let state = self.state.read().await;
        state
            .latest
            .get(sensor_id)
            .map(|&idx| state.readings[idx].reading.clone())
            .ok_or_else(|| Error::not_found(format!("reading for sensor '{sensor_id}'")))
    }

    async fn readings_by_sensor(
        &self,
        sensor_id: &str,
        page: Page,
        range: TimeRange,
    ) -> Result<(Vec<SensorReading>, u64)> {
        // ---
        let state = self.state.read().await;
        let history = state.sensor_history(sensor_id, range);
        let total = history.len() as u64;
        let data = history
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .map(|i| state.readings[i].reading.clone())
            .collect();
        Ok((data, total))
    }

    async fn readings_by_tree(&self, tree_id: i64) -> Result<Vec<SensorReading>> {
        // ---
        let state = self.state.read().await;
        state.tree(tree_id)?;

        let Some(assigned) = state.assignments.get(&tree_id) else {
            return Ok(Vec::new());
        };
        Ok(assigned
            .iter()
            .flat_map(|sid| state.sensor_history(sid, TimeRange::default()))
            .map(|i| state.readings[i].reading.clone())
            .collect())
    }

    async fn reading_by_id(&self, id: i64) -> Result<SensorReading> {
        // ---
        let state = self.state.read().await;
        id.checked_sub(1)
            .and_then(|idx| usize::try_from(idx).ok())
            .and_then(|idx| state.readings.get(idx))
            .map(|s| s.reading.clone())
            .ok_or_else(|| Error::not_found(format!("reading {id}")))
    }

    async fn first_reading(&self) -> Result<SensorReading> {
        // ---
        let state = self.state.read().await;
        state
            .readings
            .iter()
            .min_by_key(|s| (s.effective_at, s.reading.id))
            .map(|s| s.reading.clone())
            .ok_or_else(|| Error::not_found("first reading"))
    }

    async fn create_tree(&self, tree: NewTree) -> Result<Tree> {
        // ---
        let mut state = self.state.write().await;
        let id = state.trees.keys().next_back().map_or(1, |last| last + 1);
        let now = Utc::now();
        let created = Tree {
            id,
            species: tree.species,
            tree_number: tree.tree_number,
            age: tree.age,
            location: tree.location,
            created_at: now,
            updated_at: now,
        };
        state.trees.insert(id, created.clone());
        Ok(created)
    }

    async fn get_tree(&self, id: i64) -> Result<Tree> {
        self.state.read().await.tree(id).cloned()
    }

    async fn list_trees(&self) -> Result<Vec<Tree>> {
        Ok(self.state.read().await.trees.values().cloned().collect())
    }

    async fn tree_sensor_ids(&self, tree_id: i64) -> Result<Vec<String>> {
        // ---
        let state = self.state.read().await;
        state.tree(tree_id)?;
        Ok(state
            .assignments
            .get(&tree_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn assign_sensor(&self, tree_id: i64, sensor_id: &str) -> Result<()> {
        // ---
        let mut state = self.state.write().await;
        state.tree(tree_id)?;
        state.sensor(sensor_id)?;
        state
            .assignments
            .entry(tree_id)
            .or_default()
            .insert(sensor_id.to_string());
        Ok(())
    }

    async fn unassign_sensor(&self, tree_id: i64, sensor_id: &str) -> Result<()> {
        // ---
        let mut state = self.state.write().await;
        state.tree(tree_id)?;
        let removed = state
            .assignments
            .get_mut(&tree_id)
            .is_some_and(|s| s.remove(sensor_id));
        if !removed {
            return Err(Error::not_found(format!(
                "sensor '{sensor_id}' on tree {tree_id}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::TreeLocation;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn new_sensor(id: &str) -> NewSensor {
        NewSensor {
            id: id.to_string(),
            status: SensorStatus::Unknown,
            latitude: 54.82124518,
            longitude: 9.48570212,
        }
    }

    fn reading_at(sensor_id: &str, minute: u32, humidity: i32) -> SensorReading {
        // ---
        let mut r = SensorReading::new(sensor_id);
        r.received_at = Some(Utc.with_ymd_and_hms(2024, 7, 1, 10, minute, 0).unwrap());
        r.humidity = humidity;
        r
    }

    fn new_tree(number: &str) -> NewTree {
        NewTree {
            species: "Tilia cordata".to_string(),
            tree_number: number.to_string(),
            age: 40,
            location: TreeLocation {
                latitude: 54.78,
                longitude: 9.43,
                address: "Rathausplatz".to_string(),
                additional_info: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_insert_requires_registered_sensor() {
        // ---
        let store = MemoryStore::new();
        let err = store.insert_reading(&reading_at("ghost", 0, 50)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_on_dedup_key() {
        // ---
        let store = MemoryStore::new();
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();

        let first = store.insert_reading(&reading_at("s1", 0, 50)).await.unwrap();
        let second = store.insert_reading(&reading_at("s1", 0, 99)).await.unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.reading().id, second.reading().id);
        assert_eq!(second.reading().humidity, 50);

        let (_, total) = store
            .readings_by_sensor("s1", Page::default(), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_frame_counter_separates_same_timestamp() {
        // ---
        let store = MemoryStore::new();
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();

        let a = reading_at("s1", 0, 50);
        let mut b = reading_at("s1", 0, 51);
        b.raw.0.insert("f_cnt".into(), 2.into());

        let a = store.insert_reading(&a).await.unwrap();
        let b = store.insert_reading(&b).await.unwrap();
        assert!(!b.is_duplicate());
        assert_ne!(a.reading().id, b.reading().id);

        // Equal timestamps: the greater insert id wins.
        let latest = store.latest_reading("s1").await.unwrap();
        assert_eq!(latest.id, b.reading().id);
    }

    #[tokio::test]
    async fn test_latest_follows_receive_time_not_insert_order() {
        // ---
        let store = MemoryStore::new();
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();

        store.insert_reading(&reading_at("s1", 30, 45)).await.unwrap();
        store.insert_reading(&reading_at("s1", 10, 80)).await.unwrap();
        assert_eq!(store.latest_reading("s1").await.unwrap().humidity, 45);

        store.insert_reading(&reading_at("s1", 40, 30)).await.unwrap();
        assert_eq!(store.latest_reading("s1").await.unwrap().humidity, 30);
    }

    #[tokio::test]
    async fn test_readings_without_timestamp_order_by_arrival() {
        // ---
        let store = MemoryStore::new();
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();

        let mut first = SensorReading::new("s1");
        first.humidity = 45;
        store.insert_reading(&first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let mut second = SensorReading::new("s1");
        second.humidity = 30;
        store.insert_reading(&second).await.unwrap();

        assert_eq!(store.latest_reading("s1").await.unwrap().humidity, 30);
    }

    #[tokio::test]
    async fn test_readings_by_sensor_pages_newest_first() {
        // ---
        let store = MemoryStore::new();
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();
        for minute in 0..5 {
            store
                .insert_reading(&reading_at("s1", minute, minute as i32))
                .await
                .unwrap();
        }

        let (page1, total) = store
            .readings_by_sensor("s1", Page::new(Some(1), Some(2)), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(
            page1.iter().map(|r| r.humidity).collect::<Vec<_>>(),
            vec![4, 3]
        );

        let (page3, _) = store
            .readings_by_sensor("s1", Page::new(Some(3), Some(2)), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].humidity, 0);

        let start = Utc.with_ymd_and_hms(2024, 7, 1, 10, 1, 0).unwrap();
        let range = TimeRange {
            start: Some(start),
            end: Some(start + Duration::minutes(2)),
        };
        let (window, total) = store
            .readings_by_sensor("s1", Page::default(), range)
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(
            window.iter().map(|r| r.humidity).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
    }

    #[tokio::test]
    async fn test_delete_keeps_orphaned_readings() {
        // ---
        let store = MemoryStore::new();
        let readings = [reading_at("s1", 0, 50)];
        store.create_sensor(new_sensor("s1"), &readings).await.unwrap();
        let tree = store.create_tree(new_tree("FL-001")).await.unwrap();
        store.assign_sensor(tree.id, "s1").await.unwrap();

        store.delete_sensor("s1").await.unwrap();
        assert!(matches!(
            store.delete_sensor("s1").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(store.get_sensor("s1").await, Err(Error::NotFound(_))));
        assert!(store.tree_sensor_ids(tree.id).await.unwrap().is_empty());

        let orphan = store.reading_by_id(1).await.unwrap();
        assert_eq!(orphan.sensor_id, "s1");
    }

    #[tokio::test]
    async fn test_recreated_sensor_does_not_inherit_history() {
        // ---
        let store = MemoryStore::new();
        let tree = store.create_tree(new_tree("FL-002")).await.unwrap();
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();
        let old = store.insert_reading(&reading_at("s1", 0, 77)).await.unwrap();

        store.delete_sensor("s1").await.unwrap();
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();
        store.assign_sensor(tree.id, "s1").await.unwrap();

        assert!(matches!(
            store.latest_reading("s1").await,
            Err(Error::NotFound(_))
        ));
        let (data, total) = store
            .readings_by_sensor("s1", Page::default(), TimeRange::default())
            .await
            .unwrap();
        assert!(data.is_empty());
        assert_eq!(total, 0);
        assert!(store.readings_by_tree(tree.id).await.unwrap().is_empty());
        assert_eq!(store.reading_by_id(old.reading().id).await.unwrap().humidity, 77);

        // Same dedup key as the orphan: stored as a new row for the new sensor.
        let fresh = store.insert_reading(&reading_at("s1", 0, 55)).await.unwrap();
        assert!(!fresh.is_duplicate());
        assert_ne!(fresh.reading().id, old.reading().id);
        assert_eq!(store.latest_reading("s1").await.unwrap().humidity, 55);
    }

    #[tokio::test]
    async fn test_empty_update_keeps_updated_at() {
        // ---
        let store = MemoryStore::new();
        let created = store.create_sensor(new_sensor("s1"), &[]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        let same = store
            .update_sensor("s1", SensorChanges::default(), &[])
            .await
            .unwrap();
        assert_eq!(same.updated_at, created.updated_at);

        let changed = store
            .update_sensor(
                "s1",
                SensorChanges {
                    status: Some(SensorStatus::Online),
                    ..SensorChanges::default()
                },
                &[],
            )
            .await
            .unwrap();
        assert!(changed.updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn test_sub_microsecond_timestamps_share_a_dedup_key() {
        // ---
        let store = MemoryStore::new();
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();

        let mut a = reading_at("s1", 0, 50);
        a.received_at = a.received_at.map(|t| t + Duration::nanoseconds(100));
        let mut b = reading_at("s1", 0, 51);
        b.received_at = b.received_at.map(|t| t + Duration::nanoseconds(900));

        let a = store.insert_reading(&a).await.unwrap();
        let b = store.insert_reading(&b).await.unwrap();
        assert!(b.is_duplicate());
        assert_eq!(a.reading().id, b.reading().id);
    }

    #[tokio::test]
    async fn test_create_sensor_rejects_duplicates_and_foreign_readings() {
        // ---
        let store = MemoryStore::new();
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();
        assert!(matches!(
            store.create_sensor(new_sensor("s1"), &[]).await,
            Err(Error::Conflict(_))
        ));

        let foreign = [reading_at("other", 0, 10)];
        assert!(matches!(
            store.create_sensor(new_sensor("s2"), &foreign).await,
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(store.get_sensor("s2").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_readings_by_tree_groups_per_sensor() {
        // ---
        let store = MemoryStore::new();
        store.create_sensor(new_sensor("a"), &[]).await.unwrap();
        store.create_sensor(new_sensor("b"), &[]).await.unwrap();
        store.create_sensor(new_sensor("c"), &[]).await.unwrap();
        let tree = store.create_tree(new_tree("FL-002")).await.unwrap();
        store.assign_sensor(tree.id, "a").await.unwrap();
        store.assign_sensor(tree.id, "b").await.unwrap();

        for (sid, minute) in [("a", 1), ("b", 2), ("a", 3), ("c", 4)] {
            store.insert_reading(&reading_at(sid, minute, 50)).await.unwrap();
        }

        let readings = store.readings_by_tree(tree.id).await.unwrap();
        let summary: Vec<(&str, u32)> = readings
            .iter()
            .map(|r| {
                use chrono::Timelike;
                (r.sensor_id.as_str(), r.received_at.unwrap().minute())
            })
            .collect();
        assert_eq!(summary, vec![("a", 3), ("a", 1), ("b", 2)]);

        assert!(matches!(
            store.readings_by_tree(999).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_first_reading_and_lookup_by_id() {
        // ---
        let store = MemoryStore::new();
        assert!(matches!(store.first_reading().await, Err(Error::NotFound(_))));

        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();
        store.insert_reading(&reading_at("s1", 20, 1)).await.unwrap();
        store.insert_reading(&reading_at("s1", 5, 2)).await.unwrap();

        assert_eq!(store.first_reading().await.unwrap().humidity, 2);
        assert_eq!(store.reading_by_id(1).await.unwrap().humidity, 1);
        assert!(matches!(store.reading_by_id(0).await, Err(Error::NotFound(_))));
        assert!(matches!(store.reading_by_id(3).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_trees_list_ascending_and_assignment_errors() {
        // ---
        let store = MemoryStore::new();
        let t1 = store.create_tree(new_tree("FL-010")).await.unwrap();
        let t2 = store.create_tree(new_tree("FL-011")).await.unwrap();
        assert!(t1.id < t2.id);

        let ids: Vec<i64> = store.list_trees().await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![t1.id, t2.id]);

        assert!(matches!(
            store.assign_sensor(t1.id, "missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.unassign_sensor(t1.id, "missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_keep_latest_consistent() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.create_sensor(new_sensor("s1"), &[]).await.unwrap();

        let tasks: Vec<_> = (0..40u32)
            .map(|minute| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert_reading(&reading_at("s1", minute, minute as i32))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.latest_reading("s1").await.unwrap().humidity, 39);
        let (_, total) = store
            .readings_by_sensor("s1", Page::default(), TimeRange::default())
            .await
            .unwrap();
        assert_eq!(total, 40);
    }
}
