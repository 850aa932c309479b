//! Persistence seam for sensors, readings and trees.
//!
//! [`Store`] is the only place transactions live. Two implementations exist:
//! - [`PgStore`]: PostgreSQL via `sqlx`; the production backend
//! - [`MemoryStore`]: a single-lock in-process store with the same semantics,
//!   used by tests and volatile local runs
//!
//! Both guarantee that a reading insert, its dedup check and the sensor's
//! latest-pointer update are applied atomically, and that inserts for one
//! sensor identifier are totally ordered.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    InsertOutcome, NewSensor, NewTree, Page, Sensor, SensorChanges, SensorReading, SensorStatus,
    TimeRange, Tree,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

#[async_trait]
pub trait Store: Send + Sync {
    // --- sensors

    /// Insert a sensor row plus `readings` in one unit; any failure leaves
    /// nothing behind.
    async fn create_sensor(&self, sensor: NewSensor, readings: &[SensorReading]) -> Result<Sensor>;

    /// Apply `changes` and append `readings` in one unit.
    async fn update_sensor(
        &self,
        id: &str,
        changes: SensorChanges,
        readings: &[SensorReading],
    ) -> Result<Sensor>;

    /// Remove the sensor row and its tree assignments. Readings are retained.
    async fn delete_sensor(&self, id: &str) -> Result<()>;

    async fn get_sensor(&self, id: &str) -> Result<Sensor>;

    /// Sensors ordered by identifier, plus the unpaged total.
    async fn list_sensors(&self, status: Option<SensorStatus>, page: Page)
        -> Result<(Vec<Sensor>, u64)>;

    // --- readings

    /// Idempotent on `(sensor_id, effective_at, frame_counter)`.
    async fn insert_reading(&self, reading: &SensorReading) -> Result<InsertOutcome>;

    async fn latest_reading(&self, sensor_id: &str) -> Result<SensorReading>;

    /// Newest first, plus the unpaged total.
    async fn readings_by_sensor(
        &self,
        sensor_id: &str,
        page: Page,
        range: TimeRange,
    ) -> Result<(Vec<SensorReading>, u64)>;

    /// Readings of every sensor currently assigned to the tree; grouped per
    /// sensor, newest first within a sensor.
    async fn readings_by_tree(&self, tree_id: i64) -> Result<Vec<SensorReading>>;

    async fn reading_by_id(&self, id: i64) -> Result<SensorReading>;

    /// Oldest reading in the store.
    async fn first_reading(&self) -> Result<SensorReading>;

    // --- trees

    async fn create_tree(&self, tree: NewTree) -> Result<Tree>;

    async fn get_tree(&self, id: i64) -> Result<Tree>;

    /// All trees ordered by identifier ascending.
    async fn list_trees(&self) -> Result<Vec<Tree>>;

    /// Identifiers of the sensors assigned to the tree, ascending.
    async fn tree_sensor_ids(&self, tree_id: i64) -> Result<Vec<String>>;

    async fn assign_sensor(&self, tree_id: i64, sensor_id: &str) -> Result<()>;

    async fn unassign_sensor(&self, tree_id: i64, sensor_id: &str) -> Result<()>;
}
