//! PostgreSQL backend.
//!
//! This is the database codec: rows map straight onto the canonical model,
//! with `watermarks` and `raw` stored as JSONB. Driver errors are logged here
//! and converted into the service taxonomy exactly once.
//!
//! Inserts for one sensor are serialized by locking its `sensors` row
//! (`FOR UPDATE`) for the duration of the transaction. Readings are scoped to
//! the sensor row's `generation`, so per-sensor queries never see the history
//! of a deleted sensor that shared the id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};

use super::Store;
use crate::error::{Error, Result};
use crate::models::{
    InsertOutcome, NewSensor, NewTree, Page, Sensor, SensorChanges, SensorReading, SensorStatus,
    TimeRange, Tree, TreeLocation, UplinkMetadata, Watermark,
};

// ---

const SENSOR_COLUMNS: &str = "id, status, latitude, longitude, created_at, updated_at";

const READING_COLUMNS: &str =
    "r.id, r.sensor_id, r.received_at, r.battery, r.humidity, r.temperature, r.watermarks, r.raw";

const TREE_COLUMNS: &str = "id, species, tree_number, age, latitude, longitude, address, \
                            additional_info, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct ReadingRow {
    id: i64,
    sensor_id: String,
    received_at: Option<DateTime<Utc>>,
    battery: f64,
    humidity: i32,
    temperature: f64,
    watermarks: Json<Vec<Watermark>>,
    raw: Json<UplinkMetadata>,
}

impl From<ReadingRow> for SensorReading {
    fn from(row: ReadingRow) -> Self {
        SensorReading {
            id: row.id,
            sensor_id: row.sensor_id,
            received_at: row.received_at,
            battery: row.battery,
            humidity: row.humidity,
            temperature: row.temperature,
            watermarks: row.watermarks.0,
            raw: row.raw.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TreeRow {
    id: i64,
    species: String,
    tree_number: String,
    age: i32,
    latitude: f64,
    longitude: f64,
    address: String,
    additional_info: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TreeRow> for Tree {
    fn from(row: TreeRow) -> Self {
        Tree {
            id: row.id,
            species: row.species,
            tree_number: row.tree_number,
            age: row.age,
            location: TreeLocation {
                latitude: row.latitude,
                longitude: row.longitude,
                address: row.address,
                additional_info: row.additional_info,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Wrap a driver error once, logging the original.
fn storage(op: &str, e: sqlx::Error) -> Error {
    // ---
    tracing::error!("Storage failure during {}: {}", op, e);
    match &e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => Error::StorageUnavailable,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(format!("{op} violates a uniqueness constraint"))
        }
        _ => Error::Internal(format!("storage failure during {op}")),
    }
}

fn sensor_not_found(id: &str) -> Error {
    Error::not_found(format!("sensor '{id}'"))
}

fn tree_not_found(id: i64) -> Error {
    Error::not_found(format!("tree {id}"))
}

fn ensure_readings_belong(sensor_id: &str, readings: &[SensorReading]) -> Result<()> {
    match readings.iter().find(|r| r.sensor_id != sensor_id) {
        Some(r) => Err(Error::BadRequest(format!(
            "reading for '{}' cannot be stored under sensor '{}'",
            r.sensor_id, sensor_id
        ))),
        None => Ok(()),
    }
}

/// Lock the sensor row for the rest of the transaction and return its
/// generation.
async fn lock_sensor(conn: &mut PgConnection, id: &str) -> Result<i64> {
    // ---
    sqlx::query_scalar::<_, i64>("SELECT generation FROM sensors WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| storage("lock_sensor", e))?
        .ok_or_else(|| sensor_not_found(id))
}

async fn tree_exists(conn: &mut PgConnection, id: i64) -> Result<()> {
    // ---
    sqlx::query_scalar::<_, i64>("SELECT id FROM trees WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| storage("tree_exists", e))?
        .map(|_| ())
        .ok_or_else(|| tree_not_found(id))
}

/// Insert one reading for an already-locked sensor and advance its pointer.
async fn insert_locked(
    conn: &mut PgConnection,
    generation: i64,
    reading: &SensorReading,
) -> Result<InsertOutcome> {
    // ---
    let effective_at = reading.effective_at(Utc::now());
    let frame_counter = reading.raw.frame_counter();

    let inserted: Option<ReadingRow> = sqlx::query_as(&format!(
        r#"
        INSERT INTO sensor_readings AS r (
            sensor_id, generation, received_at, effective_at, frame_counter,
            battery, humidity, temperature, watermarks, raw
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (sensor_id, generation, effective_at, frame_counter) DO NOTHING
        RETURNING {READING_COLUMNS}
        "#
    ))
    .bind(&reading.sensor_id)
    .bind(generation)
    .bind(reading.received_at)
    .bind(effective_at)
    .bind(frame_counter)
    .bind(reading.battery)
    .bind(reading.humidity)
    .bind(reading.temperature)
    .bind(Json(&reading.watermarks))
    .bind(Json(&reading.raw))
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| storage("insert_reading", e))?;

    let Some(row) = inserted else {
        let existing: ReadingRow = sqlx::query_as(&format!(
            r#"
            SELECT {READING_COLUMNS} FROM sensor_readings r
            WHERE r.sensor_id = $1 AND r.generation = $2
              AND r.effective_at = $3 AND r.frame_counter = $4
            "#
        ))
        .bind(&reading.sensor_id)
        .bind(generation)
        .bind(effective_at)
        .bind(frame_counter)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| storage("insert_reading", e))?;

        tracing::debug!(
            "Duplicate reading for sensor {} (existing id {})",
            reading.sensor_id,
            existing.id
        );
        return Ok(InsertOutcome::Duplicate(existing.into()));
    };

    sqlx::query(
        r#"
        INSERT INTO sensor_latest AS l (sensor_id, reading_id, effective_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (sensor_id) DO UPDATE
            SET reading_id = EXCLUDED.reading_id,
                effective_at = EXCLUDED.effective_at
            WHERE (EXCLUDED.effective_at, EXCLUDED.reading_id) > (l.effective_at, l.reading_id)
        "#,
    )
    .bind(&row.sensor_id)
    .bind(row.id)
    .bind(effective_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| storage("update_latest", e))?;

    Ok(InsertOutcome::Created(row.into()))
}

/// [`Store`] backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_sensor(&self, sensor: NewSensor, readings: &[SensorReading]) -> Result<Sensor> {
        // ---
        ensure_readings_belong(&sensor.id, readings)?;
        let mut tx = self.pool.begin().await.map_err(|e| storage("begin", e))?;

        let created: Option<Sensor> = sqlx::query_as(&format!(
            r#"
            INSERT INTO sensors (id, status, latitude, longitude)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            RETURNING {SENSOR_COLUMNS}
            "#
        ))
        .bind(&sensor.id)
        .bind(sensor.status)
        .bind(sensor.latitude)
        .bind(sensor.longitude)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage("create_sensor", e))?;

        let created =
            created.ok_or_else(|| Error::Conflict(format!("sensor '{}' already exists", sensor.id)))?;

        let generation = lock_sensor(&mut tx, &created.id).await?;
        for reading in readings {
            // Dropping `tx` on error rolls the sensor row back.
            insert_locked(&mut tx, generation, reading).await?;
        }

        tx.commit().await.map_err(|e| storage("commit", e))?;
        Ok(created)
    }

    async fn update_sensor(
        &self,
        id: &str,
        changes: SensorChanges,
        readings: &[SensorReading],
    ) -> Result<Sensor> {
        // ---
        ensure_readings_belong(id, readings)?;
        let mut tx = self.pool.begin().await.map_err(|e| storage("begin", e))?;
        let generation = lock_sensor(&mut tx, id).await?;

        for reading in readings {
            insert_locked(&mut tx, generation, reading).await?;
        }

        // A no-op update leaves `updated_at` alone.
        let touched = !changes.is_empty() || !readings.is_empty();

        let updated: Sensor = sqlx::query_as(&format!(
            r#"
            UPDATE sensors SET
                status     = COALESCE($2, status),
                latitude   = COALESCE($3, latitude),
                longitude  = COALESCE($4, longitude),
                updated_at = CASE WHEN $5 THEN now() ELSE updated_at END
            WHERE id = $1
            RETURNING {SENSOR_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(changes.status)
        .bind(changes.latitude)
        .bind(changes.longitude)
        .bind(touched)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| storage("update_sensor", e))?;

        tx.commit().await.map_err(|e| storage("commit", e))?;
        Ok(updated)
    }

    async fn delete_sensor(&self, id: &str) -> Result<()> {
        // ---
        // Tree assignments and the latest pointer go with the row (ON DELETE
        // CASCADE). Readings stay, tied to a generation no live row carries.
        let result = sqlx::query("DELETE FROM sensors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("delete_sensor", e))?;

        if result.rows_affected() == 0 {
            return Err(sensor_not_found(id));
        }
        Ok(())
    }

    async fn get_sensor(&self, id: &str) -> Result<Sensor> {
        // ---
        sqlx::query_as(&format!("SELECT {SENSOR_COLUMNS} FROM sensors WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("get_sensor", e))?
            .ok_or_else(|| sensor_not_found(id))
    }

    async fn list_sensors(
        &self,
        status: Option<SensorStatus>,
        page: Page,
    ) -> Result<(Vec<Sensor>, u64)> {
        // ---
        let sensors: Vec<Sensor> = sqlx::query_as(&format!(
            r#"
            SELECT {SENSOR_COLUMNS} FROM sensors
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(status)
        .bind(i64::from(page.limit))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage("list_sensors", e))?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sensors WHERE ($1::text IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage("list_sensors", e))?;

        Ok((sensors, total as u64))
    }

    async fn insert_reading(&self, reading: &SensorReading) -> Result<InsertOutcome> {
        // ---
        let mut tx = self.pool.begin().await.map_err(|e| storage("begin", e))?;
        let generation = lock_sensor(&mut tx, &reading.sensor_id).await?;
        let outcome = insert_locked(&mut tx, generation, reading).await?;
        tx.commit().await.map_err(|e| storage("commit", e))?;
        Ok(outcome)
    }

    async fn latest_reading(&self, sensor_id: &str) -> Result<SensorReading> {
        // ---
        let row: Option<ReadingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM sensor_latest l
            JOIN sensor_readings r ON r.id = l.reading_id
            WHERE l.sensor_id = $1
            "#
        ))
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage("latest_reading", e))?;

        row.map(Into::into)
            .ok_or_else(|| Error::not_found(format!("reading for sensor '{sensor_id}'")))
    }

    async fn readings_by_sensor(
        &self,
        sensor_id: &str,
        page: Page,
        range: TimeRange,
    ) -> Result<(Vec<SensorReading>, u64)> {
        // ---
        const FILTER: &str = "r.sensor_id = $1 \
            AND r.generation = (SELECT generation FROM sensors WHERE id = $1) \
            AND ($2::timestamptz IS NULL OR r.effective_at >= $2) \
            AND ($3::timestamptz IS NULL OR r.effective_at <= $3)";

        let rows: Vec<ReadingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {READING_COLUMNS} FROM sensor_readings r
            WHERE {FILTER}
            ORDER BY r.effective_at DESC, r.id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(sensor_id)
        .bind(range.start)
        .bind(range.end)
        .bind(i64::from(page.limit))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage("readings_by_sensor", e))?;

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM sensor_readings r WHERE {FILTER}"))
                .bind(sensor_id)
                .bind(range.start)
                .bind(range.end)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| storage("readings_by_sensor", e))?;

        Ok((rows.into_iter().map(Into::into).collect(), total as u64))
    }

    async fn readings_by_tree(&self, tree_id: i64) -> Result<Vec<SensorReading>> {
        // ---
        let mut conn = self.pool.acquire().await.map_err(|e| storage("acquire", e))?;
        tree_exists(&mut conn, tree_id).await?;

        let rows: Vec<ReadingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM sensor_readings r
            JOIN tree_sensors ts ON ts.sensor_id = r.sensor_id
            JOIN sensors s ON s.id = ts.sensor_id AND s.generation = r.generation
            WHERE ts.tree_id = $1
            ORDER BY r.sensor_id, r.effective_at DESC, r.id DESC
            "#
        ))
        .bind(tree_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| storage("readings_by_tree", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn reading_by_id(&self, id: i64) -> Result<SensorReading> {
        // ---
        let row: Option<ReadingRow> = sqlx::query_as(&format!(
            "SELECT {READING_COLUMNS} FROM sensor_readings r WHERE r.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage("reading_by_id", e))?;

        row.map(Into::into)
            .ok_or_else(|| Error::not_found(format!("reading {id}")))
    }

    async fn first_reading(&self) -> Result<SensorReading> {
        // ---
        let row: Option<ReadingRow> = sqlx::query_as(&format!(
            "SELECT {READING_COLUMNS} FROM sensor_readings r ORDER BY r.effective_at, r.id LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage("first_reading", e))?;

        row.map(Into::into)
            .ok_or_else(|| Error::not_found("first reading"))
    }

    async fn create_tree(&self, tree: NewTree) -> Result<Tree> {
        // ---
        let row: TreeRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO trees (species, tree_number, age, latitude, longitude, address, additional_info)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {TREE_COLUMNS}
            "#
        ))
        .bind(&tree.species)
        .bind(&tree.tree_number)
        .bind(tree.age)
        .bind(tree.location.latitude)
        .bind(tree.location.longitude)
        .bind(&tree.location.address)
        .bind(&tree.location.additional_info)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage("create_tree", e))?;

        Ok(row.into())
    }

    async fn get_tree(&self, id: i64) -> Result<Tree> {
        // ---
        let row: Option<TreeRow> =
            sqlx::query_as(&format!("SELECT {TREE_COLUMNS} FROM trees WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage("get_tree", e))?;

        row.map(Into::into).ok_or_else(|| tree_not_found(id))
    }

    async fn list_trees(&self) -> Result<Vec<Tree>> {
        // ---
        let rows: Vec<TreeRow> =
            sqlx::query_as(&format!("SELECT {TREE_COLUMNS} FROM trees ORDER BY id"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage("list_trees", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn tree_sensor_ids(&self, tree_id: i64) -> Result<Vec<String>> {
        // ---
        let mut conn = self.pool.acquire().await.map_err(|e| storage("acquire", e))?;
        tree_exists(&mut conn, tree_id).await?;

        sqlx::query_scalar(
            "SELECT sensor_id FROM tree_sensors WHERE tree_id = $1 ORDER BY sensor_id",
        )
        .bind(tree_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| storage("tree_sensor_ids", e))
    }

    async fn assign_sensor(&self, tree_id: i64, sensor_id: &str) -> Result<()> {
        // ---
        let mut tx = self.pool.begin().await.map_err(|e| storage("begin", e))?;
        tree_exists(&mut tx, tree_id).await?;
        lock_sensor(&mut tx, sensor_id).await?;

        sqlx::query(
            "INSERT INTO tree_sensors (tree_id, sensor_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(tree_id)
        .bind(sensor_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage("assign_sensor", e))?;

        tx.commit().await.map_err(|e| storage("commit", e))
    }

    async fn unassign_sensor(&self, tree_id: i64, sensor_id: &str) -> Result<()> {
        // ---
        let mut conn = self.pool.acquire().await.map_err(|e| storage("acquire", e))?;
        tree_exists(&mut conn, tree_id).await?;

        let result = sqlx::query("DELETE FROM tree_sensors WHERE tree_id = $1 AND sensor_id = $2")
            .bind(tree_id)
            .bind(sensor_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| storage("unassign_sensor", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "sensor '{sensor_id}' on tree {tree_id}"
            )));
        }
        Ok(())
    }
}
