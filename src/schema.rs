//! Database schema management for `greenspace-sensors`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs`, inside a single transaction.
//!
//! Readings carry no foreign key to `sensors`: deleting a sensor leaves its
//! history in place. Each `sensors` row draws a fresh `generation`, and
//! readings are stamped with the generation they were written under, so a
//! sensor re-created under an old id starts with an empty history.

use anyhow::Result;
use sqlx::PgPool;

// ---

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sensors (
        id          TEXT PRIMARY KEY CHECK (id <> ''),
        generation  BIGSERIAL        NOT NULL,
        status      TEXT             NOT NULL DEFAULT 'unknown'
                    CHECK (status IN ('online', 'offline', 'unknown')),
        latitude    DOUBLE PRECISION NOT NULL CHECK (latitude BETWEEN -90 AND 90),
        longitude   DOUBLE PRECISION NOT NULL CHECK (longitude BETWEEN -180 AND 180),
        created_at  TIMESTAMPTZ      NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ      NOT NULL DEFAULT now()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensor_readings (
        id             BIGSERIAL PRIMARY KEY,
        sensor_id      TEXT             NOT NULL CHECK (sensor_id <> ''),
        generation     BIGINT           NOT NULL,
        received_at    TIMESTAMPTZ,
        stored_at      TIMESTAMPTZ      NOT NULL DEFAULT now(),
        effective_at   TIMESTAMPTZ      NOT NULL,
        frame_counter  BIGINT           NOT NULL DEFAULT 0,
        battery        DOUBLE PRECISION NOT NULL DEFAULT 0,
        humidity       INTEGER          NOT NULL DEFAULT 0,
        temperature    DOUBLE PRECISION NOT NULL DEFAULT 0,
        watermarks     JSONB            NOT NULL DEFAULT '[]'::jsonb,
        raw            JSONB            NOT NULL DEFAULT '{}'::jsonb
    );
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_sensor_readings_dedup
        ON sensor_readings (sensor_id, generation, effective_at, frame_counter);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_readings_sensor_time
        ON sensor_readings (sensor_id, generation, effective_at DESC, id DESC);
    "#,
    // Latest-reading pointer, maintained in the same transaction as each insert.
    r#"
    CREATE TABLE IF NOT EXISTS sensor_latest (
        sensor_id     TEXT PRIMARY KEY REFERENCES sensors (id) ON DELETE CASCADE,
        reading_id    BIGINT      NOT NULL REFERENCES sensor_readings (id),
        effective_at  TIMESTAMPTZ NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trees (
        id               BIGSERIAL PRIMARY KEY,
        species          TEXT             NOT NULL,
        tree_number      TEXT             NOT NULL,
        age              INTEGER          NOT NULL DEFAULT 0,
        latitude         DOUBLE PRECISION NOT NULL,
        longitude        DOUBLE PRECISION NOT NULL,
        address          TEXT             NOT NULL DEFAULT '',
        additional_info  TEXT             NOT NULL DEFAULT '',
        created_at       TIMESTAMPTZ      NOT NULL DEFAULT now(),
        updated_at       TIMESTAMPTZ      NOT NULL DEFAULT now()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tree_sensors (
        tree_id    BIGINT NOT NULL REFERENCES trees (id) ON DELETE CASCADE,
        sensor_id  TEXT   NOT NULL REFERENCES sensors (id) ON DELETE CASCADE,
        PRIMARY KEY (tree_id, sensor_id)
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tree_sensors_sensor_id
        ON tree_sensors (sensor_id);
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist.
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for stmt in STATEMENTS {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::info!("Database schema ready ({} statements applied)", STATEMENTS.len());
    Ok(())
}
