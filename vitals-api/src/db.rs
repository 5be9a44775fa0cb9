use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::model::{Patient, ReadingRow, VitalsPayload};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS patients (
        id   TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        room INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id            TEXT PRIMARY KEY,
        device_type   TEXT NOT NULL,
        patient_id    TEXT NOT NULL REFERENCES patients(id),
        key_salt      TEXT NOT NULL,
        key_hash      TEXT NOT NULL,
        registered_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        patient_id   TEXT NOT NULL REFERENCES patients(id),
        device_id    TEXT NOT NULL REFERENCES devices(id),
        observed_at  TEXT NOT NULL,
        recorded_at  TEXT NOT NULL,
        heart_rate   INTEGER,
        bp_systolic  INTEGER,
        bp_diastolic INTEGER,
        spo2         INTEGER,
        temp         REAL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_readings_patient_observed
        ON readings (patient_id, observed_at, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_records (
        device_id         TEXT NOT NULL REFERENCES devices(id),
        idem_key          TEXT NOT NULL,
        body_hash         TEXT NOT NULL,
        state             TEXT NOT NULL,
        reservation_token TEXT NOT NULL,
        reading_id        INTEGER REFERENCES readings(id),
        response_json     TEXT,
        created_at        TEXT NOT NULL,
        PRIMARY KEY (device_id, idem_key)
    )
    "#,
];

pub async fn make_pool(database_url: &str) -> Result<SqlitePool> {
    info!("Connecting to database...");
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    info!("Database connection established");
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Database schema ready");
    Ok(())
}

pub async fn seed_demo_patients(pool: &SqlitePool) -> Result<()> {
    let demo = [("p_001", "John Doe", 101_i64), ("p_002", "Jane Smith", 102)];
    for (id, name, room) in demo {
        sqlx::query("INSERT OR IGNORE INTO patients (id, name, room) VALUES (?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(room)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Creates the patient row if it does not exist yet
pub async fn ensure_patient(pool: &SqlitePool, patient_id: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO patients (id, name, room) VALUES (?, ?, NULL)")
        .bind(patient_id)
        .bind(patient_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn patient_exists(pool: &SqlitePool, patient_id: &str) -> Result<bool> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM patients WHERE id = ?")
        .bind(patient_id)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

pub async fn list_patients(pool: &SqlitePool) -> Result<Vec<Patient>> {
    let patients =
        sqlx::query_as::<_, Patient>("SELECT id, name, room FROM patients ORDER BY id")
            .fetch_all(pool)
            .await?;
    Ok(patients)
}

/// Inserts one reading and returns the stored row
pub async fn insert_reading(
    conn: &mut SqliteConnection,
    patient_id: &str,
    device_id: &str,
    payload: &VitalsPayload,
    recorded_at: DateTime<Utc>,
) -> Result<ReadingRow> {
    let (bp_systolic, bp_diastolic) = match &payload.bp {
        Some(bp) => (Some(bp.systolic), Some(bp.diastolic)),
        None => (None, None),
    };

    let row = sqlx::query_as::<_, ReadingRow>(
        r#"
        INSERT INTO readings (patient_id, device_id, observed_at, recorded_at,
                              heart_rate, bp_systolic, bp_diastolic, spo2, temp)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id, patient_id, device_id, observed_at, recorded_at,
                  heart_rate, bp_systolic, bp_diastolic, spo2, temp
        "#,
    )
    .bind(patient_id)
    .bind(device_id)
    .bind(payload.observed_at)
    .bind(recorded_at)
    .bind(payload.heart_rate)
    .bind(bp_systolic)
    .bind(bp_diastolic)
    .bind(payload.spo2)
    .bind(payload.temp)
    .fetch_one(conn)
    .await?;

    Ok(row)
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            // SQLite extended result codes for constraint violations
            db_err.code().is_some_and(|code| {
                code == "1555" || // primary key
                code == "2067" // unique index
            })
        }
        _ => false,
    }
}

/// In-memory pool for unit tests; a single connection so all queries
/// observe the same database.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();
    pool
}
