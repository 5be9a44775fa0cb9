use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db;
use crate::errors::{Error, Result};
use crate::model::{HistoryResponse, Patient, Reading, ReadingRow};

const PAGE_SIZE_DEFAULT: i64 = 50;
const PAGE_SIZE_MAX: i64 = 500;

const READING_COLUMNS: &str = "id, patient_id, device_id, observed_at, recorded_at, \
                               heart_rate, bp_systolic, bp_diastolic, spo2, temp";

/// Newest reading for a patient: max `observed_at`, ties broken by max `id`
pub async fn latest(pool: &SqlitePool, patient_id: &str) -> Result<Reading> {
    if !db::patient_exists(pool, patient_id).await? {
        return Err(Error::NotFound(format!("patient {} not found", patient_id)));
    }

    let sql = format!(
        "SELECT {} FROM readings WHERE patient_id = ? ORDER BY observed_at DESC, id DESC LIMIT 1",
        READING_COLUMNS
    );
    let row = sqlx::query_as::<_, ReadingRow>(&sql)
        .bind(patient_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Reading::from(row)),
        None => Err(Error::NotFound(format!(
            "no readings for patient {}",
            patient_id
        ))),
    }
}

/// Paginated history in stable `observed_at ASC, id ASC` order
pub async fn history(
    pool: &SqlitePool,
    patient_id: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    page: Option<i64>,
    page_size: Option<i64>,
) -> Result<HistoryResponse> {
    let page = page.unwrap_or(1);
    if page < 1 {
        return Err(Error::Validation("page must be at least 1".to_string()));
    }

    let page_size = page_size.unwrap_or(PAGE_SIZE_DEFAULT);
    if page_size < 1 || page_size > PAGE_SIZE_MAX {
        return Err(Error::Validation(format!(
            "page_size must be between 1 and {}",
            PAGE_SIZE_MAX
        )));
    }

    if !db::patient_exists(pool, patient_id).await? {
        return Err(Error::NotFound(format!("patient {} not found", patient_id)));
    }

    let mut conditions = vec!["patient_id = ?"];
    if from.is_some() {
        conditions.push("observed_at >= ?");
    }
    if to.is_some() {
        conditions.push("observed_at <= ?");
    }
    let where_clause = conditions.join(" AND ");

    let count_sql = format!("SELECT COUNT(*) FROM readings WHERE {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(patient_id);
    if let Some(from) = from {
        count_query = count_query.bind(from);
    }
    if let Some(to) = to {
        count_query = count_query.bind(to);
    }

    let rows_sql = format!(
        "SELECT {} FROM readings WHERE {} ORDER BY observed_at ASC, id ASC LIMIT ? OFFSET ?",
        READING_COLUMNS, where_clause
    );
    let mut rows_query = sqlx::query_as::<_, ReadingRow>(&rows_sql).bind(patient_id);
    if let Some(from) = from {
        rows_query = rows_query.bind(from);
    }
    if let Some(to) = to {
        rows_query = rows_query.bind(to);
    }

    // Saturate so a page far past the data stays an empty page instead of
    // overflowing the offset.
    let offset = (page - 1).saturating_mul(page_size);

    // One read transaction so the count and the rows see the same snapshot.
    let mut tx = pool.begin().await?;
    let total_count = count_query.fetch_one(&mut *tx).await?;
    let rows = rows_query
        .bind(page_size)
        .bind(offset)
        .fetch_all(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(HistoryResponse {
        readings: rows.into_iter().map(Reading::from).collect(),
        total_count,
        page,
        page_size,
    })
}

pub async fn patients(pool: &SqlitePool) -> Result<Vec<Patient>> {
    db::list_patients(pool).await
}
