use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Blood pressure measurement in mmHg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloodPressure {
    pub systolic: i64,
    pub diastolic: i64,
}

/// Vital-sign ingestion payload
///
/// `observed_at` also accepts the legacy `timestamp` field name. At least one
/// vital must be present; ranges are enforced in `validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VitalsPayload {
    #[serde(alias = "timestamp")]
    pub observed_at: DateTime<Utc>,
    pub heart_rate: Option<i64>,
    pub bp: Option<BloodPressure>,
    pub spo2: Option<i64>,
    pub temp: Option<f64>,
    pub device_id: Option<String>,
}

/// One stored reading as served by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub id: i64,
    pub patient_id: String,
    pub device_id: String,
    pub observed_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub heart_rate: Option<i64>,
    pub bp: Option<BloodPressure>,
    pub spo2: Option<i64>,
    pub temp: Option<f64>,
}

/// Flat row shape of the `readings` table
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReadingRow {
    pub id: i64,
    pub patient_id: String,
    pub device_id: String,
    pub observed_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub heart_rate: Option<i64>,
    pub bp_systolic: Option<i64>,
    pub bp_diastolic: Option<i64>,
    pub spo2: Option<i64>,
    pub temp: Option<f64>,
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        let bp = match (row.bp_systolic, row.bp_diastolic) {
            (Some(systolic), Some(diastolic)) => Some(BloodPressure {
                systolic,
                diastolic,
            }),
            _ => None,
        };
        Reading {
            id: row.id,
            patient_id: row.patient_id,
            device_id: row.device_id,
            observed_at: row.observed_at,
            recorded_at: row.recorded_at,
            heart_rate: row.heart_rate,
            bp,
            spo2: row.spo2,
            temp: row.temp,
        }
    }
}

/// Hospital patient record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Patient {
    pub id: String,
    pub name: String,
    pub room: Option<i64>,
}

/// Device registration request
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDevice {
    pub device_id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub patient_id: String,
}

/// Device registration response; the plaintext key is returned exactly once
#[derive(Debug, Serialize)]
pub struct RegisteredDevice {
    pub device_id: String,
    pub api_key: String,
}

/// Paginated history response
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub readings: Vec<Reading>,
    pub total_count: i64,
    pub page: i64,
    pub page_size: i64,
}
