use chrono::{DateTime, Utc};
use serde::Serialize;

/// Vital-sign observation posted by a simulated device
#[derive(Debug, Clone, Serialize)]
pub struct Vitals {
    pub observed_at: DateTime<Utc>,
    pub heart_rate: i64,
    pub bp: BloodPressure,
    pub spo2: i64,
    pub temp: f64,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BloodPressure {
    pub systolic: i64,
    pub diastolic: i64,
}
