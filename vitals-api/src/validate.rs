use chrono::{Duration, Utc};

use crate::errors::{Error, Result};
use crate::model::VitalsPayload;

const HEART_RATE_MIN: i64 = 0;
const HEART_RATE_MAX: i64 = 300;
const BP_MIN: i64 = 1;
const BP_MAX: i64 = 300;
const SPO2_MIN: i64 = 0;
const SPO2_MAX: i64 = 100;
const TEMP_MIN: f64 = 25.0;
const TEMP_MAX: f64 = 45.0;
const MAX_FUTURE_SKEW_SECS: i64 = 300;

/// Validates a vitals payload against the authenticated device
pub fn validate(payload: &VitalsPayload, device_id: &str) -> Result<()> {
    // Validate observed_at (allow bounded clock skew)
    if payload.observed_at > Utc::now() + Duration::seconds(MAX_FUTURE_SKEW_SECS) {
        return Err(Error::Validation(format!(
            "observed_at {} is more than {}s in the future",
            payload.observed_at, MAX_FUTURE_SKEW_SECS
        )));
    }

    // At least one vital sign must be present
    if payload.heart_rate.is_none()
        && payload.bp.is_none()
        && payload.spo2.is_none()
        && payload.temp.is_none()
    {
        return Err(Error::Validation(
            "At least one vital sign is required".to_string(),
        ));
    }

    // Validate heart rate
    if let Some(heart_rate) = payload.heart_rate {
        if heart_rate < HEART_RATE_MIN || heart_rate > HEART_RATE_MAX {
            return Err(Error::Validation(format!(
                "Heart rate {} out of range [{}, {}]",
                heart_rate, HEART_RATE_MIN, HEART_RATE_MAX
            )));
        }
    }

    // Validate blood pressure
    if let Some(bp) = &payload.bp {
        if bp.systolic < BP_MIN || bp.systolic > BP_MAX {
            return Err(Error::Validation(format!(
                "Systolic pressure {} out of range [{}, {}]",
                bp.systolic, BP_MIN, BP_MAX
            )));
        }
        if bp.diastolic < BP_MIN || bp.diastolic > BP_MAX {
            return Err(Error::Validation(format!(
                "Diastolic pressure {} out of range [{}, {}]",
                bp.diastolic, BP_MIN, BP_MAX
            )));
        }
    }

    // Validate SpO2
    if let Some(spo2) = payload.spo2 {
        if spo2 < SPO2_MIN || spo2 > SPO2_MAX {
            return Err(Error::Validation(format!(
                "SpO2 {} out of range [{}, {}]",
                spo2, SPO2_MIN, SPO2_MAX
            )));
        }
    }

    // Validate temperature
    if let Some(temp) = payload.temp {
        if temp < TEMP_MIN || temp > TEMP_MAX {
            return Err(Error::Validation(format!(
                "Temperature {} out of range [{}, {}]",
                temp, TEMP_MIN, TEMP_MAX
            )));
        }
    }

    // A device_id in the body must match the authenticated device
    if let Some(body_device) = &payload.device_id {
        if body_device != device_id {
            return Err(Error::Validation(format!(
                "device_id {} does not match the authenticated device",
                body_device
            )));
        }
    }

    Ok(())
}
