use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db;
use crate::errors::{Error, Result};
use crate::idempotency::{self, Resolution};
use crate::metrics::{
    INGEST_LATENCY_SECONDS, READINGS_STORED_TOTAL, REPLAYS_TOTAL, VALIDATION_FAILURES_TOTAL,
};
use crate::model::{Reading, VitalsPayload};
use crate::validate::validate;

const RESOLVE_ATTEMPTS: u32 = 3;

/// Result of one ingestion request
#[derive(Debug)]
pub struct IngestOutcome {
    pub body: serde_json::Value,
    pub replayed: bool,
}

/// Hex SHA-256 over the target patient and the canonical payload
/// serialization. Parsing and re-serializing the body normalizes field
/// order, whitespace and the legacy `timestamp` alias, so equivalent
/// requests hash equal, while reusing a key against a different patient
/// hashes differently and resolves as a conflict.
pub fn canonical_hash(patient_id: &str, payload: &VitalsPayload) -> Result<String> {
    let canonical = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(patient_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

/// Stores one reading at most once per `(device, Idempotency-Key)` pair.
///
/// Fresh keys insert the reading and finalize the reservation in a single
/// transaction; repeated keys replay the stored response; reused keys with a
/// different body are rejected as conflicts.
pub async fn ingest_reading(
    pool: &SqlitePool,
    patient_id: &str,
    device_id: &str,
    idem_key: &str,
    payload: &VitalsPayload,
    stale_after: chrono::Duration,
) -> Result<IngestOutcome> {
    let _timer = INGEST_LATENCY_SECONDS.start_timer();

    if let Err(e) = validate(payload, device_id) {
        VALIDATION_FAILURES_TOTAL.inc();
        return Err(e);
    }

    if !db::patient_exists(pool, patient_id).await? {
        return Err(Error::NotFound(format!("patient {} not found", patient_id)));
    }

    let body_hash = canonical_hash(patient_id, payload)?;

    for _ in 0..RESOLVE_ATTEMPTS {
        let reservation =
            match idempotency::resolve(pool, device_id, idem_key, &body_hash, stale_after).await? {
                Resolution::Replay(body) => {
                    REPLAYS_TOTAL.inc();
                    info!(
                        "Replayed stored response for device {} key {}",
                        device_id, idem_key
                    );
                    return Ok(IngestOutcome {
                        body,
                        replayed: true,
                    });
                }
                Resolution::Proceed(reservation) => reservation,
            };

        match store_and_finalize(pool, patient_id, device_id, payload, &reservation).await {
            Ok(Some(body)) => {
                READINGS_STORED_TOTAL.inc();
                return Ok(IngestOutcome {
                    body,
                    replayed: false,
                });
            }
            // Ownership was reclaimed mid-flight. Our write was rolled back;
            // the reclaimer's outcome is authoritative, so resolve again.
            Ok(None) => continue,
            Err(e) => {
                // Clear the reservation so the key is immediately retryable.
                if let Err(release_err) = idempotency::release(pool, &reservation).await {
                    warn!("Failed to release reservation for key {}: {}", idem_key, release_err);
                }
                return Err(e);
            }
        }
    }

    Err(Error::Storage(format!(
        "Could not settle Idempotency-Key {} after repeated ownership loss",
        idem_key
    )))
}

async fn store_and_finalize(
    pool: &SqlitePool,
    patient_id: &str,
    device_id: &str,
    payload: &VitalsPayload,
    reservation: &idempotency::Reservation,
) -> Result<Option<serde_json::Value>> {
    let mut tx = pool.begin().await?;

    let row = db::insert_reading(&mut tx, patient_id, device_id, payload, Utc::now()).await?;
    let reading = Reading::from(row);
    let reading_id = reading.id;
    let body = serde_json::json!({ "status": "stored", "reading": reading });
    let stored = body.to_string();

    if !idempotency::finalize(&mut tx, reservation, reading_id, &stored).await? {
        tx.rollback().await?;
        return Ok(None);
    }

    tx.commit().await?;
    info!(
        "Stored reading {} for patient {} from device {}",
        reading_id, patient_id, device_id
    );
    Ok(Some(body))
}
