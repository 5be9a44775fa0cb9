use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::db::is_unique_violation;
use crate::errors::{Error, Result};
use crate::metrics::CONFLICTS_TOTAL;

pub const STATE_RESERVED: &str = "reserved";
pub const STATE_FINALIZED: &str = "finalized";

const POLL_ATTEMPTS: u32 = 20;
const POLL_INTERVAL_MS: u64 = 25;

/// Ownership handle for an in-flight reservation. Only the holder of the
/// current token may finalize or release the record.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub device_id: String,
    pub idem_key: String,
    pub token: String,
}

/// Outcome of resolving an idempotency key
#[derive(Debug)]
pub enum Resolution {
    /// The caller owns the key and must store the reading, then finalize
    Proceed(Reservation),
    /// A finalized record with the same body hash exists
    Replay(serde_json::Value),
}

#[derive(Debug, sqlx::FromRow)]
struct IdempotencyRecord {
    body_hash: String,
    state: String,
    created_at: DateTime<Utc>,
    response_json: Option<String>,
}

/// Resolves one `(device_id, idem_key)` pair against the stored records.
///
/// The unique constraint on the primary key decides ownership: the first
/// insert wins, everyone else observes the winner's record. A `reserved`
/// record older than `stale_after` is treated as abandoned and taken over.
pub async fn resolve(
    pool: &SqlitePool,
    device_id: &str,
    idem_key: &str,
    body_hash: &str,
    stale_after: chrono::Duration,
) -> Result<Resolution> {
    if let Some(reservation) = try_reserve(pool, device_id, idem_key, body_hash).await? {
        return Ok(Resolution::Proceed(reservation));
    }

    for _ in 0..POLL_ATTEMPTS {
        match fetch_record(pool, device_id, idem_key).await? {
            None => {
                // The previous owner released its reservation; try to take it.
                if let Some(reservation) =
                    try_reserve(pool, device_id, idem_key, body_hash).await?
                {
                    return Ok(Resolution::Proceed(reservation));
                }
            }
            Some(record) => {
                if record.body_hash != body_hash {
                    CONFLICTS_TOTAL.inc();
                    return Err(Error::Conflict(format!(
                        "Idempotency-Key {} was already used with a different payload",
                        idem_key
                    )));
                }

                if record.state == STATE_FINALIZED {
                    let body = record.response_json.ok_or_else(|| {
                        Error::Storage(format!(
                            "finalized record for key {} has no stored response",
                            idem_key
                        ))
                    })?;
                    return Ok(Resolution::Replay(serde_json::from_str(&body)?));
                }

                let stale_before = Utc::now() - stale_after;
                if record.created_at <= stale_before {
                    if let Some(reservation) =
                        try_reclaim(pool, device_id, idem_key, stale_before).await?
                    {
                        warn!(
                            "Reclaimed stale reservation for device {} key {}",
                            device_id, idem_key
                        );
                        return Ok(Resolution::Proceed(reservation));
                    }
                    // Another worker reclaimed first; keep watching its record.
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }

    Err(Error::Storage(format!(
        "Timed out waiting for a concurrent request with Idempotency-Key {}",
        idem_key
    )))
}

/// Marks the reservation finalized and stores the response body. Runs on the
/// caller's transaction so the reading insert and the state flip commit
/// together. Returns false when the token no longer owns the record, in which
/// case the caller must roll back and resolve again.
pub async fn finalize(
    conn: &mut SqliteConnection,
    reservation: &Reservation,
    reading_id: i64,
    response_json: &str,
) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE idempotency_records
        SET state = ?, reading_id = ?, response_json = ?
        WHERE device_id = ? AND idem_key = ? AND state = ? AND reservation_token = ?
        "#,
    )
    .bind(STATE_FINALIZED)
    .bind(reading_id)
    .bind(response_json)
    .bind(&reservation.device_id)
    .bind(&reservation.idem_key)
    .bind(STATE_RESERVED)
    .bind(&reservation.token)
    .execute(conn)
    .await?;

    Ok(updated.rows_affected() == 1)
}

/// Drops an unfinalized reservation so a failed request does not block the
/// key until the staleness window expires.
pub async fn release(pool: &SqlitePool, reservation: &Reservation) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM idempotency_records
        WHERE device_id = ? AND idem_key = ? AND state = ? AND reservation_token = ?
        "#,
    )
    .bind(&reservation.device_id)
    .bind(&reservation.idem_key)
    .bind(STATE_RESERVED)
    .bind(&reservation.token)
    .execute(pool)
    .await?;
    Ok(())
}

async fn try_reserve(
    pool: &SqlitePool,
    device_id: &str,
    idem_key: &str,
    body_hash: &str,
) -> Result<Option<Reservation>> {
    let token = Uuid::new_v4().to_string();
    let result = sqlx::query(
        r#"
        INSERT INTO idempotency_records
            (device_id, idem_key, body_hash, state, reservation_token, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(device_id)
    .bind(idem_key)
    .bind(body_hash)
    .bind(STATE_RESERVED)
    .bind(&token)
    .bind(Utc::now())
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(Some(Reservation {
            device_id: device_id.to_string(),
            idem_key: idem_key.to_string(),
            token,
        })),
        Err(e) if is_unique_violation(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Takes over a reservation that is still `reserved` and older than the
/// staleness cutoff. The conditional update is atomic: exactly one of the
/// competing reclaimers sees a row change, and installing a fresh token
/// fences out the original owner's finalize.
async fn try_reclaim(
    pool: &SqlitePool,
    device_id: &str,
    idem_key: &str,
    stale_before: DateTime<Utc>,
) -> Result<Option<Reservation>> {
    let token = Uuid::new_v4().to_string();
    let updated = sqlx::query(
        r#"
        UPDATE idempotency_records
        SET reservation_token = ?, created_at = ?
        WHERE device_id = ? AND idem_key = ? AND state = ? AND created_at <= ?
        "#,
    )
    .bind(&token)
    .bind(Utc::now())
    .bind(device_id)
    .bind(idem_key)
    .bind(STATE_RESERVED)
    .bind(stale_before)
    .execute(pool)
    .await?;

    if updated.rows_affected() == 1 {
        Ok(Some(Reservation {
            device_id: device_id.to_string(),
            idem_key: idem_key.to_string(),
            token,
        }))
    } else {
        Ok(None)
    }
}

async fn fetch_record(
    pool: &SqlitePool,
    device_id: &str,
    idem_key: &str,
) -> Result<Option<IdempotencyRecord>> {
    let record = sqlx::query_as::<_, IdempotencyRecord>(
        r#"
        SELECT body_hash, state, created_at, response_json
        FROM idempotency_records
        WHERE device_id = ? AND idem_key = ?
        "#,
    )
    .bind(device_id)
    .bind(idem_key)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::VitalsPayload;

    async fn seeded_pool() -> SqlitePool {
        let pool = db::test_pool().await;
        db::ensure_patient(&pool, "p_001").await.unwrap();
        sqlx::query(
            "INSERT INTO devices (id, device_type, patient_id, key_salt, key_hash, registered_at)
             VALUES ('dev-1', 'monitor', 'p_001', 's', 'h', ?)",
        )
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn week() -> chrono::Duration {
        chrono::Duration::seconds(7 * 24 * 3600)
    }

    async fn stored_reading_id(pool: &SqlitePool) -> i64 {
        let payload = VitalsPayload {
            observed_at: Utc::now(),
            heart_rate: Some(70),
            bp: None,
            spo2: None,
            temp: None,
            device_id: None,
        };
        let mut conn = pool.acquire().await.unwrap();
        db::insert_reading(&mut conn, "p_001", "dev-1", &payload, Utc::now())
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_reserve_finalize_replay() {
        tokio_test::block_on(async {
            let pool = seeded_pool().await;

            let resolution = resolve(&pool, "dev-1", "key-1", "hash-a", week())
                .await
                .unwrap();
            let reservation = match resolution {
                Resolution::Proceed(r) => r,
                other => panic!("expected Proceed, got {:?}", other),
            };

            let reading_id = stored_reading_id(&pool).await;
            let mut conn = pool.acquire().await.unwrap();
            let finalized = finalize(
                &mut conn,
                &reservation,
                reading_id,
                r#"{"status":"stored"}"#,
            )
            .await
            .unwrap();
            assert!(finalized);
            drop(conn);

            let resolution = resolve(&pool, "dev-1", "key-1", "hash-a", week())
                .await
                .unwrap();
            match resolution {
                Resolution::Replay(body) => assert_eq!(body["status"], "stored"),
                other => panic!("expected Replay, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_conflict_on_different_body() {
        tokio_test::block_on(async {
            let pool = seeded_pool().await;

            let _reservation = resolve(&pool, "dev-1", "key-1", "hash-a", week())
                .await
                .unwrap();
            let err = resolve(&pool, "dev-1", "key-1", "hash-b", week())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Conflict(_)));
        });
    }

    #[test]
    fn test_same_key_different_devices_do_not_collide() {
        tokio_test::block_on(async {
            let pool = seeded_pool().await;
            sqlx::query(
                "INSERT INTO devices (id, device_type, patient_id, key_salt, key_hash, registered_at)
                 VALUES ('dev-2', 'monitor', 'p_001', 's', 'h', ?)",
            )
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();

            let first = resolve(&pool, "dev-1", "key-1", "hash-a", week())
                .await
                .unwrap();
            let second = resolve(&pool, "dev-2", "key-1", "hash-b", week())
                .await
                .unwrap();
            assert!(matches!(first, Resolution::Proceed(_)));
            assert!(matches!(second, Resolution::Proceed(_)));
        });
    }

    #[test]
    fn test_release_frees_the_key() {
        tokio_test::block_on(async {
            let pool = seeded_pool().await;

            let reservation = match resolve(&pool, "dev-1", "key-1", "hash-a", week())
                .await
                .unwrap()
            {
                Resolution::Proceed(r) => r,
                other => panic!("expected Proceed, got {:?}", other),
            };
            release(&pool, &reservation).await.unwrap();

            let resolution = resolve(&pool, "dev-1", "key-1", "hash-a", week())
                .await
                .unwrap();
            assert!(matches!(resolution, Resolution::Proceed(_)));
        });
    }

    #[test]
    fn test_stale_reservation_is_reclaimed() {
        tokio_test::block_on(async {
            let pool = seeded_pool().await;

            sqlx::query(
                "INSERT INTO idempotency_records
                     (device_id, idem_key, body_hash, state, reservation_token, created_at)
                 VALUES ('dev-1', 'key-1', 'hash-a', 'reserved', 'dead-token', ?)",
            )
            .bind(Utc::now() - chrono::Duration::seconds(120))
            .execute(&pool)
            .await
            .unwrap();

            let resolution = resolve(
                &pool,
                "dev-1",
                "key-1",
                "hash-a",
                chrono::Duration::seconds(30),
            )
            .await
            .unwrap();
            let reservation = match resolution {
                Resolution::Proceed(r) => r,
                other => panic!("expected Proceed, got {:?}", other),
            };
            assert_ne!(reservation.token, "dead-token");

            // The original owner's finalize must now miss.
            let zombie = Reservation {
                device_id: "dev-1".to_string(),
                idem_key: "key-1".to_string(),
                token: "dead-token".to_string(),
            };
            let reading_id = stored_reading_id(&pool).await;
            let mut conn = pool.acquire().await.unwrap();
            let finalized = finalize(&mut conn, &zombie, reading_id, "{}").await.unwrap();
            assert!(!finalized);
        });
    }

    #[test]
    fn test_fresh_reservation_times_out_instead_of_reclaiming() {
        tokio_test::block_on(async {
            let pool = seeded_pool().await;

            let _owner = resolve(&pool, "dev-1", "key-1", "hash-a", week())
                .await
                .unwrap();
            let err = resolve(&pool, "dev-1", "key-1", "hash-a", week())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Storage(_)));

            // The owner's record is untouched.
            let record = fetch_record(&pool, "dev-1", "key-1").await.unwrap().unwrap();
            assert_eq!(record.state, STATE_RESERVED);
        });
    }
}
