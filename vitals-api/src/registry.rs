use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::db::{self, is_unique_violation};
use crate::errors::{Error, Result};
use crate::model::{RegisterDevice, RegisteredDevice};

/// Registers a device and returns its plaintext API key. The key is only
/// ever stored salted and hashed; this response is the one chance to read it.
pub async fn register_device(
    pool: &SqlitePool,
    request: &RegisterDevice,
) -> Result<RegisteredDevice> {
    if request.device_id.is_empty() || request.device_type.is_empty() {
        return Err(Error::Validation(
            "device_id and type must not be empty".to_string(),
        ));
    }
    if request.patient_id.is_empty() {
        return Err(Error::Validation("patient_id must not be empty".to_string()));
    }

    db::ensure_patient(pool, &request.patient_id).await?;

    let api_key = generate_key();
    let salt = generate_salt();
    let key_hash = hash_key(&salt, &api_key);

    let result = sqlx::query(
        r#"
        INSERT INTO devices (id, device_type, patient_id, key_salt, key_hash, registered_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&request.device_id)
    .bind(&request.device_type)
    .bind(&request.patient_id)
    .bind(&salt)
    .bind(&key_hash)
    .bind(Utc::now())
    .execute(pool)
    .await;

    match result {
        Ok(_) => {
            info!(
                "Registered device {} for patient {}",
                request.device_id, request.patient_id
            );
            Ok(RegisteredDevice {
                device_id: request.device_id.clone(),
                api_key,
            })
        }
        Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
            "device {} is already registered",
            request.device_id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Checks a presented API key against the stored salted hash
pub async fn verify_device_key(pool: &SqlitePool, device_id: &str, api_key: &str) -> Result<()> {
    let stored = sqlx::query_as::<_, (String, String)>(
        "SELECT key_salt, key_hash FROM devices WHERE id = ?",
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    let Some((salt, key_hash)) = stored else {
        return Err(Error::Auth);
    };

    let presented = hash_key(&salt, api_key);
    if bool::from(presented.as_bytes().ct_eq(key_hash.as_bytes())) {
        Ok(())
    } else {
        Err(Error::Auth)
    }
}

/// Constant-time master key comparison. Hashing both sides first keeps the
/// comparison length-independent.
pub fn master_key_matches(expected: &str, presented: &str) -> bool {
    let expected: [u8; 32] = Sha256::digest(expected.as_bytes()).into();
    let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
    expected.ct_eq(&presented).into()
}

fn generate_key() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

fn generate_salt() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn hash_key(salt: &str, api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}
