mod vitals;

use std::env;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use tracing::{error, info, warn};
use vitals::{BloodPressure, Vitals};

#[derive(Debug, Deserialize)]
struct RegisteredDevice {
    device_id: String,
    api_key: String,
}

#[tokio::main]
async fn main() {
    let base_url = env::var("API_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let master_key =
        env::var("DEVICE_MASTER_KEY").unwrap_or_else(|_| "dev-master-key".to_string());
    let num_devices: usize = env::var("DEVICES")
        .unwrap_or_else(|_| "5".to_string())
        .parse()
        .unwrap_or(5);
    let interval_ms: u64 = env::var("INTERVAL_MS")
        .unwrap_or_else(|_| "1000".to_string())
        .parse()
        .unwrap_or(1000);

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting vitals simulator");
    info!(
        "API: {}, devices: {}, interval: {}ms",
        base_url, num_devices, interval_ms
    );

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    // Wait for the API to come up
    for attempt in 1..=10 {
        match client.get(format!("{}/health", base_url)).send().await {
            Ok(response) if response.status().is_success() => break,
            _ if attempt == 10 => {
                error!("API at {} not reachable, giving up", base_url);
                std::process::exit(1);
            }
            _ => {
                warn!("API not ready (attempt {}/10), retrying", attempt);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    if let Err(e) = client
        .post(format!("{}/admin/init-db", base_url))
        .send()
        .await
    {
        warn!("init-db request failed: {}", e);
    }

    // Fresh device ids per run so re-runs do not collide with old registrations
    let run_id: u32 = rand::thread_rng().gen();

    let mut devices = Vec::new();
    for i in 0..num_devices {
        let device_id = format!("sim-{:08x}-dev-{}", run_id, i);
        let patient_id = format!("p_{:03}", (i % 2) + 1);
        match register_device(&client, &base_url, &master_key, &device_id, &patient_id).await {
            Ok(device) => {
                info!("Registered {} for patient {}", device.device_id, patient_id);
                devices.push((device, patient_id));
            }
            Err(e) => {
                error!("Failed to register {}: {}", device_id, e);
            }
        }
    }

    if devices.is_empty() {
        error!("No devices registered, exiting");
        std::process::exit(1);
    }

    info!("Publishing vitals for {} devices", devices.len());

    let mut rng = rand::thread_rng();
    let mut stored = 0u64;
    let mut replayed = 0u64;
    let mut rejected = 0u64;
    let mut failed = 0u64;
    let mut ticks = 0u64;

    loop {
        for (device, patient_id) in &devices {
            let payload = generate_vitals(&mut rng, &device.device_id);
            let idem_key = format!(
                "reading-{}-{}",
                payload.observed_at.timestamp_millis(),
                device.device_id
            );

            // Occasionally resend under the same key, like a device retrying
            // after a lost response
            let attempts = if rng.gen_bool(0.2) { 2 } else { 1 };
            for _ in 0..attempts {
                match post_vitals(&client, &base_url, patient_id, device, &idem_key, &payload)
                    .await
                {
                    Ok(status) => match status.as_u16() {
                        201 => stored += 1,
                        200 => replayed += 1,
                        400 => rejected += 1,
                        other => warn!("Unexpected status {} for key {}", other, idem_key),
                    },
                    Err(e) => {
                        failed += 1;
                        warn!("Request failed: {}", e);
                    }
                }
            }
        }

        ticks += 1;
        if ticks % 10 == 0 {
            info!(
                "stored={} replayed={} rejected={} failed={}",
                stored, replayed, rejected, failed
            );
        }

        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
}

async fn register_device(
    client: &reqwest::Client,
    base_url: &str,
    master_key: &str,
    device_id: &str,
    patient_id: &str,
) -> Result<RegisteredDevice, reqwest::Error> {
    let response = client
        .post(format!("{}/api/v1/devices/register", base_url))
        .header("x-api-key", master_key)
        .json(&serde_json::json!({
            "device_id": device_id,
            "type": "bedside_monitor",
            "patient_id": patient_id,
        }))
        .send()
        .await?
        .error_for_status()?;
    response.json().await
}

async fn post_vitals(
    client: &reqwest::Client,
    base_url: &str,
    patient_id: &str,
    device: &RegisteredDevice,
    idem_key: &str,
    payload: &Vitals,
) -> Result<reqwest::StatusCode, reqwest::Error> {
    let response = client
        .post(format!(
            "{}/api/v1/patients/{}/vitals",
            base_url, patient_id
        ))
        .header("x-device-id", &device.device_id)
        .header("x-api-key", &device.api_key)
        .header("idempotency-key", idem_key)
        .json(payload)
        .send()
        .await?;
    Ok(response.status())
}

fn generate_vitals(rng: &mut impl Rng, device_id: &str) -> Vitals {
    let heart_rate = if rng.gen_bool(0.05) {
        rng.gen_range(-20..400) // 5% out-of-range outliers
    } else {
        rng.gen_range(55..110) // Normal range
    };

    let spo2 = if rng.gen_bool(0.03) {
        rng.gen_range(101..140) // 3% sensor glitches
    } else {
        rng.gen_range(92..100)
    };

    Vitals {
        observed_at: Utc::now(),
        heart_rate,
        bp: BloodPressure {
            systolic: rng.gen_range(95..150),
            diastolic: rng.gen_range(60..95),
        },
        spo2,
        temp: rng.gen_range(35.8..38.5),
        device_id: device_id.to_string(),
    }
}
