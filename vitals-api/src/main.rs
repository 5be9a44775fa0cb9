use std::env;

use tracing::{error, info, warn};
use vitals_api::{db, metrics, rest};

const DEFAULT_MASTER_KEY: &str = "dev-master-key";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:vitals.db".to_string());
    let http_addr = env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let master_key =
        env::var("DEVICE_MASTER_KEY").unwrap_or_else(|_| DEFAULT_MASTER_KEY.to_string());
    let stale_secs: i64 = env::var("IDEMPOTENCY_STALE_SECS")
        .unwrap_or_else(|_| "30".to_string())
        .parse()
        .unwrap_or(30);

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting vitals API");
    info!("HTTP server: {}", http_addr);
    info!("Database: {}", database_url);
    info!("Idempotency staleness window: {}s", stale_secs);
    if master_key == DEFAULT_MASTER_KEY {
        warn!("DEVICE_MASTER_KEY is not set; using the development default");
    }

    // Initialize metrics
    metrics::init_metrics();

    // Connect to database
    let pool = match db::make_pool(&database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = db::init_schema(&pool).await {
        error!("Failed to initialize database schema: {}", e);
        std::process::exit(1);
    }

    let state = rest::AppState {
        pool,
        master_key,
        stale_after: chrono::Duration::seconds(stale_secs),
    };
    let app = rest::create_router(state);

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}
