use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::errors::{Error, Result};
use crate::metrics::AUTH_FAILURES_TOTAL;
use crate::registry;
use crate::rest::AppState;

/// Device id that passed key verification, injected as a request extension
#[derive(Debug, Clone)]
pub struct AuthedDevice(pub String);

/// Rejects the request with 401 unless `X-Device-Id` and `X-API-Key` name a
/// registered device and its issued key.
pub async fn require_device_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let device_id = header_value(&request, "x-device-id");
    let api_key = header_value(&request, "x-api-key");

    let (Some(device_id), Some(api_key)) = (device_id, api_key) else {
        AUTH_FAILURES_TOTAL.inc();
        return Err(Error::Auth);
    };

    match registry::verify_device_key(&state.pool, &device_id, &api_key).await {
        Ok(()) => {}
        Err(Error::Auth) => {
            AUTH_FAILURES_TOTAL.inc();
            return Err(Error::Auth);
        }
        Err(e) => return Err(e),
    }

    request.extensions_mut().insert(AuthedDevice(device_id));
    Ok(next.run(request).await)
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
