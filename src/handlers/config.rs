use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Placeholder returned in place of secrets; never written back.
const REDACTED: &str = "***";

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Apply a partial configuration update.
///
/// Session settings take effect for sessions created afterwards; running
/// relays keep the values they started with. Server host/port changes are
/// stored but need a restart.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let mut patch = body.into_inner();
    drop_redacted_secret(&mut patch);
    let json_str = serde_json::to_string(&patch)?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config.redacted()
    })))
}

/// A client echoing back a fetched config must not overwrite the real key.
fn drop_redacted_secret(patch: &mut serde_json::Value) {
    if let Some(upstream) = patch.get_mut("upstream").and_then(|u| u.as_object_mut()) {
        if upstream.get("api_key").and_then(|k| k.as_str()) == Some(REDACTED) {
            upstream.remove("api_key");
        }
    }
}
