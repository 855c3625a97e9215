use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Available session modes. System instructions are included so clients can
/// show what each interviewer is told.
pub async fn list_prompts(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let default_mode = state.get_config().sessions.default_mode;

    Ok(HttpResponse::Ok().json(json!({
        "default_mode": default_mode,
        "prompts": state.catalog.modes()
    })))
}
