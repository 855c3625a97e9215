use crate::{error::AppError, session::Session, state::AppState};
use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

/// Session record plus derived ages, as returned by the API.
#[derive(Debug, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub age_seconds: i64,
    pub idle_seconds: i64,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        let now = Utc::now();
        Self {
            age_seconds: (now - session.created_at).num_seconds(),
            idle_seconds: (now - session.last_activity).num_seconds(),
            session,
        }
    }
}

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions: Vec<SessionView> = state
        .registry
        .list()
        .into_iter()
        .map(SessionView::from)
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max_concurrent_sessions": state.registry.settings().max_concurrent_sessions,
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("session '{}' not found", session_id)))?;

    Ok(HttpResponse::Ok().json(SessionView::from(session)))
}

/// End a session. Ending an unknown or already-ended session is not an error.
pub async fn end_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    state.registry.end(&session_id).await;
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};
    use crate::state::testing::test_state;

    macro_rules! sessions_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/sessions", web::get().to(list_sessions))
                    .route("/sessions/{session_id}", web::get().to(get_session))
                    .route("/sessions/{session_id}", web::delete().to(end_session)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_list_and_get_sessions() {
        let (state, _) = test_state();
        state.registry.create("s1", "amazon_interviewer").expect("create");
        let app = sessions_app!(state);

        let req = test::TestRequest::get().uri("/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["id"], "s1");
        assert_eq!(body["sessions"][0]["state"], "created");

        let req = test::TestRequest::get().uri("/sessions/s1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["mode"], "amazon_interviewer");
        assert_eq!(body["relay_phase"], "init");
    }

    #[actix_web::test]
    async fn test_get_unknown_session_is_404() {
        let (state, _) = test_state();
        let app = sessions_app!(state);

        let req = test::TestRequest::get().uri("/sessions/missing").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_delete_is_idempotent() {
        let (state, _) = test_state();
        state.registry.create("s1", "general_interviewer").expect("create");
        let app = sessions_app!(state.clone());

        for _ in 0..2 {
            let req = test::TestRequest::delete().uri("/sessions/s1").to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }
        let req = test::TestRequest::delete().uri("/sessions/never-existed").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.registry.get("s1").is_none());
    }
}
