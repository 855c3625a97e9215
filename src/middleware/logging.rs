use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info};

/// Logs the start and end of every request.
///
/// Relay socket upgrades get their own completion line carrying the session
/// id; health checks are logged at debug so pollers do not drown the log.
pub struct RequestLogging;

/// How a finished request is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    HealthCheck,
    RelayUpgrade,
    Api,
}

impl RequestKind {
    pub fn classify(path: &str, status: StatusCode) -> Self {
        if status == StatusCode::SWITCHING_PROTOCOLS {
            RequestKind::RelayUpgrade
        } else if path == "/health" || path == "/api/v1/health" {
            RequestKind::HealthCheck
        } else {
            RequestKind::Api
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        debug!(method = %method, path = %path, remote_addr = %remote_addr, "Request started");

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            match &result {
                Ok(response) => {
                    let status = response.status();
                    // Path parameters are only known once routing has run
                    let session_id = response
                        .request()
                        .match_info()
                        .get("session_id")
                        .unwrap_or("-")
                        .to_string();

                    match RequestKind::classify(&path, status) {
                        RequestKind::RelayUpgrade => info!(
                            path = %path,
                            session_id = %session_id,
                            remote_addr = %remote_addr,
                            "Relay socket upgraded"
                        ),
                        RequestKind::HealthCheck => debug!(
                            path = %path,
                            status = status.as_u16(),
                            duration_ms,
                            "Health check"
                        ),
                        RequestKind::Api => info!(
                            method = %method,
                            path = %path,
                            session_id = %session_id,
                            status = status.as_u16(),
                            duration_ms,
                            "Request completed"
                        ),
                    }
                }
                Err(err) => {
                    error!(
                        method = %method,
                        path = %path,
                        remote_addr = %remote_addr,
                        duration_ms,
                        error = %err,
                        "Request failed"
                    );
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    #[actix_web::test]
    async fn test_classify_requests() {
        assert_eq!(
            RequestKind::classify("/ws/s1", StatusCode::SWITCHING_PROTOCOLS),
            RequestKind::RelayUpgrade
        );
        assert_eq!(RequestKind::classify("/ws/s1", StatusCode::BAD_REQUEST), RequestKind::Api);
        assert_eq!(RequestKind::classify("/api/v1/health", StatusCode::OK), RequestKind::HealthCheck);
        assert_eq!(RequestKind::classify("/api/v1/sessions", StatusCode::OK), RequestKind::Api);
    }

    #[actix_web::test]
    async fn test_responses_pass_through() {
        let app = test::init_service(
            App::new()
                .wrap(RequestLogging)
                .route(
                    "/sessions/{session_id}",
                    web::get().to(|| async { HttpResponse::NotFound().finish() }),
                ),
        )
        .await;

        let req = test::TestRequest::get().uri("/sessions/abc").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
