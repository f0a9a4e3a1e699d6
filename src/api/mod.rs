use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Router,
};
use base64::Engine;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tower_http::trace::TraceLayer;

use crate::config::BasicAuthConfig;
use crate::reconcile::Broker;

pub mod catalog;
pub mod handlers;

/// Shared state handed to every handler.
pub struct AppState {
    pub broker: Broker,
    pub auth: BasicAuthConfig,
    pub parameters: catalog::ParameterValidator,
    pub locks: InstanceLocks,
}

/// Open Service Broker routes behind basic auth, plus an unauthenticated health check.
pub fn router(state: Arc<AppState>) -> Router {
    let broker_routes = Router::new()
        .route("/v2/catalog", get(handlers::get_catalog))
        .route(
            "/v2/service_instances/:instance_id",
            put(handlers::provision)
                .patch(handlers::update)
                .delete(handlers::deprovision),
        )
        .route(
            "/v2/service_instances/:instance_id/service_bindings/:binding_id",
            put(handlers::bind).delete(handlers::unbind),
        )
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(broker_routes)
        .fallback(fallback_404)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Middleware: validates HTTP basic credentials against the configured broker user.
async fn basic_auth(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v.trim()).ok())
        .and_then(|raw| String::from_utf8(raw).ok());

    let authorized = match provided.as_deref().and_then(|s| s.split_once(':')) {
        Some((username, password)) => {
            let user_ok = username.as_bytes().ct_eq(state.auth.username.as_bytes());
            let pass_ok = password.as_bytes().ct_eq(state.auth.password.as_bytes());
            bool::from(user_ok & pass_ok)
        }
        None => false,
    };

    if authorized {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "broker API: missing or invalid basic credentials");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"apim-broker\"")],
    )
        .into_response()
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Serializes broker operations per instance id.
///
/// The reconciliation engine assumes no two operations on one instance overlap.
#[derive(Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub async fn acquire(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(instance_id.to_string())
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_instance_locks_serialize_same_id() {
        let locks = Arc::new(InstanceLocks::default());
        let guard = locks.acquire("i-1").await;

        let other = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("i-2").await })
        };
        assert!(tokio::time::timeout(Duration::from_secs(1), other).await.is_ok());

        let same = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("i-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!same.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), same)
            .await
            .unwrap()
            .unwrap();
    }
}
