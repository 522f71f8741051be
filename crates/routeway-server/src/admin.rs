//! Admin API: registration feed and introspection

use crate::health::HeartbeatFlag;
use crate::ServerError;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use routeway_proxy::{ProxyStats, StatsSnapshot};
use routeway_router::{Endpoint, ModificationTag, RouteRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Application state shared across handlers
pub struct AdminState {
    pub registry: Arc<RouteRegistry>,
    pub stats: Arc<ProxyStats>,
    pub heartbeat: HeartbeatFlag,
}

/// Registration or unregistration of one endpoint under a set of routes
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryMessage {
    pub uris: Vec<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub private_instance_id: String,
    #[serde(default)]
    pub private_instance_index: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub stale_threshold_in_seconds: i64,
    #[serde(default)]
    pub route_service_url: String,
    #[serde(default)]
    pub modification_tag: ModificationTag,
}

impl RegistryMessage {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
            .with_application_id(self.app.clone())
            .with_instance(
                self.private_instance_id.clone(),
                self.private_instance_index.clone(),
            )
            .with_tags(self.tags.clone())
            .with_stale_threshold_secs(self.stale_threshold_in_seconds)
            .with_route_service_url(self.route_service_url.clone())
            .with_modification_tag(self.modification_tag.clone())
    }
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryResponse {
    /// Routes the message was applied to
    pub applied: usize,
    /// Routes rejected as invalid
    pub rejected: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VarzResponse {
    pub uris: usize,
    pub endpoints: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ms_since_last_registry_update: Option<u64>,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub fn admin_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/routes", get(list_routes))
        .route("/routes/register", post(register))
        .route("/routes/unregister", post(unregister))
        .route("/varz", get(varz))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn list_routes(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match state.registry.marshal_json() {
        Ok(json) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            e.to_string(),
        ),
    }
}

async fn register(
    State(state): State<Arc<AdminState>>,
    Json(message): Json<RegistryMessage>,
) -> Json<RegistryResponse> {
    let endpoint = message.endpoint();
    let mut response = RegistryResponse::default();

    for uri in &message.uris {
        match state.registry.register(uri, endpoint.clone()) {
            Ok(outcome) => {
                debug!(route = %uri, address = %endpoint.canonical_addr(), ?outcome, "Registered endpoint");
                response.applied += 1;
            }
            Err(e) => {
                warn!(route = %uri, error = %e, "register-rejected");
                response.rejected.push(uri.clone());
            }
        }
    }

    Json(response)
}

async fn unregister(
    State(state): State<Arc<AdminState>>,
    Json(message): Json<RegistryMessage>,
) -> Json<RegistryResponse> {
    let endpoint = message.endpoint();
    let mut response = RegistryResponse::default();

    for uri in &message.uris {
        match state.registry.unregister(uri, &endpoint) {
            Ok(removed) => {
                debug!(route = %uri, address = %endpoint.canonical_addr(), removed, "Unregistered endpoint");
                response.applied += 1;
            }
            Err(e) => {
                warn!(route = %uri, error = %e, "unregister-rejected");
                response.rejected.push(uri.clone());
            }
        }
    }

    Json(response)
}

async fn varz(State(state): State<Arc<AdminState>>) -> Json<VarzResponse> {
    let registry = &state.registry;
    Json(VarzResponse {
        uris: registry.num_uris(),
        endpoints: registry.num_endpoints(),
        ms_since_last_registry_update: registry
            .time_of_last_update()
            .map(|at| at.elapsed().as_millis() as u64),
        stats: state.stats.snapshot(),
    })
}

async fn health(State(state): State<Arc<AdminState>>) -> (StatusCode, Json<HealthResponse>) {
    let version = env!("CARGO_PKG_VERSION");
    if state.heartbeat.is_healthy() {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                version,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable",
                version,
            }),
        )
    }
}

/// Admin API server
pub struct AdminServer {
    listener: TcpListener,
    router: Router,
}

impl AdminServer {
    pub async fn bind(addr: SocketAddr, state: Arc<AdminState>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        Ok(Self {
            listener,
            router: admin_router(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!("Admin API listening on {}", self.local_addr()?);
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use routeway_router::RegistryConfig;
    use tower::ServiceExt;

    fn state() -> Arc<AdminState> {
        Arc::new(AdminState {
            registry: Arc::new(RouteRegistry::new(RegistryConfig::default())),
            stats: Arc::new(ProxyStats::new()),
            heartbeat: HeartbeatFlag::new(true),
        })
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_list_routes() {
        let state = state();
        let app = admin_router(state.clone());

        let message = serde_json::json!({
            "uris": ["shop.example.com", "shop.example.com/api", ""],
            "host": "10.0.0.5",
            "port": 8080,
            "app": "app-guid",
            "private_instance_id": "instance-a",
            "tags": { "component": "web" },
            "modification_tag": { "guid": "g", "index": 1 }
        });
        let response = app
            .clone()
            .oneshot(post_json("/routes/register", message))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({ "applied": 2, "rejected": [""] })
        );
        assert_eq!(state.registry.num_uris(), 2);

        let response = app
            .oneshot(Request::builder().uri("/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let routes = json_body(response).await;
        assert_eq!(routes["shop.example.com/api"][0]["address"], "10.0.0.5:8080");
        assert_eq!(routes["shop.example.com"][0]["tags"]["component"], "web");
    }

    #[tokio::test]
    async fn test_unregister_empties_pool() {
        let state = state();
        let app = admin_router(state.clone());
        let message = serde_json::json!({
            "uris": ["shop.example.com"],
            "host": "10.0.0.5",
            "port": 8080
        });

        app.clone()
            .oneshot(post_json("/routes/register", message.clone()))
            .await
            .unwrap();
        assert_eq!(state.registry.num_endpoints(), 1);

        app.oneshot(post_json("/routes/unregister", message))
            .await
            .unwrap();
        assert_eq!(state.registry.num_endpoints(), 0);
    }

    #[tokio::test]
    async fn test_varz_reports_counts() {
        let state = state();
        state
            .registry
            .register("a.com", Endpoint::new("10.0.0.1", 80))
            .unwrap();

        let response = admin_router(state)
            .oneshot(Request::builder().uri("/varz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let varz = json_body(response).await;
        assert_eq!(varz["uris"], 1);
        assert_eq!(varz["endpoints"], 1);
        assert_eq!(varz["bad_gateways"], 0);
        assert!(varz["ms_since_last_registry_update"].is_u64());
    }

    #[tokio::test]
    async fn test_health_follows_heartbeat() {
        let state = state();
        let app = admin_router(state.clone());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.heartbeat.set_healthy(false);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
