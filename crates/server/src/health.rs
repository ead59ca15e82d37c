//! Health check endpoints
//!
//! `/health` answers as long as the process serves requests. `/health/detailed`
//! reports the components registered by the application and turns 503 when
//! any of them is unhealthy.

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

/// Status of one application component (a price source, the consensus feed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentStatus {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            detail: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            detail: Some(detail.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Shared state for health checks, wrapped in `Arc<HealthState>` for Axum
#[derive(Clone)]
pub struct HealthState {
    pub service_name: String,
    pub start_time: Instant,
    components: Arc<tokio::sync::RwLock<Vec<ComponentStatus>>>,
}

impl HealthState {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            start_time: Instant::now(),
            components: Arc::new(tokio::sync::RwLock::new(Vec::new())),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Insert or replace the status of a component
    pub async fn update_component(&self, status: ComponentStatus) {
        let mut components = self.components.write().await;
        match components.iter_mut().find(|c| c.name == status.name) {
            Some(existing) => *existing = status,
            None => components.push(status),
        }
    }

    /// Replace every component status at once
    pub async fn replace_components(&self, statuses: Vec<ComponentStatus>) {
        *self.components.write().await = statuses;
    }

    pub async fn components(&self) -> Vec<ComponentStatus> {
        self.components.read().await.clone()
    }

    pub async fn is_healthy(&self) -> bool {
        self.components.read().await.iter().all(|c| c.healthy)
    }
}

/// Liveness with service name and uptime
pub async fn health_handler(State(state): State<Arc<HealthState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
    }))
}

/// Liveness without state
pub async fn simple_health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Component report; 503 when any component is unhealthy
pub async fn detailed_health_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    let components = state.components().await;
    let all_healthy = components.iter().all(|c| c.healthy);
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let health = json!({
        "status": if all_healthy { "healthy" } else { "degraded" },
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "components": components,
        "healthy": all_healthy,
    });

    (status_code, Json(health))
}

/// `/health` and `/health/detailed`
pub fn health_routes(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(detailed_health_handler))
        .with_state(state)
}
