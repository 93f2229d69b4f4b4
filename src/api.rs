//! Administrative HTTP API over the registry.
//!
//! * `GET /mappings` lists every mapping as `{"mappings": [...]}`.
//! * `POST /mappings` registers a mapping (`201` with the stored mapping).
//! * `DELETE /mappings/:host` removes one (`204`, also when absent).
//!
//! Errors are `{"error": "..."}` bodies.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::addr::Address;
use crate::config::ApiConfig;
use crate::error::RegistryError;
use crate::registry::{normalize_host, MappingRegistry};
use crate::types::Mapping;

#[derive(Debug, Serialize, Deserialize)]
pub struct MappingList {
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Registry(RegistryError),
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Registry(err) => {
                let status = match err {
                    RegistryError::AlreadyRegistered { .. } => StatusCode::CONFLICT,
                    RegistryError::EmptyMapping { .. } | RegistryError::InvalidMapping(_) => {
                        StatusCode::BAD_REQUEST
                    }
                };
                (status, err.to_string())
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

pub fn router(registry: Arc<MappingRegistry>) -> Router {
    Router::new()
        .route("/mappings", get(list_mappings).post(create_mapping))
        .route("/mappings/:host", delete(delete_mapping))
        .with_state(registry)
}

async fn list_mappings(State(registry): State<Arc<MappingRegistry>>) -> Json<MappingList> {
    let mut mappings = registry.list().await;
    mappings.sort_by(|a, b| a.host.cmp(&b.host));
    Json(MappingList { mappings })
}

async fn create_mapping(
    State(registry): State<Arc<MappingRegistry>>,
    payload: Result<Json<Mapping>, JsonRejection>,
) -> Result<(StatusCode, Json<Mapping>), ApiError> {
    let Json(mut mapping) = payload?;
    registry.create(mapping.clone()).await?;
    mapping.host = normalize_host(&mapping.host);
    debug!("mapping {} registered via API", mapping.host);
    Ok((StatusCode::CREATED, Json(mapping)))
}

async fn delete_mapping(
    State(registry): State<Arc<MappingRegistry>>,
    Path(host): Path<String>,
) -> StatusCode {
    if registry.delete_by_host(&host).await.is_some() {
        debug!("mapping {} removed via API", host);
    }
    StatusCode::NO_CONTENT
}

/// Backend address the proxy should dial to reach a listener bound on `addr`.
fn backend_for(addr: SocketAddr) -> Address {
    let ip = addr.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        Address::local(addr.port())
    } else {
        Address::new(ip.to_string(), addr.port())
    }
}

/// Serve the API until `token` is canceled.
///
/// Once bound, the API registers `config.hostname` on port 80 so it is
/// reachable through the proxy, and removes that mapping on the way out.
pub async fn run_api_server(
    config: ApiConfig,
    registry: Arc<MappingRegistry>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind admin API on {}", config.bind))?;
    let local = listener.local_addr()?;
    info!("Admin API listening on {}", local);

    let mut registered = None;
    if !config.hostname.is_empty() {
        let mapping = Mapping::new(config.hostname.as_str()).with_port(80, backend_for(local));
        match registry.create(mapping).await {
            Ok(()) => {
                info!("Admin API reachable as http://{}/", config.hostname);
                registered = Some(config.hostname.clone());
            }
            Err(e) => warn!("Admin API not registered: {}", e),
        }
    }

    let shutdown = token.clone();
    let served = axum::serve(listener, router(Arc::clone(&registry)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    if let Some(host) = registered {
        registry.delete_by_host(&host).await;
    }
    info!("Admin API on {} stopped", local);
    served.context("admin API failed")
}
