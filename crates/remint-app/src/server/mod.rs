//! Web server entrypoints live here.

pub mod proxy;
pub mod validate;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Multipart},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use url::Url;

use crate::config::AppConfig;
use crate::pipeline::MAX_PAYLOAD_BYTES;
use crate::pipeline::orchestrator::{FlowStatus, Orchestrator};
use crate::services::blob_store::BlobError;
use crate::services::synthesis::{ServiceAccountTokens, SynthesisClient, SynthesisError};
use crate::services::vision::VisionClient;
use crate::services::{BlobStore, S3BlobStore};

pub const IMAGE_FLOW_PATH: &str = "/api/image-flow";
pub const IMAGE_PROXY_PATH: &str = "/api/image-proxy";
pub const HEALTH_PATH: &str = "/health";
const HEALTH_STATUS: &str = "ok";
const REQUEST_ID_HEADER: &str = "x-request-id";
/// Multipart framing and form values ride on top of the image payload
/// ceiling; the validator enforces the precise limits.
const MULTIPART_BODY_LIMIT: usize = MAX_PAYLOAD_BYTES + 4 * 1024 * 1024;
const VISION_TIMEOUT: Duration = Duration::from_secs(120);
const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(240);
const USER_AGENT: &str = concat!("remint/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error("invalid public base URL `{url}`: {reason}")]
    PublicBaseUrl { url: String, reason: String },
}

/// Long-lived, thread-safe collaborators shared by every request.
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Client for proxy egress fetches; carries no per-request timeout.
    pub proxy_http: reqwest::Client,
    pub public_base_url: Url,
    pub max_reference_images: usize,
}

pub type AppStateHandle = Arc<AppState>;

pub fn build_router(state: AppStateHandle) -> Router {
    debug_assert!(IMAGE_FLOW_PATH.starts_with("/api/"));
    debug_assert!(MULTIPART_BODY_LIMIT > MAX_PAYLOAD_BYTES);

    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-")
            .to_string();
        tracing::info_span!(
            "http.request",
            method = %request.method(),
            path = %request.uri().path(),
            request_id = %request_id
        )
    });

    Router::new()
        .route(IMAGE_FLOW_PATH, post(image_flow))
        .route(IMAGE_PROXY_PATH, get(proxy::image_proxy))
        .route(HEALTH_PATH, get(health))
        .layer(DefaultBodyLimit::max(MULTIPART_BODY_LIMIT))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(Extension(state))
}

pub async fn serve(config: AppConfig) -> Result<(), ServerError> {
    debug_assert!(config.server.port > 0);

    let state = build_state(&config).await?;
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener =
        TcpListener::bind(listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                address: listen_addr.to_string(),
                source,
            })?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "remint server listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(stop_requested())
        .await
        .map_err(|source| ServerError::Serve { source })?;

    tracing::info!("remint server stopped");
    Ok(())
}

/// Resolves when the process is asked to stop (Ctrl-C, or SIGTERM on unix).
/// In-flight pipeline runs finish before the server exits; a second signal
/// kills the process the usual way.
async fn stop_requested() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "no interrupt handler available; running until killed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "no SIGTERM handler available; running until killed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => tracing::info!("interrupt received; finishing open requests"),
        _ = terminate => tracing::info!("termination requested; finishing open requests"),
    }
}

async fn build_state(config: &AppConfig) -> Result<AppStateHandle, ServerError> {
    let public_base_url = Url::parse(&config.storage.public_base_url).map_err(|err| {
        ServerError::PublicBaseUrl {
            url: config.storage.public_base_url.clone(),
            reason: err.to_string(),
        }
    })?;

    let blob_store: Arc<dyn BlobStore> = Arc::new(S3BlobStore::connect(&config.storage).await?);

    let vision_http = reqwest::Client::builder()
        .timeout(VISION_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;
    let vision = VisionClient::builder()
        .http(vision_http)
        .api_key(config.vision.api_key.clone())
        .model(config.vision.model.clone())
        .base_url(config.vision.base_url.clone())
        .system_prompt_image_understand(config.vision.system_prompt_image_understand.clone())
        .system_prompt_prompt_editor(config.vision.system_prompt_prompt_editor.clone())
        .build();

    let synthesis_http = reqwest::Client::builder()
        .timeout(SYNTHESIS_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;
    let tokens = Arc::new(ServiceAccountTokens::from_credentials_file(
        &config.synthesis.primary.credentials_path,
    )?);
    let synthesis = SynthesisClient::new(
        synthesis_http,
        tokens,
        &config.synthesis.primary,
        &config.synthesis.fallback,
        config.synthesis.output_format.clone(),
    );

    let orchestrator = Orchestrator::new(
        blob_store,
        Arc::new(vision),
        Arc::new(synthesis),
        config.synthesis.output_format.clone(),
    );

    let proxy_http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

    Ok(Arc::new(AppState {
        orchestrator,
        proxy_http,
        public_base_url,
        max_reference_images: config.limits.max_reference_images,
    }))
}

async fn image_flow(
    Extension(state): Extension<AppStateHandle>,
    multipart: Multipart,
) -> Response {
    let request = match validate::decode_multipart(multipart, state.max_reference_images).await {
        Ok(request) => request,
        Err(rejection) => return rejection.into_response(),
    };

    let outcome = state.orchestrator.run(request).await;
    let status = match outcome.status {
        FlowStatus::Completed => StatusCode::OK,
        FlowStatus::UpstreamRejected => StatusCode::BAD_GATEWAY,
        FlowStatus::StorageFailed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(outcome.response)).into_response()
}

async fn health() -> impl IntoResponse {
    debug_assert_eq!(HEALTH_STATUS, "ok");

    Json(HealthResponse {
        status: HEALTH_STATUS,
    })
}

