//! Egress gateway between clients and the blob store.
//!
//! The proxy is the only path client code uses to read stored images: it
//! hides storage credentials, fixes CORS, and stamps immutable cache
//! headers. Bodies are streamed through rather than buffered; a single
//! object can be as large as the upload ceiling.

use axum::{
    Json,
    body::Body,
    extract::{Extension, Query},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::server::AppStateHandle;

const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000, immutable";
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    key: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProxyErrorBody {
    error: String,
}

fn proxy_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ProxyErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

pub async fn image_proxy(
    Extension(state): Extension<AppStateHandle>,
    Query(query): Query<ProxyQuery>,
) -> Response {
    let target = match (query.key.as_deref(), query.url.as_deref()) {
        (Some(key), None) => {
            debug_assert!(!state.public_base_url.as_str().is_empty());
            match state.public_base_url.join(key) {
                Ok(url) => url.to_string(),
                Err(err) => {
                    return proxy_error(
                        StatusCode::BAD_REQUEST,
                        format!("key `{key}` cannot be resolved: {err}"),
                    );
                }
            }
        }
        (None, Some(url)) => {
            // Same-origin policy: only objects under the configured public
            // base may flow through the proxy.
            if !url.starts_with(state.public_base_url.as_str()) {
                return proxy_error(
                    StatusCode::FORBIDDEN,
                    "requested url is outside the configured storage origin",
                );
            }
            url.to_string()
        }
        _ => {
            return proxy_error(
                StatusCode::BAD_REQUEST,
                "provide exactly one of `key` or `url`",
            );
        }
    };

    let upstream = match state.proxy_http.get(&target).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(%err, %target, "proxy upstream fetch failed");
            return proxy_error(StatusCode::BAD_GATEWAY, format!("upstream fetch failed: {err}"));
        }
    };

    let status = upstream.status();
    if !status.is_success() {
        let mirrored =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return proxy_error(mirrored, format!("upstream returned {status}"));
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(FALLBACK_CONTENT_TYPE));

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_IMMUTABLE),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}
