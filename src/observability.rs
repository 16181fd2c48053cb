//! Prometheus metrics export and the liveness probe.
//!
//! Installs a global recorder for the [`metrics`] facade so every
//! `metrics::counter!` / `gauge!` / `histogram!` call in the codebase is
//! captured, and serves `GET /metrics` plus `GET /healthz` over HTTP.

use crate::config::MetricsConfig;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Must run before the workers
/// start; repeated calls are no-ops.
pub fn install_recorder() -> anyhow::Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new()
        // Buckets tuned for telephony: sub-second latency is the norm.
        .set_buckets(&[
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ])
        .map_err(|e| anyhow::anyhow!("failed to configure Prometheus buckets: {e}"))?
        .build_recorder();

    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        // another recorder was already installed (parallel tests), fine
        return Ok(());
    }

    let _ = PROMETHEUS_HANDLE.set(handle);
    tracing::info!("Prometheus metrics recorder installed");
    Ok(())
}

pub fn router(config: &MetricsConfig) -> Option<Router> {
    if !config.enabled {
        return None;
    }
    let token = config.token.clone();
    Some(
        Router::new()
            .route(&config.healthz_path, get(healthz_handler))
            .route(
                &config.path,
                get(metrics_handler).layer(middleware::from_fn_with_state(
                    token,
                    metrics_auth_middleware,
                )),
            ),
    )
}

/// `GET /healthz` — liveness probe. Intentionally does not touch the bus or
/// storage so it stays usable while those are degraded.
async fn healthz_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "ok",
            "version": crate::version::get_short_version(),
        })),
    )
}

/// `GET /metrics` — Prometheus text-format scrape endpoint.
async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Prometheus recorder not initialised",
        )
            .into_response(),
    }
}

/// If a token is configured, require `Authorization: Bearer <token>` on the
/// scrape endpoint.
async fn metrics_auth_middleware(
    State(configured_token): State<Option<String>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(ref expected) = configured_token {
        let provided = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "));

        if provided != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer realm=\"metrics\"")],
                "Unauthorized",
            )
                .into_response();
        }
    }
    next.run(req).await
}
