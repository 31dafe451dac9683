//! API handlers.

use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::provider::ProviderReport;
use crate::transcode::ProbeReport;

const DEFAULT_KIND: &str = "movie";
const DEFAULT_TEST_PROVIDER: &str = "vega";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StreamQuery {
    #[serde(alias = "providerValue")]
    pub provider: String,
    pub link: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TranscodeQuery {
    pub url: String,
    pub referer: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InfoQuery {
    pub provider: String,
    pub link: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EpisodesQuery {
    pub provider: String,
    pub url: String,
}

fn require(params: &[(&str, &str)]) -> ApiResult<()> {
    if params.iter().any(|(_, value)| value.trim().is_empty()) {
        let names: Vec<&str> = params.iter().map(|(name, _)| *name).collect();
        return Err(ApiError::bad_request(format!("{} required", names.join(" and "))));
    }
    Ok(())
}

/// Cancelled when the handler future is dropped, i.e. the client went away.
fn request_scope() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

/// `GET /api/stream?provider&link&type`
pub async fn stream(State(state): State<AppState>, Query(q): Query<StreamQuery>) -> ApiResult<Json<Value>> {
    require(&[("provider", &q.provider), ("link", &q.link)])?;
    let kind = if q.kind.trim().is_empty() {
        DEFAULT_KIND
    } else {
        q.kind.trim()
    };

    let (cancel, _guard) = request_scope();
    let streams = state
        .resolver
        .resolve_stream(&q.provider, &q.link, kind, &cancel)
        .await?;
    info!(provider = %q.provider, count = streams.len(), "Resolved streams");
    Ok(Json(json!({ "data": streams })))
}

/// `GET /api/info?provider&link`
pub async fn info(State(state): State<AppState>, Query(q): Query<InfoQuery>) -> ApiResult<Json<Value>> {
    require(&[("provider", &q.provider), ("link", &q.link)])?;
    let (cancel, _guard) = request_scope();
    let meta = state.resolver.meta(&q.provider, &q.link, &cancel).await?;
    Ok(Json(json!({ "data": meta })))
}

/// `GET /api/episodes?provider&url`
pub async fn episodes(State(state): State<AppState>, Query(q): Query<EpisodesQuery>) -> ApiResult<Json<Value>> {
    require(&[("provider", &q.provider), ("url", &q.url)])?;
    let (cancel, _guard) = request_scope();
    let episodes = state.resolver.episodes(&q.provider, &q.url, &cancel).await?;
    Ok(Json(json!({ "data": episodes })))
}

/// `GET /api/home?provider`
pub async fn home(State(state): State<AppState>, Query(q): Query<ProviderQuery>) -> ApiResult<Json<Value>> {
    let provider = q.provider.unwrap_or_default();
    require(&[("provider", &provider)])?;
    let (cancel, _guard) = request_scope();
    let sections = state.resolver.home(&provider, &cancel).await?;
    Ok(Json(json!({ "data": sections })))
}

/// `GET /api/test-provider?provider`
pub async fn test_provider(State(state): State<AppState>, Query(q): Query<ProviderQuery>) -> Json<ProviderReport> {
    let provider = q
        .provider
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TEST_PROVIDER.to_string());
    Json(state.resolver.inspect(&provider).await)
}

/// `GET /api/transcode?url&referer`
///
/// The body ends when ffmpeg does; dropping the body (client disconnect)
/// kills the process.
pub async fn transcode(State(state): State<AppState>, Query(q): Query<TranscodeQuery>) -> ApiResult<Response> {
    let stream = state.transcoder.open(&q.url, q.referer.as_deref())?;

    Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal("RESPONSE", e.to_string()))
}

/// `GET /api/transcode/test`
pub async fn transcode_test(State(state): State<AppState>) -> ApiResult<Json<ProbeReport>> {
    Ok(Json(state.transcoder.probe().await?))
}
