//! HTTP fixture server for transfer tests.
//!
//! Every route produces one response shape the client has to handle:
//! fixed-length and chunked bodies, redirect chains, a redirect loop, a
//! stalled head, a stalled body, and arbitrary status codes.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

/// How long `/stall` waits before answering. Longer than any test deadline.
pub const STALL: Duration = Duration::from_secs(30);

#[derive(Clone, Default)]
pub struct AppState {
    /// Requests served by the redirect routes.
    pub redirect_hits: Arc<AtomicU64>,
}

impl AppState {
    pub fn redirect_hits(&self) -> u64 {
        self.redirect_hits.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hits {
    pub redirects: u64,
}

#[derive(Deserialize)]
pub struct RedirectTo {
    pub url: String,
    #[serde(default = "default_redirect_status")]
    pub status: u16,
}

fn default_redirect_status() -> u16 {
    302
}

pub fn app() -> Router {
    app_with_state(AppState::default())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/bytes/{n}", get(fixed_bytes))
        .route("/stream/{n}", get(chunked_stream))
        .route("/redirect/{n}", get(redirect_chain))
        .route("/redirect-to", get(redirect_to))
        .route("/loop", get(redirect_loop))
        .route("/hits", get(hits))
        .route("/headers", get(echo_headers))
        .route("/status/{code}", get(status))
        .route("/stall", get(stall_head))
        .route("/drip", get(stall_body))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, AppState::default()).await
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

/// Deterministic body byte at `index`: `a..z` repeating.
pub fn pattern_byte(index: usize) -> u8 {
    b'a' + (index % 26) as u8
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(pattern_byte).collect()
}

/// Text of chunk `index` in `/stream/{n}`.
pub fn stream_chunk(index: usize) -> String {
    format!("chunk-{index}\n")
}

async fn fixed_bytes(Path(n): Path<usize>) -> Response {
    ([(header::CONTENT_TYPE, "application/octet-stream")], pattern(n)).into_response()
}

async fn chunked_stream(Path(n): Path<usize>) -> Response {
    let chunks = stream::iter(0..n).then(|i| async move {
        tokio::task::yield_now().await;
        Ok::<_, Infallible>(stream_chunk(i))
    });
    ([(header::CONTENT_TYPE, "text/plain")], Body::from_stream(chunks)).into_response()
}

async fn redirect_chain(State(state): State<AppState>, Path(n): Path<u32>) -> Response {
    state.redirect_hits.fetch_add(1, Ordering::SeqCst);
    if n == 0 {
        return (StatusCode::OK, "done").into_response();
    }
    found(StatusCode::FOUND, &format!("/redirect/{}", n - 1), "moving on")
}

async fn redirect_to(State(state): State<AppState>, Query(query): Query<RedirectTo>) -> Response {
    state.redirect_hits.fetch_add(1, Ordering::SeqCst);
    let status = StatusCode::from_u16(query.status).unwrap_or(StatusCode::FOUND);
    found(status, &query.url, "")
}

async fn redirect_loop(State(state): State<AppState>) -> Response {
    state.redirect_hits.fetch_add(1, Ordering::SeqCst);
    found(StatusCode::FOUND, "/loop", "redirect body")
}

async fn hits(State(state): State<AppState>) -> Json<Hits> {
    Json(Hits {
        redirects: state.redirect_hits(),
    })
}

/// Request headers as a JSON object. Repeated names are joined with `, `.
async fn echo_headers(headers: HeaderMap) -> Json<BTreeMap<String, String>> {
    let mut echoed: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in &headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        echoed
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    Json(echoed)
}

async fn status(Path(code): Path<u16>) -> Response {
    match StatusCode::from_u16(code) {
        Ok(status) => status.into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn stall_head() -> &'static str {
    tokio::time::sleep(STALL).await;
    "too late"
}

/// Sends the first chunk, then never finishes the body.
async fn stall_body() -> Response {
    let first = stream::once(async { Ok::<_, Infallible>("first".to_string()) });
    let body = first.chain(stream::pending());
    Body::from_stream(body).into_response()
}

fn found(status: StatusCode, location: &str, body: &'static str) -> Response {
    tracing::debug!(%status, location, "redirect");
    (status, [(header::LOCATION, location.to_string())], body).into_response()
}
