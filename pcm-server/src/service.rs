//! Per-connection request handler (spec.md §4.8, §7 `Protocol`).

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode};
use pcm_aggregate::SnapshotRing;
use pcm_topology::SystemRoot;

use crate::negotiate::negotiate;
use crate::render::{dashboard_json, render_json, render_prometheus, FAVICON_BYTES, LANDING_PAGE_HTML};
use crate::routes::{route_for, Route};

pub struct AppState {
    pub topology: Arc<SystemRoot>,
    pub ring: SnapshotRing,
}

fn text_response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Resolves a route to the `(before, after)` snapshot pair it needs,
/// blocking the worker task until the ring holds enough samples
/// (spec.md §4.8: `/persecond/{n}` waits for `n+1` entries, a genuine
/// `n`-second delta).
async fn snapshot_pair(state: &AppState, n: u32) -> (Option<Arc<pcm_engine::Snapshot>>, Arc<pcm_engine::Snapshot>) {
    let ring = state.ring.clone();
    let n = n as usize;
    tokio::task::spawn_blocking(move || {
        ring.wait_until_len_at_least(n + 1);
        let after = ring.get(0).expect("ring holds at least n+1 entries");
        let before = ring.get(n);
        (before, after)
    })
    .await
    .expect("snapshot wait task panicked")
}

/// Resolves `/` and `/metrics` to just the latest snapshot, with no
/// `before` (spec.md §4.8: these two endpoints report absolute/cumulative
/// counter values, not a delta — that's what bare `/persecond` is for).
async fn latest_snapshot(state: &AppState) -> Arc<pcm_engine::Snapshot> {
    let ring = state.ring.clone();
    tokio::task::spawn_blocking(move || {
        ring.wait_until_len_at_least(1);
        ring.get(0).expect("ring holds at least one entry")
    })
    .await
    .expect("snapshot wait task panicked")
}

pub async fn handle(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.headers().get(HOST).is_none() {
        return Ok(text_response(StatusCode::BAD_REQUEST, "text/plain", "missing Host header"));
    }

    let method = req.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return Ok(text_response(StatusCode::NOT_IMPLEMENTED, "text/plain", "unsupported method"));
    }

    let route = route_for(req.uri().path());
    let accept = req
        .headers()
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let mut response = match route {
        Route::NotFound => text_response(StatusCode::NOT_FOUND, "text/plain", "not found"),
        Route::Favicon => text_response(StatusCode::OK, "image/x-icon", Bytes::from_static(FAVICON_BYTES)),
        Route::Dashboard => text_response(StatusCode::OK, "application/json; charset=UTF-8", dashboard_json().to_string()),
        Route::Index => {
            let format = negotiate(accept.as_deref());
            if format == crate::negotiate::Format::Html {
                text_response(StatusCode::OK, format.content_type(), LANDING_PAGE_HTML)
            } else {
                let after = latest_snapshot(&state).await;
                render_for(format, &state.topology, None, &after)
            }
        }
        Route::Metrics => {
            let format = negotiate(accept.as_deref());
            let format = if format == crate::negotiate::Format::Html {
                crate::negotiate::Format::Prometheus
            } else {
                format
            };
            let after = latest_snapshot(&state).await;
            render_for(format, &state.topology, None, &after)
        }
        Route::PerSecond(n) => {
            let format = negotiate(accept.as_deref());
            let format = if format == crate::negotiate::Format::Html {
                crate::negotiate::Format::Prometheus
            } else {
                format
            };
            let (before, after) = snapshot_pair(&state, n).await;
            render_for(format, &state.topology, before.as_deref(), &after)
        }
    };

    if method == Method::HEAD {
        *response.body_mut() = Full::new(Bytes::new());
    }

    response
        .headers_mut()
        .insert(hyper::header::SERVER, HeaderValue::from_static("pcm-rs"));
    if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now())) {
        response.headers_mut().insert(hyper::header::DATE, date);
    }
    response.headers_mut().insert(
        HeaderName::from_static("keep-alive"),
        HeaderValue::from_static("timeout=10, max=100"),
    );

    Ok(response)
}

fn render_for(
    format: crate::negotiate::Format,
    topology: &SystemRoot,
    before: Option<&pcm_engine::Snapshot>,
    after: &pcm_engine::Snapshot,
) -> Response<Full<Bytes>> {
    use crate::negotiate::Format;
    match format {
        Format::Json => text_response(StatusCode::OK, Format::Json.content_type(), render_json(topology, before, after).to_string()),
        Format::Prometheus => text_response(StatusCode::OK, Format::Prometheus.content_type(), render_prometheus(topology, before, after)),
        Format::Html => text_response(StatusCode::OK, Format::Html.content_type(), LANDING_PAGE_HTML),
    }
}
