//! JSON control API and SSE event feed over the sync engine.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lotsync_core::event::Envelope;
use lotsync_core::model::{Lot, RunCounters, SyncRunStatus};
use lotsync_storage::fetch::{HttpClientConfig, HttpFetcher};
use lotsync_storage::migrate::apply_all;
use lotsync_storage::store::LotStore;
use lotsync_sync::{
    ControlError, EventBus, JsonImporter, LiveOptions, LiveStatus, LiveSyncController, SyncConfig,
    SyncEngine, SyncOptions,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

pub const CRATE_NAME: &str = "lotsync-web";

#[derive(Clone)]
pub struct AppState {
    pub store: LotStore,
    pub engine: Arc<SyncEngine>,
    pub live: Arc<LiveSyncController>,
    pub events: EventBus,
    pub page_delay: Duration,
    pub poll_interval: Duration,
}

impl AppState {
    pub fn new(
        store: LotStore,
        engine: Arc<SyncEngine>,
        events: EventBus,
        page_delay: Duration,
        poll_interval: Duration,
    ) -> Self {
        let live = Arc::new(LiveSyncController::new(engine.clone()));
        Self {
            store,
            engine,
            live,
            events,
            page_delay,
            poll_interval,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(sync_handler))
        .route("/live/start", post(live_start_handler))
        .route("/live/pause", post(live_pause_handler))
        .route("/live/stop", post(live_stop_handler))
        .route("/live/status", get(live_status_handler))
        .route("/events", get(events_handler))
        .route("/runs", get(runs_handler))
        .route("/auctions/{code}/lots", get(auction_lots_handler))
        .with_state(Arc::new(state))
}

/// Build state from environment config and start serving.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let state = state_from_config(&config).await?;

    let port: u16 = std::env::var("LOTSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn state_from_config(config: &SyncConfig) -> anyhow::Result<AppState> {
    let store = LotStore::open_path(&config.database_path).await?;
    apply_all(store.pool()).await?;

    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?;
    let events = EventBus::default();
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        Arc::new(fetcher),
        Arc::new(JsonImporter),
        events.clone(),
        config.base_url.clone(),
    ));

    Ok(AppState::new(
        store,
        engine,
        events,
        Duration::from_secs(config.page_delay_seconds),
        Duration::from_secs(config.poll_interval_seconds),
    ))
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    auction_code: String,
    #[serde(default)]
    max_pages: Option<u64>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    fetch_details: bool,
    #[serde(default)]
    delay_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    run_id: String,
    auction_code: String,
    status: SyncRunStatus,
    counters: RunCounters,
}

#[derive(Debug, Deserialize)]
struct LiveStartRequest {
    auction_code: String,
    #[serde(default)]
    max_pages: Option<u64>,
    #[serde(default)]
    fetch_details: bool,
    #[serde(default)]
    poll_interval_seconds: Option<u64>,
}

/// Row shape for `GET /runs`.
#[derive(Debug, Serialize)]
struct RunRow {
    run_id: String,
    auction_code: Option<String>,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    status: SyncRunStatus,
    counters: RunCounters,
    dry_run: bool,
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> Response {
    let mut options = SyncOptions::for_auction(req.auction_code);
    options.max_pages = req.max_pages;
    options.dry_run = req.dry_run;
    options.fetch_details = req.fetch_details;
    options.page_delay = req
        .delay_seconds
        .map(Duration::from_secs)
        .unwrap_or(state.page_delay);

    match state.engine.run_once(&options).await {
        Ok(summary) => Json(SyncResponse {
            run_id: summary.run_id,
            auction_code: summary.auction_code,
            status: summary.status,
            counters: summary.counters,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn live_start_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LiveStartRequest>,
) -> Response {
    let mut sync = SyncOptions::for_auction(req.auction_code);
    sync.max_pages = req.max_pages;
    sync.fetch_details = req.fetch_details;
    sync.page_delay = state.page_delay;
    let options = LiveOptions {
        sync,
        poll_interval: req
            .poll_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(state.poll_interval),
    };
    control_response(state.live.start(options).await)
}

async fn live_pause_handler(State(state): State<Arc<AppState>>) -> Response {
    control_response(state.live.pause().await)
}

async fn live_stop_handler(State(state): State<Arc<AppState>>) -> Response {
    control_response(state.live.stop().await)
}

async fn live_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.live.status().await).into_response()
}

/// Event feed: a `connection_ready` envelope first, then every broadcast
/// envelope published while the client stays connected.
async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_feed(&state.events)).keep_alive(KeepAlive::default())
}

/// A subscriber that falls behind the channel buffer is disconnected: the
/// stream ends on lag so the client sees the gap and can resync instead of
/// silently missing envelopes.
fn event_feed(events: &EventBus) -> impl Stream<Item = Result<Event, Infallible>> {
    let feed = BroadcastStream::new(events.subscribe())
        .map_while(|item| item.ok().map(|envelope| Ok(envelope_event(&envelope))));
    let ready = tokio_stream::once(Ok(envelope_event(&Envelope::connection_ready())));
    ready.chain(feed)
}

fn envelope_event(envelope: &Envelope) -> Event {
    Event::default()
        .event(envelope.kind.as_str())
        .data(serde_json::to_string(envelope).unwrap_or_default())
}

async fn runs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_sync_runs(50).await {
        Ok(runs) => {
            let rows: Vec<RunRow> = runs
                .into_iter()
                .map(|r| RunRow {
                    run_id: r.run_id,
                    auction_code: r.auction_code,
                    started_at: r.started_at,
                    finished_at: r.finished_at,
                    status: r.status,
                    counters: r.counters,
                    dry_run: r.dry_run,
                })
                .collect();
            Json(rows).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn auction_lots_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(code): AxumPath<String>,
) -> Response {
    let auction = match state.store.get_auction(&code).await {
        Ok(Some(auction)) => auction,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": format!("unknown auction {code}")})),
            )
                .into_response();
        }
        Err(err) => return server_error(err.into()),
    };
    match state.store.list_lots(auction.id).await {
        Ok(lots) => Json::<Vec<Lot>>(lots).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn control_response(result: Result<LiveStatus, ControlError>) -> Response {
    match result {
        Ok(status) => Json(status).into_response(),
        Err(err) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}
