use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use dashboard_common::{
    best_period, ranked_periods, DashboardConfig, OffsetSource, PeriodOption, TimeCodec,
    TimeCodecError,
};

use crate::{
    client::{NodeApi, ParamClient},
    session::{
        DutyCycleOutcome, NodeSession, ParamKind, SessionError, SessionHandle, SessionStatus,
        SessionView,
    },
    store,
};

const MAX_PROXY_BODY: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    client: ParamClient,
    proxy: reqwest::Client,
    sessions: Arc<Mutex<HashMap<u32, SessionHandle>>>,
    config: Arc<DashboardConfig>,
    codec: TimeCodec,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct DraftUpdate {
    draft: String,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    value: Value,
}

#[derive(Debug, Deserialize)]
struct DimmerUpdate {
    #[serde(rename = "dutyCycle")]
    duty_cycle: Value,
}

#[derive(Debug, Deserialize)]
struct HeaterUpdate {
    on: Option<String>,
    off: Option<String>,
}

#[derive(Debug, Serialize)]
struct DimmerView {
    #[serde(flatten)]
    session: SessionView,
    #[serde(rename = "autoPeriod")]
    auto_period: bool,
    #[serde(rename = "bestPeriod")]
    best_period: Option<PeriodOption>,
    #[serde(rename = "periodOptions")]
    period_options: Vec<PeriodOption>,
    #[serde(rename = "lastWrite", skip_serializing_if = "Option::is_none")]
    last_write: Option<DutyCycleOutcome>,
}

#[derive(Debug, Serialize)]
struct HeaterView {
    #[serde(flatten)]
    session: SessionView,
    on: Option<String>,
    off: Option<String>,
}

impl AppState {
    pub fn new(config: DashboardConfig, http: reqwest::Client) -> Result<Self, TimeCodecError> {
        let source = OffsetSource::from_timezone(config.timezone.as_deref())?;
        Ok(Self {
            client: ParamClient::with_http(&config.backend_url, http.clone()),
            proxy: http,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
            codec: TimeCodec::new(source),
        })
    }

    /// Sessions are only created for nodes the backend lists.
    async fn session(&self, node_id: u32) -> Result<SessionHandle, Response> {
        if let Some(session) = self.sessions.lock().await.get(&node_id) {
            return Ok(session.clone());
        }

        let nodes = self.client.list_nodes(None).await.map_err(|err| {
            warn!("failed to list nodes: {err}");
            error_response(StatusCode::BAD_GATEWAY, &err.to_string())
        })?;
        if !nodes.iter().any(|node| node.id == node_id) {
            return Err(error_response(
                StatusCode::NOT_FOUND,
                &format!("unknown node {node_id}"),
            ));
        }

        let mut sessions = self.sessions.lock().await;
        Ok(sessions
            .entry(node_id)
            .or_insert_with(|| SessionHandle::new(self.new_session(node_id)))
            .clone())
    }

    fn new_session(&self, node_id: u32) -> NodeSession {
        let dimmer = &self.config.dimmer;
        let heater = &self.config.heater;
        NodeSession::new(node_id, self.codec)
            .with_kind(&dimmer.duty_cycle_param, ParamKind::Percent)
            .with_kind(&dimmer.period_param, ParamKind::Integer)
            .with_kind(&heater.on_time_param, ParamKind::TimeOfDay)
            .with_kind(&heater.off_time_param, ParamKind::TimeOfDay)
    }

    async fn loaded_session(&self, node_id: u32) -> Result<SessionHandle, Response> {
        let session = self.session(node_id).await?;
        let idle = session.lock().await.status() == SessionStatus::Idle;
        if idle {
            session.refresh(&self.client).await;
        }
        Ok(session)
    }
}

pub fn router(state: AppState, web_root: PathBuf) -> Router {
    Router::new()
        .route("/dashboard/nodes", get(handle_list_nodes))
        .route("/dashboard/nodes/{node_id}", get(handle_get_node))
        .route("/dashboard/nodes/{node_id}/refresh", post(handle_refresh_node))
        .route(
            "/dashboard/nodes/{node_id}/params/{name}",
            post(handle_submit_param).put(handle_edit_param),
        )
        .route(
            "/dashboard/nodes/{node_id}/params/{name}/refresh",
            post(handle_refresh_param),
        )
        .route(
            "/dashboard/dimmer",
            get(handle_get_dimmer).post(handle_set_dimmer),
        )
        .route(
            "/dashboard/heater",
            get(handle_get_heater).post(handle_set_heater),
        )
        .route("/api/{*rest}", any(handle_proxy))
        .fallback_service(ServeDir::new(web_root))
        .with_state(state)
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = store::load_config().await;
    let web_root = config
        .web_root
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}/web", env!("CARGO_MANIFEST_DIR"))));
    let port = config.http_port;
    info!(backend = %config.backend_url, timezone = ?config.timezone, "dashboard config loaded");

    let state = AppState::new(config, reqwest::Client::new()).context("invalid timezone")?;
    let app = router(state, web_root);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind dashboard server at {addr}"))?;

    info!("dashboard listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn handle_list_nodes(State(state): State<AppState>) -> Response {
    match state.client.list_nodes(None).await {
        Ok(nodes) => Json(nodes).into_response(),
        Err(err) => {
            warn!("failed to list nodes: {err}");
            error_response(StatusCode::BAD_GATEWAY, &err.to_string())
        }
    }
}

async fn handle_get_node(State(state): State<AppState>, Path(node_id): Path<u32>) -> Response {
    let session = match state.loaded_session(node_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    Json(session.view().await).into_response()
}

async fn handle_refresh_node(State(state): State<AppState>, Path(node_id): Path<u32>) -> Response {
    let session = match state.session(node_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    session.refresh(&state.client).await;
    Json(session.view().await).into_response()
}

async fn handle_edit_param(
    State(state): State<AppState>,
    Path((node_id, name)): Path<(u32, String)>,
    Json(update): Json<DraftUpdate>,
) -> Response {
    let session = match state.session(node_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    if let Err(err) = session.edit(&name, &update.draft).await {
        return session_error_response(&err);
    }
    Json(session.view().await).into_response()
}

async fn handle_submit_param(
    State(state): State<AppState>,
    Path((node_id, name)): Path<(u32, String)>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let session = match state.session(node_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    if let Err(err) = session
        .submit(&state.client, &name, &draft_text(&request.value))
        .await
    {
        return session_error_response(&err);
    }
    Json(session.view().await).into_response()
}

async fn handle_refresh_param(
    State(state): State<AppState>,
    Path((node_id, name)): Path<(u32, String)>,
) -> Response {
    let session = match state.session(node_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    session.refresh_parameter(&state.client, &name).await;
    Json(session.view().await).into_response()
}

async fn handle_get_dimmer(State(state): State<AppState>) -> Response {
    let session = match state.loaded_session(state.config.dimmer.node_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    Json(dimmer_view(&state, session.view().await, None)).into_response()
}

async fn handle_set_dimmer(
    State(state): State<AppState>,
    Json(update): Json<DimmerUpdate>,
) -> Response {
    let dimmer = &state.config.dimmer;
    let session = match state.session(dimmer.node_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let outcome = match session
        .submit_duty_cycle_with_optimal_period(
            &state.client,
            dimmer,
            &draft_text(&update.duty_cycle),
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return session_error_response(&err),
    };

    if let Some(period) = &outcome.period {
        info!(
            duty_cycle = %outcome.duty_cycle,
            period = period.period_half_waves,
            effective = period.duty_cycle,
            "dimmer updated"
        );
    }
    Json(dimmer_view(&state, session.view().await, Some(outcome))).into_response()
}

fn dimmer_view(
    state: &AppState,
    session: SessionView,
    last_write: Option<DutyCycleOutcome>,
) -> DimmerView {
    let draft = session
        .params
        .iter()
        .find(|param| param.name == state.config.dimmer.duty_cycle_param)
        .and_then(|param| param.draft.trim().parse::<f64>().ok())
        .filter(|duty| duty.is_finite())
        .map(|duty| duty.clamp(0.0, 100.0));

    DimmerView {
        session,
        auto_period: state.config.dimmer.auto_period,
        best_period: draft.map(best_period),
        period_options: draft.map(ranked_periods).unwrap_or_default(),
        last_write,
    }
}

async fn handle_get_heater(State(state): State<AppState>) -> Response {
    let session = match state.loaded_session(state.config.heater.node_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    Json(heater_view(&state, session.view().await)).into_response()
}

async fn handle_set_heater(
    State(state): State<AppState>,
    Json(update): Json<HeaterUpdate>,
) -> Response {
    let heater = &state.config.heater;
    let session = match state.session(heater.node_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let writes = [
        (&heater.on_time_param, update.on),
        (&heater.off_time_param, update.off),
    ];
    for (name, time) in writes {
        let Some(time) = time else {
            continue;
        };
        if let Err(err) = session.submit(&state.client, name, &time).await {
            return session_error_response(&err);
        }
    }
    Json(heater_view(&state, session.view().await)).into_response()
}

fn heater_view(state: &AppState, session: SessionView) -> HeaterView {
    let committed = |name: &str| {
        session
            .params
            .iter()
            .find(|param| param.name == name)
            .map(|param| param.committed.clone())
    };
    HeaterView {
        on: committed(&state.config.heater.on_time_param),
        off: committed(&state.config.heater.off_time_param),
        session,
    }
}

/// Forwards `/api/...` to the backend unchanged.
async fn handle_proxy(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or("/");
    let url = format!("{}{path}", state.config.backend_url);

    let body = match axum::body::to_bytes(body, MAX_PROXY_BODY).await {
        Ok(body) => body,
        Err(err) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, &err.to_string()),
    };

    let mut upstream = state.proxy.request(parts.method.clone(), &url);
    for name in [header::CONTENT_TYPE, header::ACCEPT] {
        if let Some(value) = parts.headers.get(&name) {
            upstream = upstream.header(name, value.clone());
        }
    }

    let response = match upstream.body(body).send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(method = %parts.method, %url, "proxy request failed: {err}");
            return error_response(StatusCode::BAD_GATEWAY, "backend unreachable");
        }
    };

    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%url, "failed to read backend response: {err}");
            return error_response(StatusCode::BAD_GATEWAY, "backend response truncated");
        }
    };

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder.body(Body::from(bytes)).unwrap_or_else(|err| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
    })
}

/// Submit bodies may carry numbers or strings; both become draft text.
fn draft_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn session_error_response(err: &SessionError) -> Response {
    let status = match err {
        SessionError::Validation { .. } => StatusCode::BAD_REQUEST,
        SessionError::UnknownParameter(_) => StatusCode::NOT_FOUND,
        SessionError::Transport { .. } | SessionError::InvalidResponse(_) => {
            StatusCode::BAD_GATEWAY
        }
        SessionError::Cancelled => StatusCode::CONFLICT,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
