//! In-memory stand-in for the device bridge. Serves the same REST contract as
//! the real backend so the dashboard can run without a CAN bus.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use dashboard_common::{
    Node, NodeDetail, NodeList, ParamValue, ParamWrite, Parameter, DIMMER_NODE_ID, HEATER_NODE_ID,
    PARAM_DIMMER_DUTY_CYCLE, PARAM_DIMMER_PERIOD, PARAM_HEATER_OFF_TIME, PARAM_HEATER_ON_TIME,
};

#[derive(Debug, Clone)]
pub struct SimParam {
    pub value: ParamValue,
    pub default: ParamValue,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl SimParam {
    pub fn integer(value: i64, min: i64, max: i64) -> Self {
        Self {
            value: ParamValue::Integer(value),
            default: ParamValue::Integer(value),
            min: Some(min),
            max: Some(max),
        }
    }

    fn to_parameter(&self, name: &str) -> Parameter {
        Parameter {
            name: name.to_string(),
            value: self.value.clone(),
            default_value: Some(self.default.clone()),
            min_value: self.min.map(ParamValue::Integer),
            max_value: self.max.map(ParamValue::Integer),
        }
    }

    /// Integers are clamped into range like the firmware does; anything else is
    /// stored as a string.
    fn write(&mut self, value: &Value) {
        self.value = match value.as_i64() {
            Some(requested) => {
                let low = self.min.unwrap_or(i64::MIN);
                let high = self.max.unwrap_or(i64::MAX);
                ParamValue::Integer(requested.clamp(low, high))
            }
            None => match value {
                Value::String(text) => ParamValue::Text(text.clone()),
                other => ParamValue::Text(other.to_string()),
            },
        };
    }
}

#[derive(Debug, Clone)]
pub struct SimNode {
    pub name: String,
    pub last_seen: Option<String>,
    pub params: Vec<(String, SimParam)>,
}

impl SimNode {
    fn param_mut(&mut self, name: &str) -> Option<&mut SimParam> {
        self.params
            .iter_mut()
            .find(|(param_name, _)| param_name == name)
            .map(|(_, param)| param)
    }

    fn detail(&self, node_id: u32) -> NodeDetail {
        let mut extra = serde_json::Map::new();
        extra.insert(
            "status".to_string(),
            json!({"health": 0, "mode": 0, "sub_mode": 0, "uptime_sec": 0}),
        );
        extra.insert(
            "software_version".to_string(),
            json!({"major": 1, "minor": 0}),
        );
        extra.insert("node_id".to_string(), json!(node_id));
        NodeDetail {
            name: self.name.clone(),
            extra,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Delay applied to every request before it is answered.
    pub latency: Duration,
}

#[derive(Clone)]
pub struct SimState {
    nodes: Arc<Mutex<BTreeMap<u32, SimNode>>>,
    config: SimConfig,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl SimState {
    pub fn new(config: SimConfig) -> Self {
        Self::with_nodes(config, default_nodes())
    }

    pub fn with_nodes(config: SimConfig, nodes: BTreeMap<u32, SimNode>) -> Self {
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
            config,
        }
    }

    pub async fn param_value(&self, node_id: u32, name: &str) -> Option<ParamValue> {
        let mut nodes = self.nodes.lock().await;
        let node = nodes.get_mut(&node_id)?;
        node.param_mut(name).map(|param| param.value.clone())
    }

    /// Marks every node as seen now, like a NodeStatus broadcast would.
    pub async fn heartbeat(&self) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut nodes = self.nodes.lock().await;
        for node in nodes.values_mut() {
            node.last_seen = Some(now.clone());
        }
    }

    async fn simulate_latency(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }
}

pub fn default_nodes() -> BTreeMap<u32, SimNode> {
    let mut nodes = BTreeMap::new();
    nodes.insert(
        DIMMER_NODE_ID,
        SimNode {
            name: "org.kanthaus.dimmer".to_string(),
            last_seen: None,
            params: vec![
                (
                    PARAM_DIMMER_DUTY_CYCLE.to_string(),
                    SimParam::integer(0, 0, 100),
                ),
                (PARAM_DIMMER_PERIOD.to_string(), SimParam::integer(9, 5, 17)),
            ],
        },
    );
    nodes.insert(
        HEATER_NODE_ID,
        SimNode {
            name: "org.kanthaus.heater".to_string(),
            last_seen: None,
            params: vec![
                (
                    PARAM_HEATER_ON_TIME.to_string(),
                    SimParam::integer(5 * 256 + 30, 0, 23 * 256 + 59),
                ),
                (
                    PARAM_HEATER_OFF_TIME.to_string(),
                    SimParam::integer(20 * 256, 0, 23 * 256 + 59),
                ),
            ],
        },
    );
    nodes
}

pub fn router(state: SimState) -> Router {
    Router::new()
        .route("/api/nodes", get(handle_list_nodes))
        .route("/api/nodes/{node_id}", get(handle_node_detail))
        .route("/api/nodes/{node_id}/params", get(handle_list_params))
        .route(
            "/api/nodes/{node_id}/params/{name}",
            get(handle_get_param).post(handle_set_param),
        )
        .with_state(state)
}

async fn handle_list_nodes(State(state): State<SimState>) -> impl IntoResponse {
    state.simulate_latency().await;
    let nodes = state.nodes.lock().await;
    let list = NodeList {
        nodes: nodes
            .iter()
            .map(|(id, node)| Node {
                id: *id,
                name: None,
                last_seen: node.last_seen.clone(),
            })
            .collect(),
    };
    Json(list)
}

async fn handle_node_detail(
    State(state): State<SimState>,
    Path(node_id): Path<u32>,
) -> impl IntoResponse {
    state.simulate_latency().await;
    let nodes = state.nodes.lock().await;
    match nodes.get(&node_id) {
        Some(node) => Json(node.detail(node_id)).into_response(),
        None => node_not_found(node_id),
    }
}

async fn handle_list_params(
    State(state): State<SimState>,
    Path(node_id): Path<u32>,
) -> impl IntoResponse {
    state.simulate_latency().await;
    let nodes = state.nodes.lock().await;
    let Some(node) = nodes.get(&node_id) else {
        return node_not_found(node_id);
    };

    // The bridge flattens the union here, so values go out bare.
    let params: Vec<Value> = node
        .params
        .iter()
        .map(|(name, param)| json!({"name": name, "value": ParamWrite::new(&param.value).value}))
        .collect();
    Json(params).into_response()
}

async fn handle_get_param(
    State(state): State<SimState>,
    Path((node_id, name)): Path<(u32, String)>,
) -> impl IntoResponse {
    state.simulate_latency().await;
    let mut nodes = state.nodes.lock().await;
    let Some(node) = nodes.get_mut(&node_id) else {
        return node_not_found(node_id);
    };
    match node.param_mut(&name) {
        Some(param) => Json(param.to_parameter(&name)).into_response(),
        None => param_not_found(&name),
    }
}

async fn handle_set_param(
    State(state): State<SimState>,
    Path((node_id, name)): Path<(u32, String)>,
    Json(write): Json<ParamWrite>,
) -> impl IntoResponse {
    state.simulate_latency().await;
    let mut nodes = state.nodes.lock().await;
    let Some(node) = nodes.get_mut(&node_id) else {
        return node_not_found(node_id);
    };
    match node.param_mut(&name) {
        Some(param) => {
            param.write(&write.value);
            tracing::info!(node_id, %name, value = %param.value, "parameter written");
            Json(param.to_parameter(&name)).into_response()
        }
        None => param_not_found(&name),
    }
}

fn node_not_found(node_id: u32) -> axum::response::Response {
    error_response(StatusCode::NOT_FOUND, &format!("unknown node {node_id}"))
}

fn param_not_found(name: &str) -> axum::response::Response {
    error_response(StatusCode::NOT_FOUND, &format!("unknown parameter {name}"))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
