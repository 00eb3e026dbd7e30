//! Every refresh opens a new epoch and cancels the previous one. Results are
//! applied only while their epoch is current, and never to a parameter written
//! after the refresh started.

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dashboard_common::{
    best_period, DimmerConfig, NodeDetail, ParamValue, Parameter, PeriodOption, TimeCodec,
};

use crate::client::{ClientError, NodeApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Idle,
    Loading,
    Ready,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Integer,
    Percent,
    Real,
    Boolean,
    Text,
    TimeOfDay,
}

impl ParamKind {
    pub fn infer(value: &ParamValue) -> Self {
        match value {
            ParamValue::Real(_) => Self::Real,
            ParamValue::Boolean(_) => Self::Boolean,
            ParamValue::Text(_) => Self::Text,
            ParamValue::Integer(_) | ParamValue::Empty | ParamValue::Opaque(_) => Self::Integer,
        }
    }

    pub fn parse(
        self,
        name: &str,
        draft: &str,
        codec: &TimeCodec,
    ) -> Result<ParamValue, SessionError> {
        let invalid = |reason: String| SessionError::Validation {
            name: name.to_string(),
            reason,
        };
        let trimmed = draft.trim();

        match self {
            Self::Integer => trimmed
                .parse::<i64>()
                .map(ParamValue::Integer)
                .map_err(|_| invalid(format!("{draft:?} is not an integer"))),
            Self::Percent => {
                let value = trimmed
                    .parse::<i64>()
                    .map_err(|_| invalid(format!("{draft:?} is not an integer")))?;
                if !(0..=100).contains(&value) {
                    return Err(invalid(format!("{value} is outside 0-100")));
                }
                Ok(ParamValue::Integer(value))
            }
            Self::Real => match trimmed.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(ParamValue::Real(value)),
                _ => Err(invalid(format!("{draft:?} is not a number"))),
            },
            Self::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Ok(ParamValue::Boolean(true)),
                "false" | "0" | "off" => Ok(ParamValue::Boolean(false)),
                _ => Err(invalid(format!("{draft:?} is not a boolean"))),
            },
            Self::Text => Ok(ParamValue::Text(draft.to_string())),
            Self::TimeOfDay => codec
                .encode(trimmed)
                .map(ParamValue::Integer)
                .map_err(|err| invalid(err.to_string())),
        }
    }

    pub fn format(self, value: &ParamValue, codec: &TimeCodec) -> String {
        match (self, value) {
            (Self::TimeOfDay, ParamValue::Integer(raw)) => codec.decode(*raw),
            _ => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid value for {name}: {reason}")]
    Validation { name: String, reason: String },
    #[error("{operation} failed: {message}")]
    Transport { operation: String, message: String },
    #[error("unexpected device response: {0}")]
    InvalidResponse(String),
    #[error("unknown parameter {0}")]
    UnknownParameter(String),
    #[error("request cancelled")]
    Cancelled,
}

impl SessionError {
    fn from_client(operation: &str, err: ClientError) -> Self {
        match err {
            ClientError::Cancelled => Self::Cancelled,
            other => Self::Transport {
                operation: operation.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedParam {
    pub name: String,
    pub kind: ParamKind,
    // `Empty` until the first read or write.
    pub committed: ParamValue,
    pub draft: String,
    pub default_value: Option<ParamValue>,
    pub min_value: Option<ParamValue>,
    pub max_value: Option<ParamValue>,
}

impl TrackedParam {
    pub fn is_changed(&self, codec: &TimeCodec) -> bool {
        self.draft != self.kind.format(&self.committed, codec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    Full,
    Parameter(String),
}

#[derive(Debug, Clone)]
pub struct RefreshTicket {
    pub epoch: u64,
    pub scope: RefreshScope,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Full {
        detail: Result<NodeDetail, ClientError>,
        params: Result<Vec<Parameter>, ClientError>,
    },
    Parameter(Result<Parameter, ClientError>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub name: String,
    pub value: ParamValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DutyCycleOutcome {
    #[serde(rename = "dutyCycle")]
    pub duty_cycle: ParamValue,
    pub period: Option<PeriodOption>,
    #[serde(rename = "confirmedPeriod")]
    pub confirmed_period: Option<ParamValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamView {
    pub name: String,
    pub kind: ParamKind,
    pub committed: String,
    pub draft: String,
    pub changed: bool,
    #[serde(rename = "defaultValue", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(rename = "minValue", skip_serializing_if = "Option::is_none")]
    pub min_value: Option<String>,
    #[serde(rename = "maxValue", skip_serializing_if = "Option::is_none")]
    pub max_value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(rename = "nodeId")]
    pub node_id: u32,
    pub name: Option<String>,
    pub status: SessionStatus,
    pub epoch: u64,
    pub detail: Option<NodeDetail>,
    pub params: Vec<ParamView>,
    pub errors: Vec<String>,
    #[serde(rename = "hasChanged")]
    pub has_changed: bool,
}

#[derive(Debug)]
pub struct NodeSession {
    node_id: u32,
    codec: TimeCodec,
    status: SessionStatus,
    epoch: u64,
    cancel: CancellationToken,
    detail: Option<NodeDetail>,
    params: Vec<TrackedParam>,
    kinds: HashMap<String, ParamKind>,
    errors: Vec<SessionError>,
    refresh_pending: bool,
    // Write generation when the current refresh opened, and per parameter.
    refresh_mark: u64,
    write_seq: u64,
    written_at: HashMap<String, u64>,
}

impl NodeSession {
    pub fn new(node_id: u32, codec: TimeCodec) -> Self {
        Self {
            node_id,
            codec,
            status: SessionStatus::Idle,
            epoch: 0,
            cancel: CancellationToken::new(),
            detail: None,
            params: Vec::new(),
            kinds: HashMap::new(),
            errors: Vec::new(),
            refresh_pending: false,
            refresh_mark: 0,
            write_seq: 0,
            written_at: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, name: &str, kind: ParamKind) -> Self {
        self.kinds.insert(name.to_string(), kind);
        self
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn codec(&self) -> &TimeCodec {
        &self.codec
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn detail(&self) -> Option<&NodeDetail> {
        self.detail.as_ref()
    }

    pub fn params(&self) -> &[TrackedParam] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&TrackedParam> {
        self.params.iter().find(|param| param.name == name)
    }

    pub fn errors(&self) -> &[SessionError] {
        &self.errors
    }

    pub fn has_changed(&self) -> bool {
        self.params
            .iter()
            .any(|param| param.is_changed(&self.codec))
    }

    pub fn edit(&mut self, name: &str, draft: impl Into<String>) -> Result<(), SessionError> {
        let param = self
            .params
            .iter_mut()
            .find(|param| param.name == name)
            .ok_or_else(|| SessionError::UnknownParameter(name.to_string()))?;
        param.draft = draft.into();
        Ok(())
    }

    /// Aborts the current epoch's requests without starting a new epoch.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
    }

    pub fn begin_refresh(&mut self, scope: RefreshScope) -> RefreshTicket {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.epoch += 1;
        self.status = SessionStatus::Loading;
        self.errors.clear();
        self.refresh_pending = true;
        self.refresh_mark = self.write_seq;

        RefreshTicket {
            epoch: self.epoch,
            scope,
            cancel: self.cancel.clone(),
        }
    }

    pub fn apply_refresh(&mut self, epoch: u64, outcome: RefreshOutcome) -> bool {
        if epoch != self.epoch {
            debug!(
                node_id = self.node_id,
                epoch,
                current = self.epoch,
                "discarding superseded refresh"
            );
            return false;
        }
        self.refresh_pending = false;

        match outcome {
            RefreshOutcome::Full { detail, params } => {
                match detail {
                    Ok(detail) => self.detail = Some(detail),
                    Err(err) => self.record_client_error("read node detail", err),
                }
                match params {
                    Ok(params) => self.replace_params(params),
                    Err(err) => self.record_client_error("read parameters", err),
                }
            }
            RefreshOutcome::Parameter(result) => match result {
                Ok(param) if self.written_since_refresh(&param.name) => {
                    debug!(node_id = self.node_id, name = %param.name, "keeping newer write");
                }
                Ok(param) => self.adopt(param),
                Err(err) => self.record_client_error("read parameter", err),
            },
        }

        self.settle_status();
        true
    }

    pub async fn refresh<A: NodeApi + ?Sized>(&mut self, api: &A) -> bool {
        let ticket = self.begin_refresh(RefreshScope::Full);
        let outcome = fetch(api, self.node_id, &ticket).await;
        self.apply_refresh(ticket.epoch, outcome)
    }

    pub async fn refresh_parameter<A: NodeApi + ?Sized>(&mut self, api: &A, name: &str) -> bool {
        let ticket = self.begin_refresh(RefreshScope::Parameter(name.to_string()));
        let outcome = fetch(api, self.node_id, &ticket).await;
        self.apply_refresh(ticket.epoch, outcome)
    }

    pub fn begin_submit(&mut self, name: &str, draft: &str) -> Result<PendingWrite, SessionError> {
        self.errors.clear();

        let kind = self.kind_for(name, None);
        let value = match kind.parse(name, draft, &self.codec) {
            Ok(value) => value,
            Err(err) => {
                self.errors.push(err.clone());
                self.settle_status();
                return Err(err);
            }
        };

        self.write_seq += 1;
        self.written_at.insert(name.to_string(), self.write_seq);

        match self.params.iter_mut().find(|param| param.name == name) {
            Some(param) => param.draft = draft.to_string(),
            None => self.params.push(TrackedParam {
                name: name.to_string(),
                kind,
                committed: ParamValue::Empty,
                draft: draft.to_string(),
                default_value: None,
                min_value: None,
                max_value: None,
            }),
        }
        self.status = SessionStatus::Loading;

        Ok(PendingWrite {
            name: name.to_string(),
            value,
        })
    }

    pub fn finish_submit(
        &mut self,
        pending: &PendingWrite,
        result: Result<Parameter, ClientError>,
    ) -> Result<ParamValue, SessionError> {
        match result {
            Ok(mut confirmed) => {
                if confirmed.value != pending.value {
                    info!(
                        node_id = self.node_id,
                        name = %pending.name,
                        requested = %pending.value,
                        confirmed = %confirmed.value,
                        "device adjusted written value"
                    );
                }
                confirmed.name.clone_from(&pending.name);
                let value = confirmed.value.clone();
                self.adopt(confirmed);
                self.settle_status();
                Ok(value)
            }
            Err(err) => {
                let operation = format!("write {}", pending.name);
                let err = SessionError::from_client(&operation, err);
                if err != SessionError::Cancelled {
                    warn!(node_id = self.node_id, "{err}");
                    self.errors.push(err.clone());
                }
                self.settle_status();
                Err(err)
            }
        }
    }

    pub async fn submit<A: NodeApi + ?Sized>(
        &mut self,
        api: &A,
        name: &str,
        draft: &str,
    ) -> Result<ParamValue, SessionError> {
        let pending = self.begin_submit(name, draft)?;
        let result = api
            .set_parameter(self.node_id, &pending.name, &pending.value)
            .await;
        self.finish_submit(&pending, result)
    }

    /// The period is chosen for the duty cycle the device accepted, which may
    /// differ from the draft.
    pub async fn submit_duty_cycle_with_optimal_period<A: NodeApi + ?Sized>(
        &mut self,
        api: &A,
        dimmer: &DimmerConfig,
        draft_duty_cycle: &str,
    ) -> Result<DutyCycleOutcome, SessionError> {
        let duty_cycle = self
            .submit(api, &dimmer.duty_cycle_param, draft_duty_cycle)
            .await?;
        if !dimmer.auto_period {
            return Ok(DutyCycleOutcome {
                duty_cycle,
                period: None,
                confirmed_period: None,
            });
        }

        let period = self.period_for(&duty_cycle)?;
        let confirmed_period = self
            .submit(
                api,
                &dimmer.period_param,
                &period.period_half_waves.to_string(),
            )
            .await?;

        Ok(DutyCycleOutcome {
            duty_cycle,
            period: Some(period),
            confirmed_period: Some(confirmed_period),
        })
    }

    pub fn view(&self) -> SessionView {
        let params = self
            .params
            .iter()
            .map(|param| {
                let format = |value: &ParamValue| param.kind.format(value, &self.codec);
                ParamView {
                    name: param.name.clone(),
                    kind: param.kind,
                    committed: format(&param.committed),
                    draft: param.draft.clone(),
                    changed: param.is_changed(&self.codec),
                    default_value: param.default_value.as_ref().map(format),
                    min_value: param.min_value.as_ref().map(format),
                    max_value: param.max_value.as_ref().map(format),
                }
            })
            .collect();

        SessionView {
            node_id: self.node_id,
            name: self.detail.as_ref().map(|detail| detail.name.clone()),
            status: self.status,
            epoch: self.epoch,
            detail: self.detail.clone(),
            params,
            errors: self.errors.iter().map(ToString::to_string).collect(),
            has_changed: self.has_changed(),
        }
    }

    fn period_for(&mut self, duty_cycle: &ParamValue) -> Result<PeriodOption, SessionError> {
        let percent = match duty_cycle {
            ParamValue::Integer(value) => *value as f64,
            ParamValue::Real(value) => *value,
            other => {
                let err = SessionError::InvalidResponse(format!(
                    "duty cycle {other} is not numeric"
                ));
                self.errors.push(err.clone());
                self.settle_status();
                return Err(err);
            }
        };
        Ok(best_period(percent.clamp(0.0, 100.0)))
    }

    fn kind_for(&self, name: &str, value: Option<&ParamValue>) -> ParamKind {
        if let Some(kind) = self.kinds.get(name) {
            return *kind;
        }
        if let Some(param) = self.param(name) {
            if !param.committed.is_empty() {
                return param.kind;
            }
        }
        value.map(ParamKind::infer).unwrap_or(ParamKind::Integer)
    }

    fn tracked_from(&self, param: Parameter) -> TrackedParam {
        let kind = self.kind_for(&param.name, Some(&param.value));
        TrackedParam {
            draft: kind.format(&param.value, &self.codec),
            kind,
            name: param.name,
            committed: param.value,
            default_value: param.default_value,
            min_value: param.min_value,
            max_value: param.max_value,
        }
    }

    fn written_since_refresh(&self, name: &str) -> bool {
        self.written_at
            .get(name)
            .is_some_and(|seq| *seq > self.refresh_mark)
    }

    fn replace_params(&mut self, params: Vec<Parameter>) {
        // The list endpoint carries no bounds; keep the ones a get or set
        // already reported.
        let previous = std::mem::take(&mut self.params);
        let mut params: Vec<TrackedParam> = params
            .into_iter()
            .map(|param| {
                let written = previous
                    .iter()
                    .find(|old| old.name == param.name && self.written_since_refresh(&old.name));
                if let Some(old) = written {
                    return old.clone();
                }
                let mut tracked = self.tracked_from(param);
                if let Some(old) = previous.iter().find(|old| old.name == tracked.name) {
                    tracked.default_value = tracked.default_value.or(old.default_value.clone());
                    tracked.min_value = tracked.min_value.or(old.min_value.clone());
                    tracked.max_value = tracked.max_value.or(old.max_value.clone());
                }
                tracked
            })
            .collect();
        for old in previous {
            let missing = !params.iter().any(|param| param.name == old.name);
            if missing && self.written_since_refresh(&old.name) {
                params.push(old);
            }
        }
        self.params = params;
    }

    fn adopt(&mut self, param: Parameter) {
        let tracked = self.tracked_from(param);
        match self.params.iter_mut().find(|old| old.name == tracked.name) {
            Some(existing) => {
                existing.kind = tracked.kind;
                existing.committed = tracked.committed;
                existing.draft = tracked.draft;
                if tracked.default_value.is_some() {
                    existing.default_value = tracked.default_value;
                }
                if tracked.min_value.is_some() {
                    existing.min_value = tracked.min_value;
                }
                if tracked.max_value.is_some() {
                    existing.max_value = tracked.max_value;
                }
            }
            None => self.params.push(tracked),
        }
    }

    fn record_client_error(&mut self, operation: &str, err: ClientError) {
        if err.is_cancelled() {
            debug!(node_id = self.node_id, operation, "read cancelled");
            return;
        }
        warn!(node_id = self.node_id, operation, "{err}");
        self.errors.push(SessionError::from_client(operation, err));
    }

    fn settle_status(&mut self) {
        self.status = if self.refresh_pending {
            SessionStatus::Loading
        } else if !self.errors.is_empty() {
            SessionStatus::Errored
        } else if self.detail.is_some() || !self.params.is_empty() {
            SessionStatus::Ready
        } else {
            SessionStatus::Idle
        };
    }
}

pub async fn fetch<A: NodeApi + ?Sized>(
    api: &A,
    node_id: u32,
    ticket: &RefreshTicket,
) -> RefreshOutcome {
    let cancel = Some(&ticket.cancel);
    match &ticket.scope {
        RefreshScope::Full => {
            let (detail, params) = tokio::join!(
                api.get_node_detail(node_id, cancel),
                api.get_parameters(node_id, cancel),
            );
            RefreshOutcome::Full { detail, params }
        }
        RefreshScope::Parameter(name) => {
            RefreshOutcome::Parameter(api.get_parameter(node_id, name, cancel).await)
        }
    }
}

/// The lock is never held across a network call.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<NodeSession>>,
}

impl SessionHandle {
    pub fn new(session: NodeSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, NodeSession> {
        self.inner.lock().await
    }

    pub async fn view(&self) -> SessionView {
        self.inner.lock().await.view()
    }

    pub async fn refresh<A: NodeApi + ?Sized>(&self, api: &A) -> bool {
        self.run_refresh(api, RefreshScope::Full).await
    }

    pub async fn refresh_parameter<A: NodeApi + ?Sized>(&self, api: &A, name: &str) -> bool {
        self.run_refresh(api, RefreshScope::Parameter(name.to_string()))
            .await
    }

    async fn run_refresh<A: NodeApi + ?Sized>(&self, api: &A, scope: RefreshScope) -> bool {
        let (node_id, ticket) = {
            let mut session = self.inner.lock().await;
            (session.node_id(), session.begin_refresh(scope))
        };
        let outcome = fetch(api, node_id, &ticket).await;
        self.inner.lock().await.apply_refresh(ticket.epoch, outcome)
    }

    pub async fn edit(&self, name: &str, draft: &str) -> Result<(), SessionError> {
        self.inner.lock().await.edit(name, draft)
    }

    pub async fn submit<A: NodeApi + ?Sized>(
        &self,
        api: &A,
        name: &str,
        draft: &str,
    ) -> Result<ParamValue, SessionError> {
        let (node_id, pending) = {
            let mut session = self.inner.lock().await;
            (session.node_id(), session.begin_submit(name, draft)?)
        };
        let result = api
            .set_parameter(node_id, &pending.name, &pending.value)
            .await;
        self.inner.lock().await.finish_submit(&pending, result)
    }

    pub async fn submit_duty_cycle_with_optimal_period<A: NodeApi + ?Sized>(
        &self,
        api: &A,
        dimmer: &DimmerConfig,
        draft_duty_cycle: &str,
    ) -> Result<DutyCycleOutcome, SessionError> {
        let duty_cycle = self
            .submit(api, &dimmer.duty_cycle_param, draft_duty_cycle)
            .await?;
        if !dimmer.auto_period {
            return Ok(DutyCycleOutcome {
                duty_cycle,
                period: None,
                confirmed_period: None,
            });
        }

        let period = self.inner.lock().await.period_for(&duty_cycle)?;
        let confirmed_period = self
            .submit(
                api,
                &dimmer.period_param,
                &period.period_half_waves.to_string(),
            )
            .await?;

        Ok(DutyCycleOutcome {
            duty_cycle,
            period: Some(period),
            confirmed_period: Some(confirmed_period),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
    };

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    use dashboard_common::{
        Node, OffsetSource, PARAM_DIMMER_DUTY_CYCLE, PARAM_DIMMER_PERIOD, PARAM_HEATER_ON_TIME,
    };

    use crate::client::ParamClient;

    use super::*;

    const NODE: u32 = 10;

    fn utc_codec() -> TimeCodec {
        TimeCodec::new(OffsetSource::from_timezone(Some("UTC")).unwrap())
    }

    fn duty(value: i64) -> Parameter {
        Parameter::new(PARAM_DIMMER_DUTY_CYCLE, ParamValue::Integer(value))
    }

    fn detail(name: &str) -> NodeDetail {
        NodeDetail {
            name: name.to_string(),
            extra: serde_json::Map::new(),
        }
    }

    struct ScriptedRead {
        gate: Option<Arc<Notify>>,
        result: Result<Vec<Parameter>, String>,
    }

    #[derive(Default)]
    struct FakeApi {
        reads: StdMutex<VecDeque<ScriptedRead>>,
        read_calls: AtomicUsize,
        detail_error: Option<String>,
        write_error: Option<String>,
        honor_cancel: bool,
        writes: StdMutex<Vec<(String, ParamValue)>>,
    }

    impl FakeApi {
        fn script(&self, gate: Option<Arc<Notify>>, result: Result<Vec<Parameter>, String>) {
            self.reads
                .lock()
                .unwrap()
                .push_back(ScriptedRead { gate, result });
        }

        fn writes(&self) -> Vec<(String, ParamValue)> {
            self.writes.lock().unwrap().clone()
        }

        fn clamp(name: &str, value: &ParamValue) -> ParamValue {
            match (name, value) {
                (PARAM_DIMMER_DUTY_CYCLE, ParamValue::Integer(v)) => {
                    ParamValue::Integer((*v).min(90))
                }
                _ => value.clone(),
            }
        }
    }

    #[async_trait]
    impl NodeApi for FakeApi {
        async fn list_nodes(
            &self,
            _cancel: Option<&CancellationToken>,
        ) -> Result<Vec<Node>, ClientError> {
            Ok(Vec::new())
        }

        async fn get_node_detail(
            &self,
            _node_id: u32,
            _cancel: Option<&CancellationToken>,
        ) -> Result<NodeDetail, ClientError> {
            match &self.detail_error {
                Some(message) => Err(ClientError::InvalidResponse(message.clone())),
                None => Ok(detail("org.kanthaus.dimmer")),
            }
        }

        async fn get_parameters(
            &self,
            _node_id: u32,
            cancel: Option<&CancellationToken>,
        ) -> Result<Vec<Parameter>, ClientError> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self
                .reads
                .lock()
                .unwrap()
                .pop_front()
                .expect("unscripted read");
            if let Some(gate) = scripted.gate {
                match cancel.filter(|_| self.honor_cancel) {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => return Err(ClientError::Cancelled),
                            _ = gate.notified() => {}
                        }
                    }
                    None => gate.notified().await,
                }
            }
            scripted.result.map_err(ClientError::InvalidResponse)
        }

        async fn get_parameter(
            &self,
            _node_id: u32,
            name: &str,
            _cancel: Option<&CancellationToken>,
        ) -> Result<Parameter, ClientError> {
            let mut param = Parameter::new(name, ParamValue::Integer(33));
            param.max_value = Some(ParamValue::Integer(100));
            Ok(param)
        }

        async fn set_parameter(
            &self,
            _node_id: u32,
            name: &str,
            value: &ParamValue,
        ) -> Result<Parameter, ClientError> {
            if let Some(message) = &self.write_error {
                return Err(ClientError::InvalidResponse(message.clone()));
            }
            self.writes
                .lock()
                .unwrap()
                .push((name.to_string(), value.clone()));
            Ok(Parameter::new(name, Self::clamp(name, value)))
        }
    }

    #[tokio::test]
    async fn refresh_loads_detail_and_params() {
        let api = FakeApi::default();
        api.script(None, Ok(vec![duty(40)]));
        let mut session = NodeSession::new(NODE, utc_codec());
        assert_eq!(session.status(), SessionStatus::Idle);

        assert!(session.refresh(&api).await);

        assert_eq!(session.status(), SessionStatus::Ready);
        assert_eq!(session.detail().map(|d| d.name.as_str()), Some("org.kanthaus.dimmer"));
        let param = session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap();
        assert_eq!(param.committed, ParamValue::Integer(40));
        assert_eq!(param.draft, "40");
        assert!(!session.has_changed());
    }

    #[test]
    fn superseded_results_are_discarded() {
        let mut session = NodeSession::new(NODE, utc_codec());
        let first = session.begin_refresh(RefreshScope::Full);
        let second = session.begin_refresh(RefreshScope::Full);
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());

        let applied = session.apply_refresh(
            second.epoch,
            RefreshOutcome::Full {
                detail: Ok(detail("second")),
                params: Ok(vec![duty(20)]),
            },
        );
        assert!(applied);

        let applied = session.apply_refresh(
            first.epoch,
            RefreshOutcome::Full {
                detail: Ok(detail("first")),
                params: Ok(vec![duty(10)]),
            },
        );
        assert!(!applied);
        assert_eq!(session.detail().unwrap().name, "second");
        assert_eq!(
            session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap().committed,
            ParamValue::Integer(20)
        );
    }

    #[tokio::test]
    async fn write_during_refresh_survives_its_late_read() {
        let api = Arc::new(FakeApi::default());
        let gate = Arc::new(Notify::new());
        api.script(
            Some(gate.clone()),
            Ok(vec![
                duty(40),
                Parameter::new(PARAM_DIMMER_PERIOD, ParamValue::Integer(9)),
            ]),
        );

        let handle = SessionHandle::new(NodeSession::new(NODE, utc_codec()));
        let refresh = {
            let handle = handle.clone();
            let api = api.clone();
            tokio::spawn(async move { handle.refresh(api.as_ref()).await })
        };
        while api.read_calls.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }

        let confirmed = handle
            .submit(api.as_ref(), PARAM_DIMMER_DUTY_CYCLE, "55")
            .await
            .unwrap();
        assert_eq!(confirmed, ParamValue::Integer(55));
        assert_eq!(handle.lock().await.status(), SessionStatus::Loading);

        gate.notify_one();
        assert!(refresh.await.unwrap());

        let session = handle.lock().await;
        let param = session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap();
        assert_eq!(param.committed, ParamValue::Integer(55));
        assert_eq!(param.draft, "55");
        assert_eq!(
            session.param(PARAM_DIMMER_PERIOD).unwrap().committed,
            ParamValue::Integer(9)
        );
        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(!session.has_changed());
    }

    #[test]
    fn parameter_read_older_than_write_is_ignored() {
        let mut session = NodeSession::new(NODE, utc_codec());
        let ticket =
            session.begin_refresh(RefreshScope::Parameter(PARAM_DIMMER_DUTY_CYCLE.to_string()));

        let pending = session.begin_submit(PARAM_DIMMER_DUTY_CYCLE, "70").unwrap();
        session.finish_submit(&pending, Ok(duty(70))).unwrap();
        assert_eq!(session.status(), SessionStatus::Loading);

        assert!(session.apply_refresh(ticket.epoch, RefreshOutcome::Parameter(Ok(duty(40)))));
        assert_eq!(
            session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap().committed,
            ParamValue::Integer(70)
        );
        assert_eq!(session.status(), SessionStatus::Ready);

        let ticket = session.begin_refresh(RefreshScope::Full);
        session.apply_refresh(
            ticket.epoch,
            RefreshOutcome::Full {
                detail: Ok(detail("org.kanthaus.dimmer")),
                params: Ok(vec![duty(65)]),
            },
        );
        assert_eq!(
            session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap().committed,
            ParamValue::Integer(65)
        );
    }

    #[tokio::test]
    async fn late_response_from_older_refresh_loses() {
        let api = Arc::new(FakeApi::default());
        let gate = Arc::new(Notify::new());
        api.script(Some(gate.clone()), Ok(vec![duty(10)]));
        api.script(None, Ok(vec![duty(20)]));

        let handle = SessionHandle::new(NodeSession::new(NODE, utc_codec()));
        let first = {
            let handle = handle.clone();
            let api = api.clone();
            tokio::spawn(async move { handle.refresh(api.as_ref()).await })
        };
        while api.read_calls.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }

        assert!(handle.refresh(api.as_ref()).await);
        gate.notify_one();
        assert!(!first.await.unwrap());

        let view = handle.view().await;
        assert_eq!(view.epoch, 2);
        assert_eq!(view.status, SessionStatus::Ready);
        assert_eq!(view.params[0].committed, "20");
        assert!(view.errors.is_empty());
    }

    #[tokio::test]
    async fn cancelled_reads_are_not_errors() {
        let api = Arc::new(FakeApi {
            honor_cancel: true,
            ..FakeApi::default()
        });
        let gate = Arc::new(Notify::new());
        api.script(Some(gate), Ok(vec![duty(10)]));
        api.script(None, Ok(vec![duty(20)]));

        let handle = SessionHandle::new(NodeSession::new(NODE, utc_codec()));
        let first = {
            let handle = handle.clone();
            let api = api.clone();
            tokio::spawn(async move { handle.refresh(api.as_ref()).await })
        };
        while api.read_calls.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }

        assert!(handle.refresh(api.as_ref()).await);
        assert!(!first.await.unwrap());
        assert!(handle.lock().await.errors().is_empty());
    }

    #[tokio::test]
    async fn one_failed_read_does_not_block_the_other() {
        let api = FakeApi {
            detail_error: Some("node offline".to_string()),
            ..FakeApi::default()
        };
        api.script(None, Ok(vec![duty(40)]));
        let mut session = NodeSession::new(NODE, utc_codec());

        assert!(session.refresh(&api).await);

        assert_eq!(session.status(), SessionStatus::Errored);
        assert_eq!(session.errors().len(), 1);
        assert!(session.detail().is_none());
        assert_eq!(
            session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap().committed,
            ParamValue::Integer(40)
        );
    }

    #[tokio::test]
    async fn refresh_clears_previous_errors() {
        let api = FakeApi::default();
        api.script(None, Err("timeout".to_string()));
        api.script(None, Ok(vec![duty(40)]));
        let mut session = NodeSession::new(NODE, utc_codec());

        session.refresh(&api).await;
        assert_eq!(session.errors().len(), 1);

        session.refresh(&api).await;
        assert!(session.errors().is_empty());
        assert_eq!(session.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn submit_adopts_device_value() {
        let api = FakeApi::default();
        api.script(None, Ok(vec![duty(40)]));
        let mut session = NodeSession::new(NODE, utc_codec())
            .with_kind(PARAM_DIMMER_DUTY_CYCLE, ParamKind::Percent);
        session.refresh(&api).await;

        session.edit(PARAM_DIMMER_DUTY_CYCLE, "95").unwrap();
        assert!(session.has_changed());

        let confirmed = session
            .submit(&api, PARAM_DIMMER_DUTY_CYCLE, "95")
            .await
            .unwrap();

        assert_eq!(confirmed, ParamValue::Integer(90));
        let param = session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap();
        assert_eq!(param.committed, ParamValue::Integer(90));
        assert_eq!(param.draft, "90");
        assert!(!session.has_changed());
        assert_eq!(session.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn invalid_draft_is_rejected_before_any_write() {
        let api = FakeApi::default();
        api.script(None, Ok(vec![duty(40)]));
        let mut session = NodeSession::new(NODE, utc_codec())
            .with_kind(PARAM_DIMMER_DUTY_CYCLE, ParamKind::Percent);
        session.refresh(&api).await;
        session.edit(PARAM_DIMMER_DUTY_CYCLE, "fast").unwrap();

        let err = session
            .submit(&api, PARAM_DIMMER_DUTY_CYCLE, "fast")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation { .. }));

        let err = session
            .submit(&api, PARAM_DIMMER_DUTY_CYCLE, "140")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation { .. }));

        assert!(api.writes().is_empty());
        let param = session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap();
        assert_eq!(param.draft, "fast");
        assert_eq!(param.committed, ParamValue::Integer(40));
        assert_eq!(session.errors().len(), 1);
    }

    #[tokio::test]
    async fn failed_submit_keeps_draft() {
        let api = FakeApi {
            write_error: Some("bus timeout".to_string()),
            ..FakeApi::default()
        };
        api.script(None, Ok(vec![duty(40)]));
        let mut session = NodeSession::new(NODE, utc_codec());
        session.refresh(&api).await;

        let err = session
            .submit(&api, PARAM_DIMMER_DUTY_CYCLE, "55")
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Transport { .. }));
        let param = session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap();
        assert_eq!(param.draft, "55");
        assert_eq!(param.committed, ParamValue::Integer(40));
        assert!(session.has_changed());
        assert_eq!(session.errors().len(), 1);
        assert_eq!(session.status(), SessionStatus::Errored);
    }

    #[tokio::test]
    async fn unreachable_backend_submit_is_a_transport_error() {
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        let client = ParamClient::with_http("http://127.0.0.1:1", http);
        let mut session = NodeSession::new(NODE, utc_codec());
        session.adopt(duty(40));

        let err = session
            .submit(&client, PARAM_DIMMER_DUTY_CYCLE, "55")
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Transport { .. }));
        assert_eq!(session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap().draft, "55");
        assert!(session.has_changed());
        assert_eq!(session.errors().len(), 1);
    }

    #[tokio::test]
    async fn duty_cycle_period_uses_confirmed_value() {
        let api = FakeApi::default();
        let mut session = NodeSession::new(NODE, utc_codec());
        let dimmer = DimmerConfig::default();

        // The fake device caps the duty cycle at 90.
        let outcome = session
            .submit_duty_cycle_with_optimal_period(&api, &dimmer, "95")
            .await
            .unwrap();

        let expected = best_period(90.0);
        assert_eq!(expected.period_half_waves, 9);
        assert_eq!(best_period(95.0).period_half_waves, 17);
        assert_eq!(outcome.duty_cycle, ParamValue::Integer(90));
        assert_eq!(outcome.period, Some(expected));
        assert_eq!(outcome.confirmed_period, Some(ParamValue::Integer(9)));
        assert_eq!(
            api.writes(),
            vec![
                (PARAM_DIMMER_DUTY_CYCLE.to_string(), ParamValue::Integer(95)),
                (
                    PARAM_DIMMER_PERIOD.to_string(),
                    ParamValue::Integer(i64::from(expected.period_half_waves))
                ),
            ]
        );
        assert_eq!(
            session.param(PARAM_DIMMER_PERIOD).unwrap().committed,
            ParamValue::Integer(i64::from(expected.period_half_waves))
        );
    }

    #[tokio::test]
    async fn duty_cycle_without_auto_period_writes_once() {
        let api = FakeApi::default();
        let mut session = NodeSession::new(NODE, utc_codec());
        let dimmer = DimmerConfig {
            auto_period: false,
            ..DimmerConfig::default()
        };

        let outcome = session
            .submit_duty_cycle_with_optimal_period(&api, &dimmer, "50")
            .await
            .unwrap();

        assert_eq!(outcome.period, None);
        assert_eq!(api.writes().len(), 1);
    }

    #[tokio::test]
    async fn failed_duty_cycle_write_skips_period() {
        let api = FakeApi {
            write_error: Some("bus timeout".to_string()),
            ..FakeApi::default()
        };
        let handle = SessionHandle::new(NodeSession::new(NODE, utc_codec()));

        let err = handle
            .submit_duty_cycle_with_optimal_period(&api, &DimmerConfig::default(), "50")
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Transport { .. }));
        let view = handle.view().await;
        assert_eq!(view.errors.len(), 1);
        assert!(view.params.iter().all(|p| p.name != PARAM_DIMMER_PERIOD));
    }

    #[tokio::test]
    async fn time_of_day_params_use_the_codec() {
        let api = FakeApi::default();
        api.script(
            None,
            Ok(vec![Parameter::new(
                PARAM_HEATER_ON_TIME,
                ParamValue::Integer(2358),
            )]),
        );
        let mut session =
            NodeSession::new(11, utc_codec()).with_kind(PARAM_HEATER_ON_TIME, ParamKind::TimeOfDay);
        session.refresh(&api).await;

        assert_eq!(session.param(PARAM_HEATER_ON_TIME).unwrap().draft, "09:54");

        let confirmed = session
            .submit(&api, PARAM_HEATER_ON_TIME, "06:15")
            .await
            .unwrap();
        assert_eq!(confirmed, ParamValue::Integer(6 * 256 + 15));
        assert_eq!(session.param(PARAM_HEATER_ON_TIME).unwrap().draft, "06:15");

        let err = session
            .submit(&api, PARAM_HEATER_ON_TIME, "6.15")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation { .. }));
    }

    #[tokio::test]
    async fn single_parameter_refresh_keeps_other_params() {
        let api = FakeApi::default();
        api.script(
            None,
            Ok(vec![
                duty(40),
                Parameter::new(PARAM_DIMMER_PERIOD, ParamValue::Integer(9)),
            ]),
        );
        let mut session = NodeSession::new(NODE, utc_codec());
        session.refresh(&api).await;
        session.edit(PARAM_DIMMER_PERIOD, "11").unwrap();

        assert!(session.refresh_parameter(&api, PARAM_DIMMER_DUTY_CYCLE).await);

        let param = session.param(PARAM_DIMMER_DUTY_CYCLE).unwrap();
        assert_eq!(param.committed, ParamValue::Integer(33));
        assert_eq!(param.max_value, Some(ParamValue::Integer(100)));
        assert_eq!(session.param(PARAM_DIMMER_PERIOD).unwrap().draft, "11");
        assert!(session.has_changed());
    }

    #[test]
    fn edit_of_unknown_parameter_fails() {
        let mut session = NodeSession::new(NODE, utc_codec());
        assert_eq!(
            session.edit("CONFIG_MISSING", "1"),
            Err(SessionError::UnknownParameter("CONFIG_MISSING".to_string()))
        );
    }

    #[test]
    fn kinds_parse_their_drafts() {
        let codec = utc_codec();
        assert_eq!(
            ParamKind::Boolean.parse("x", "on", &codec),
            Ok(ParamValue::Boolean(true))
        );
        assert_eq!(
            ParamKind::Real.parse("x", " 2.5 ", &codec),
            Ok(ParamValue::Real(2.5))
        );
        assert!(ParamKind::Real.parse("x", "NaN", &codec).is_err());
        assert_eq!(
            ParamKind::Text.parse("x", "eco", &codec),
            Ok(ParamValue::Text("eco".to_string()))
        );
        assert_eq!(ParamKind::infer(&ParamValue::Empty), ParamKind::Integer);
    }
}
