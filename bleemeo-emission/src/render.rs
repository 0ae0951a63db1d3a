//! Rendering a [`MetricPoint`] plus its cached [`Metric`] into the wire
//! message published on `v1/agent/{uuid}/data`.

use serde::Serialize;

use bleemeo_core::Metric;

use crate::point::MetricPoint;

/// Status codes as emitted by the (out-of-scope) threshold evaluator;
/// named here only for the wire rendering.
fn status_name(code: i32) -> Option<&'static str> {
    match code {
        0 => Some("ok"),
        1 => Some("warning"),
        2 => Some("critical"),
        _ => Some("unknown"),
    }
}

/// `event_grace_period` is attached only when the originating service
/// received a kill signal within the last 5 minutes and its configured
/// grace period exceeds the 60s default.
const KILL_SIGNAL_WINDOW_SECONDS: f64 = 300.0;
const DEFAULT_GRACE_PERIOD_SECONDS: f64 = 60.0;

/// Context about a service that recently received a kill signal, used
/// only to decide whether `event_grace_period` is attached to a status
/// point belonging to that service.
#[derive(Debug, Clone, Copy)]
pub struct ServiceKillSignal {
    pub killed_at_mono: f64,
    pub grace_period_seconds: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RenderedMessage {
    pub uuid: String,
    pub measurement: String,
    pub time: f64,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_grace_period: Option<f64>,
}

/// Build the wire message for `point`, now that `metric` confirms it is
/// registered. `kill_signal`, when present, is the most recent kill
/// signal recorded for the point's originating service.
pub fn render(metric: &Metric, point: &MetricPoint, now_mono: f64, kill_signal: Option<ServiceKillSignal>) -> RenderedMessage {
    let item = point.item();
    let event_grace_period = kill_signal.and_then(|signal| {
        let recently_killed = now_mono - signal.killed_at_mono <= KILL_SIGNAL_WINDOW_SECONDS;
        let non_default_grace = signal.grace_period_seconds > DEFAULT_GRACE_PERIOD_SECONDS;
        (recently_killed && non_default_grace).then_some(signal.grace_period_seconds)
    });

    RenderedMessage {
        uuid: metric.uuid.clone(),
        measurement: point.label.clone(),
        time: point.time,
        value: point.value,
        item: (!item.is_empty()).then(|| item.to_string()),
        status: point.status_code.and_then(status_name),
        check_output: point.problem_origin.clone(),
        event_grace_period,
    }
}
