//! Delivery of finished session summaries to a remote recorder.
//!
//! The session controller only ever hands a summary to a [`SummaryDispatch`],
//! which must not block. [`spawn_reporter`] wires that hand-off to an async
//! task that submits each summary to a [`ReportSink`] and logs the outcome;
//! delivery failures never reach the session.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::session::SessionSummary;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("report rejected with HTTP status {0}")]
    Status(u16),
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ReportError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => Self::Status(status.as_u16()),
            None => Self::Transport(value.to_string()),
        }
    }
}

/// Wire shape accepted by the recording service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    pub date: DateTime<Utc>,
    pub steps: u64,
    pub start_latitude: f64,
    pub start_longitude: f64,
    pub end_latitude: f64,
    pub end_longitude: f64,
    pub time_elapsed: f64,
    /// Two-decimal string; `null` when the rate is undefined.
    pub step_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
}

impl From<&SessionSummary> for ReportPayload {
    fn from(summary: &SessionSummary) -> Self {
        Self {
            date: summary.timestamp,
            steps: summary.step_count,
            start_latitude: summary.start_fix.latitude,
            start_longitude: summary.start_fix.longitude,
            end_latitude: summary.end_fix.latitude,
            end_longitude: summary.end_fix.longitude,
            time_elapsed: summary.elapsed_seconds,
            step_rate: summary.step_rate.to_fixed(),
            distance_meters: Some(summary.distance_m),
            calories: Some(summary.calories_kcal),
        }
    }
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn submit(&self, payload: &ReportPayload) -> Result<(), ReportError>;

    /// Name used in log lines.
    fn name(&self) -> &'static str;
}

/// POSTs the payload as JSON to a fixed URL.
#[derive(Clone, Debug)]
pub struct HttpReportSink {
    url: String,
    client: reqwest::Client,
}

impl HttpReportSink {
    pub fn new(url: impl Into<String>) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ReportError::Client(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn submit(&self, payload: &ReportPayload) -> Result<(), ReportError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::Status(status.as_u16()));
        }
        debug!(url = %self.url, %status, "report accepted");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Writes the payload to the log instead of sending it anywhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn submit(&self, payload: &ReportPayload) -> Result<(), ReportError> {
        let body = serde_json::to_string(payload)?;
        info!(%body, "session report");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Non-blocking hand-off of a finished summary.
pub trait SummaryDispatch: Send {
    fn dispatch(&self, summary: SessionSummary);
}

impl SummaryDispatch for UnboundedSender<SessionSummary> {
    fn dispatch(&self, summary: SessionSummary) {
        if self.send(summary).is_err() {
            warn!("report queue closed; session summary not delivered");
        }
    }
}

/// Spawn the delivery task on the current runtime. The task runs until every
/// sender is dropped and the queue drains.
pub fn spawn_reporter<S>(sink: S) -> (UnboundedSender<SessionSummary>, JoinHandle<()>)
where
    S: ReportSink + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionSummary>();
    let handle = tokio::spawn(async move {
        while let Some(summary) = rx.recv().await {
            let payload = ReportPayload::from(&summary);
            match sink.submit(&payload).await {
                Ok(()) => info!(sink = sink.name(), steps = payload.steps, "report delivered"),
                Err(err) => error!(sink = sink.name(), error = %err, "failed to deliver report"),
            }
        }
        debug!(sink = sink.name(), "report queue drained");
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StepRate;
    use crate::GeoFix;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn summary(step_rate: StepRate) -> SessionSummary {
        SessionSummary {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 1, 30).unwrap(),
            step_count: 30,
            start_fix: GeoFix::new(40.4168, -3.7038),
            end_fix: GeoFix::new(40.4170, -3.7040),
            elapsed_seconds: 90.0,
            step_rate,
            distance_m: 27.5,
            calories_kcal: 0.11,
        }
    }

    #[derive(Clone, Default)]
    struct Recording {
        seen: Arc<Mutex<Vec<ReportPayload>>>,
        fail: bool,
    }

    #[async_trait]
    impl ReportSink for Recording {
        async fn submit(&self, payload: &ReportPayload) -> Result<(), ReportError> {
            self.seen.lock().unwrap().push(payload.clone());
            if self.fail {
                Err(ReportError::Status(503))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[test]
    fn payload_uses_service_field_names() {
        let payload = ReportPayload::from(&summary(StepRate::PerMinute(20.0)));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["date"], "2024-05-01T08:01:30Z");
        assert_eq!(json["steps"], 30);
        assert_eq!(json["startLatitude"], 40.4168);
        assert_eq!(json["endLongitude"], -3.704);
        assert_eq!(json["timeElapsed"], 90.0);
        assert_eq!(json["stepRate"], "20.00");
        assert_eq!(json["distanceMeters"], 27.5);
    }

    #[test]
    fn undefined_rate_serializes_as_null() {
        let payload = ReportPayload::from(&summary(StepRate::Undefined));
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["stepRate"].is_null());
    }

    #[tokio::test]
    async fn reporter_submits_each_summary_and_survives_failures() {
        let sink = Recording {
            fail: true,
            ..Recording::default()
        };
        let seen = sink.seen.clone();
        let (tx, handle) = spawn_reporter(sink);
        tx.dispatch(summary(StepRate::PerMinute(20.0)));
        tx.dispatch(summary(StepRate::Undefined));
        drop(tx);
        handle.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].step_rate.as_deref(), Some("20.00"));
        assert_eq!(seen[1].step_rate, None);
    }

    #[test]
    fn dispatch_to_closed_queue_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel::<SessionSummary>();
        drop(rx);
        tx.dispatch(summary(StepRate::Undefined));
    }
}
