// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download quality reporting.
//!
//! Every attempt that obtained a correlation uuid ends in exactly one
//! quality event. Reporting is fire-and-forget: a failure to deliver is
//! logged and never changes the outcome of the download.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::redact_url;
use crate::locks::resilient_lock;

/// Outcome reported for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityStatus {
    Success,
    Failed,
    Canceled,
}

impl std::fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityStatus::Success => write!(f, "SUCCESS"),
            QualityStatus::Failed => write!(f, "FAILED"),
            QualityStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityEvent {
    pub uuid: String,
    pub asset_id: u64,
    pub status: QualityStatus,
    /// Short description of the failure, absent on success.
    pub error: Option<String>,
}

/// Destination of quality events.
pub trait QualitySink: Send + Sync {
    fn send(&self, event: &QualityEvent);
}

/// Sink that only writes events to the log.
#[derive(Debug, Default)]
pub struct LogQualitySink;

impl QualitySink for LogQualitySink {
    fn send(&self, event: &QualityEvent) {
        tracing::info!(
            uuid = %event.uuid,
            asset_id = event.asset_id,
            status = %event.status,
            error = ?event.error,
            "Download quality"
        );
    }
}

/// Sink posting events to the API.
pub struct HttpQualitySink {
    client: reqwest::blocking::Client,
    url: String,
    token: Option<String>,
}

impl HttpQualitySink {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/downloads/quality", base_url.trim_end_matches('/')),
            token,
        })
    }
}

impl QualitySink for HttpQualitySink {
    fn send(&self, event: &QualityEvent) {
        let body = json!({
            "uuid": event.uuid,
            "asset_id": event.asset_id,
            "status": event.status,
            "error": event.error,
        });
        let mut builder = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        match builder.send() {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(uuid = %event.uuid, status = %event.status, "Quality event delivered");
            }
            Ok(resp) => tracing::warn!(
                uuid = %event.uuid,
                http_status = resp.status().as_u16(),
                "Quality endpoint rejected event"
            ),
            Err(e) => tracing::warn!(
                uuid = %event.uuid,
                error = %redact_url(&e.to_string()),
                "Failed to deliver quality event"
            ),
        }
    }
}

/// Wraps a sink so each uuid is reported at most once.
pub struct QualityTracker {
    sink: Box<dyn QualitySink>,
    reported: Mutex<HashSet<String>>,
}

impl QualityTracker {
    pub fn new(sink: Box<dyn QualitySink>) -> Self {
        Self {
            sink,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Tracker that only logs.
    pub fn logging() -> Self {
        Self::new(Box::new(LogQualitySink))
    }

    /// Send the event unless its uuid was already reported. Returns whether
    /// the event was sent.
    pub fn report_once(&self, uuid: &str, asset_id: u64, status: QualityStatus, error: Option<String>) -> bool {
        if !resilient_lock(&self.reported).insert(uuid.to_string()) {
            tracing::debug!(uuid, %status, "Quality already reported for attempt");
            return false;
        }
        let event = QualityEvent {
            uuid: uuid.to_string(),
            asset_id,
            status,
            error,
        };
        self.sink.send(&event);
        true
    }

    pub fn was_reported(&self, uuid: &str) -> bool {
        resilient_lock(&self.reported).contains(uuid)
    }

    /// Forget the uuids of a finished session. Nothing reports for them
    /// again, so the set only holds attempts still in flight.
    pub fn release(&self, uuids: &[String]) {
        let mut reported = resilient_lock(&self.reported);
        for uuid in uuids {
            reported.remove(uuid);
        }
    }

    /// Uuids currently held for de-duplication.
    pub fn tracked(&self) -> usize {
        resilient_lock(&self.reported).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recording(Arc<Mutex<Vec<QualityEvent>>>);

    impl QualitySink for Recording {
        fn send(&self, event: &QualityEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_report_once_per_uuid() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let tracker = QualityTracker::new(Box::new(Recording(Arc::clone(&events))));

        assert!(tracker.report_once("u-1", 5, QualityStatus::Failed, Some("expired".into())));
        assert!(!tracker.report_once("u-1", 5, QualityStatus::Success, None));
        assert!(tracker.report_once("u-2", 5, QualityStatus::Success, None));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, QualityStatus::Failed);
        assert_eq!(events[1].uuid, "u-2");
        assert!(tracker.was_reported("u-1"));
    }

    #[test]
    fn test_release_drops_finished_uuids() {
        let tracker = QualityTracker::new(Box::new(Recording::default()));
        tracker.report_once("u-1", 5, QualityStatus::Failed, None);
        tracker.report_once("u-2", 5, QualityStatus::Success, None);
        tracker.report_once("u-3", 6, QualityStatus::Canceled, None);
        assert_eq!(tracker.tracked(), 3);

        tracker.release(&["u-1".to_string(), "u-2".to_string(), "unknown".to_string()]);
        assert_eq!(tracker.tracked(), 1);
        assert!(!tracker.was_reported("u-1"));
        assert!(tracker.was_reported("u-3"));
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&QualityStatus::Canceled).unwrap(), "\"CANCELED\"");
        assert_eq!(QualityStatus::Success.to_string(), "SUCCESS");
    }
}
