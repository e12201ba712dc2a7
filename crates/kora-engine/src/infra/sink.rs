use super::audit::{AuditEventType, AuditLogger};
use kora_core::alarm::AlarmEvent;
use kora_core::anomaly::{AnomalyResult, DetectionStrategy};
use kora_core::error::CommunicationError;
use kora_core::events::EventSink;
use kora_core::tags::{Reading, TagId};
use kora_core::timebase::TimeBase;
use kora_io::backend_sync::{DropReason, SyncObserver};
use kora_io::metrics::{
    ALARMS, ANOMALIES, ANOMALY_CONFIDENCE, PUBLISH_RETRIES, READINGS_PUBLISHED, READ_FAILURES,
    SYNC_DROPPED, TAG_VALUE,
};
use kora_io::store::StoreError;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Audit reason for readings displaced before the sync consumer saw them.
const QUEUE_OVERFLOW: &str = "queue_overflow";

/// Fans scan and sync events out to logs, Prometheus and the audit trail.
pub struct EngineEvents {
    audit: Option<Arc<AuditLogger>>,
    timebase: TimeBase,
}

impl EngineEvents {
    pub fn new(audit: Option<Arc<AuditLogger>>, timebase: TimeBase) -> Self {
        Self { audit, timebase }
    }

    pub fn audit(&self, event_type: AuditEventType, details: serde_json::Value) {
        let Some(audit) = &self.audit else {
            return;
        };
        if let Err(e) = audit.log_event(
            self.timebase.now_us(),
            self.timebase.unix_us(),
            event_type,
            details,
        ) {
            warn!(error = %e, ?event_type, "Failed to write audit entry");
        }
    }
}

fn strategy_label(strategy: DetectionStrategy) -> &'static str {
    match strategy {
        DetectionStrategy::Model => "model",
        DetectionStrategy::Threshold => "threshold",
        DetectionStrategy::Unavailable => "unavailable",
    }
}

impl EventSink for EngineEvents {
    fn on_alarm(&self, event: &AlarmEvent) {
        warn!(
            tag = %event.tag_id,
            value = event.value,
            limit = event.limit,
            alert = true,
            "ALARM: value above limit"
        );
        ALARMS.with_label_values(&[event.tag_id.as_str()]).inc();
        self.audit(
            AuditEventType::AlarmRaised,
            json!({
                "tag": event.tag_id.as_str(),
                "value": event.value,
                "limit": event.limit,
                "evaluated_at_us": event.evaluated_at_us,
            }),
        );
    }

    fn on_anomaly(&self, result: &AnomalyResult) {
        let tag = result.tag_id.as_str();
        ANOMALY_CONFIDENCE
            .with_label_values(&[tag])
            .set(result.confidence);
        if !result.is_anomaly {
            debug!(tag, confidence = result.confidence, "{}", result.explanation);
            return;
        }
        let strategy = strategy_label(result.strategy);
        warn!(
            tag,
            confidence = result.confidence,
            strategy,
            window = result.window_size,
            "Anomaly detected: {}",
            result.explanation
        );
        ANOMALIES.with_label_values(&[tag, strategy]).inc();
        self.audit(
            AuditEventType::AnomalyDetected,
            json!({
                "tag": tag,
                "confidence": result.confidence,
                "strategy": strategy,
                "window_size": result.window_size,
                "explanation": result.explanation,
            }),
        );
    }

    fn on_reading(&self, reading: &Reading) {
        TAG_VALUE
            .with_label_values(&[reading.tag_id.as_str()])
            .set(reading.value);
    }

    fn on_read_failure(&self, tag_id: &TagId, error: &CommunicationError) {
        READ_FAILURES
            .with_label_values(&[tag_id.as_str(), error.kind()])
            .inc();
    }

    // Counted into kora_queue_dropped_total by the telemetry updater.
    fn on_reading_displaced(&self, displaced: &Reading) {
        self.audit(
            AuditEventType::ReadingDropped,
            json!({
                "tag": displaced.tag_id.as_str(),
                "value": displaced.value,
                "timestamp_us": displaced.timestamp_us,
                "reason": QUEUE_OVERFLOW,
                "detail": "reading queue full",
            }),
        );
    }
}

impl SyncObserver for EngineEvents {
    fn on_published(&self, _reading: &Reading, _attempts: u32) {
        READINGS_PUBLISHED.inc();
    }

    fn on_retry(&self, _reading: &Reading, _attempt: u32, _error: &StoreError) {
        PUBLISH_RETRIES.inc();
    }

    fn on_dropped(&self, reading: &Reading, reason: DropReason, detail: &str) {
        SYNC_DROPPED.with_label_values(&[reason.as_str()]).inc();
        self.audit(
            AuditEventType::ReadingDropped,
            json!({
                "tag": reading.tag_id.as_str(),
                "value": reading.value,
                "timestamp_us": reading.timestamp_us,
                "reason": reason.as_str(),
                "detail": detail,
            }),
        );
    }
}
