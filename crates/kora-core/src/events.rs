use crate::alarm::AlarmEvent;
use crate::anomaly::AnomalyResult;
use crate::error::CommunicationError;
use crate::tags::{Reading, TagId};

/// Receives what each scan cycle derives. Storage and alerting live behind
/// this seam; implementations must not block the scan thread for long.
pub trait EventSink: Send + Sync {
    fn on_alarm(&self, event: &AlarmEvent);

    fn on_anomaly(&self, result: &AnomalyResult);

    fn on_reading(&self, _reading: &Reading) {}

    fn on_read_failure(&self, _tag_id: &TagId, _error: &CommunicationError) {}

    /// `displaced` was pushed out of the full reading queue unsent.
    fn on_reading_displaced(&self, _displaced: &Reading) {}
}

/// Sink that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_alarm(&self, event: &AlarmEvent) {
        log::warn!(
            "ALARM {}: value {} above limit {}",
            event.tag_id,
            event.value,
            event.limit
        );
    }

    fn on_anomaly(&self, result: &AnomalyResult) {
        if result.is_anomaly {
            log::warn!(
                "Anomaly on {} (confidence {:.2}): {}",
                result.tag_id,
                result.confidence,
                result.explanation
            );
        } else {
            log::debug!("{}: {}", result.tag_id, result.explanation);
        }
    }
}
