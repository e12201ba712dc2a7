use crate::tags::{TagDefinition, TagId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub tag_id: TagId,
    pub value: f64,
    pub limit: f64,
    pub evaluated_at_us: u64,
}

/// Strict upper-limit check. Equal values and NaN never alarm.
pub fn is_alarm(value: f64, limit: f64) -> bool {
    value > limit
}

/// Level-based threshold check without deadband: an alarm is reported on
/// every evaluation while the condition holds. Performs no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlarmEvaluator;

impl AlarmEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        definition: &TagDefinition,
        value: f64,
        evaluated_at_us: u64,
    ) -> Option<AlarmEvent> {
        if !is_alarm(value, definition.alarm_limit) {
            return None;
        }
        Some(AlarmEvent {
            tag_id: definition.id.clone(),
            value,
            limit: definition.alarm_limit,
            evaluated_at_us,
        })
    }
}
