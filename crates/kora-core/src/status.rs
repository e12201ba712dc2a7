use crate::tags::TagRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Health counters shared between the scan thread and status readers.
#[derive(Debug, Default)]
pub struct EngineStatus {
    running: AtomicBool,
    last_cycle_unix_us: AtomicU64,
    last_cycle_duration_us: AtomicU64,
    cycles_completed: AtomicU64,
    overruns: AtomicU64,
    read_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagStatus {
    pub id: String,
    pub name: String,
    pub unit: String,
    pub value: Option<f64>,
    pub updated_at_us: Option<u64>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub is_running: bool,
    pub last_cycle_unix_us: Option<u64>,
    pub last_cycle_duration_us: u64,
    pub cycles_completed: u64,
    pub overruns: u64,
    pub read_failures: u64,
    pub tags: Vec<TagStatus>,
}

impl EngineStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Called by the scan thread after each completed cycle.
    pub fn record_cycle(&self, finished_unix_us: u64, duration_us: u64, read_failures: u64) {
        self.last_cycle_unix_us
            .store(finished_unix_us, Ordering::Release);
        self.last_cycle_duration_us
            .store(duration_us, Ordering::Relaxed);
        self.read_failures
            .fetch_add(read_failures, Ordering::Relaxed);
        self.cycles_completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Failures from a cycle that was cut short by a stop request.
    pub fn record_read_failures(&self, read_failures: u64) {
        self.read_failures
            .fetch_add(read_failures, Ordering::Relaxed);
    }

    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Acquire)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    pub fn last_cycle_duration_us(&self) -> u64 {
        self.last_cycle_duration_us.load(Ordering::Relaxed)
    }

    pub fn last_cycle_unix_us(&self) -> Option<u64> {
        match self.last_cycle_unix_us.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn report(&self, registry: &TagRegistry) -> StatusReport {
        let tags = registry
            .snapshot()
            .into_iter()
            .map(|snap| TagStatus {
                id: snap.definition.id.to_string(),
                name: snap.definition.name.clone(),
                unit: snap.definition.unit.clone(),
                value: snap.state.value,
                updated_at_us: snap.state.updated_at_us,
                stale: snap.state.stale,
            })
            .collect();

        StatusReport {
            is_running: self.is_running(),
            last_cycle_unix_us: self.last_cycle_unix_us(),
            last_cycle_duration_us: self.last_cycle_duration_us.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed(),
            overruns: self.overruns(),
            read_failures: self.read_failures(),
            tags,
        }
    }
}
