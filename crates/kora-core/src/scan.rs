use crate::adapter::ProtocolAdapter;
use crate::alarm::{AlarmEvaluator, AlarmEvent};
use crate::anomaly::{
    AnomalyDetector, AnomalyResult, HistoryWindow, ThresholdHeuristic, DEFAULT_WINDOW,
};
use crate::error::CommunicationError;
use crate::events::{EventSink, LogSink};
use crate::queue::ReadingQueue;
use crate::status::EngineStatus;
use crate::tags::{Reading, TagDefinition, TagId, TagRegistry, TagSnapshot};
use crate::timebase::TimeBase;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep while waiting for the next tick.
const IDLE_SLICE: Duration = Duration::from_millis(20);

#[derive(Clone, Debug)]
pub struct ScanConfig {
    pub period: Duration,
    pub read_timeout: Duration,
    pub anomaly_window: usize,
    /// Run anomaly detection every this many cycles.
    pub anomaly_interval: u64,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(2),
            read_timeout: Duration::from_millis(500),
            anomaly_window: DEFAULT_WINDOW,
            anomaly_interval: 5,
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct ScanStats {
    pub cycles_executed: u64,
    pub overruns: u64,
    pub interrupted_cycles: u64,
    pub last_cycle_us: u64,
    pub max_cycle_us: u64,
    pub reads_ok: u64,
    pub read_failures: u64,
    pub alarms_raised: u64,
    pub anomalies_detected: u64,
    pub readings_enqueued: u64,
    pub readings_displaced: u64,
}

/// What one cycle produced.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub tags_read: usize,
    pub tags_failed: usize,
    pub readings_enqueued: usize,
    /// Older readings pushed out of a full queue by this cycle.
    pub readings_displaced: usize,
    /// Tags whose read failed this cycle.
    pub failed_tags: Vec<TagId>,
    pub alarms: Vec<AlarmEvent>,
    pub anomalies: Vec<AnomalyResult>,
    pub interrupted: bool,
}

/// Drives read → cache update → alarm check → enqueue, once per period.
pub struct ScanScheduler<A: ProtocolAdapter> {
    adapter: A,
    config: ScanConfig,
    registry: Arc<TagRegistry>,
    queue: Arc<ReadingQueue>,
    sink: Arc<dyn EventSink>,
    status: Arc<EngineStatus>,
    evaluator: AlarmEvaluator,
    detector: AnomalyDetector,
    history: HashMap<TagId, HistoryWindow>,
    stats: ScanStats,
    timebase: TimeBase,
}

impl<A: ProtocolAdapter> ScanScheduler<A> {
    pub fn new(
        adapter: A,
        config: ScanConfig,
        registry: Arc<TagRegistry>,
        queue: Arc<ReadingQueue>,
        timebase: TimeBase,
    ) -> Self {
        Self {
            adapter,
            config,
            registry,
            queue,
            sink: Arc::new(LogSink),
            status: Arc::new(EngineStatus::new()),
            evaluator: AlarmEvaluator::new(),
            detector: AnomalyDetector::new(ThresholdHeuristic::default()),
            history: HashMap::new(),
            stats: ScanStats::default(),
            timebase,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_detector(mut self, detector: AnomalyDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_status(mut self, status: Arc<EngineStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> Arc<EngineStatus> {
        Arc::clone(&self.status)
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    /// Run cycles until `stop` is set. The flag is checked between tags, so
    /// an in-flight read always completes or times out first.
    pub fn run(&mut self, stop: &AtomicBool) -> ScanStats {
        self.status.set_running(true);
        log::info!(
            "Scan loop started: {} tags, period {} ms",
            self.registry.len(),
            self.config.period.as_millis()
        );

        let mut next_cycle = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            self.run_cycle(stop);

            next_cycle += self.config.period;
            let now = Instant::now();
            if now >= next_cycle {
                // Start the next cycle right away and re-anchor: no backlog.
                self.stats.overruns += 1;
                self.status.record_overrun();
                log::warn!(
                    "Scan cycle overran its {} ms period by {} ms",
                    self.config.period.as_millis(),
                    now.duration_since(next_cycle).as_millis()
                );
                next_cycle = now;
            } else {
                sleep_until(next_cycle, stop);
            }
        }

        self.status.set_running(false);
        log::info!(
            "Scan loop stopped after {} cycles ({} overruns)",
            self.stats.cycles_executed,
            self.stats.overruns
        );
        self.stats.clone()
    }

    /// One pass over every tag in the registry.
    pub fn run_cycle(&mut self, stop: &AtomicBool) -> CycleReport {
        let cycle_start = Instant::now();
        let mut report = CycleReport::default();
        let tags = self.registry.snapshot();

        if self.ensure_connected(stop) {
            for tag in &tags {
                if stop.load(Ordering::Relaxed) {
                    report.interrupted = true;
                    break;
                }
                self.scan_tag(tag, &mut report);
            }
        } else {
            for tag in &tags {
                self.mark_stale(&tag.definition.id, "adapter not connected");
                report.failed_tags.push(tag.definition.id.clone());
            }
            report.tags_failed = tags.len();
        }

        self.stats.read_failures += report.tags_failed as u64;
        if report.interrupted {
            // Failures seen before the stop still count; the cycle does not.
            self.stats.interrupted_cycles += 1;
            self.status.record_read_failures(report.tags_failed as u64);
            log::debug!(
                "Scan cycle interrupted: {} read, {} failed",
                report.tags_read,
                report.tags_failed
            );
            return report;
        }

        self.stats.cycles_executed += 1;
        let interval = self.config.anomaly_interval.max(1);
        if self.stats.cycles_executed % interval == 0 {
            self.run_anomaly_pass(&tags, &mut report);
        }

        let cycle_us = cycle_start.elapsed().as_micros() as u64;
        self.stats.last_cycle_us = cycle_us;
        self.stats.max_cycle_us = self.stats.max_cycle_us.max(cycle_us);
        self.status
            .record_cycle(self.timebase.unix_us(), cycle_us, report.tags_failed as u64);
        log::debug!(
            "Scan cycle complete: {} read, {} failed, {} alarms",
            report.tags_read,
            report.tags_failed,
            report.alarms.len()
        );
        report
    }

    /// Connect if needed. Backoff between attempts ends early on stop.
    fn ensure_connected(&mut self, stop: &AtomicBool) -> bool {
        if self.adapter.is_connected() {
            return true;
        }
        let attempts = self.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.adapter.connect() {
                Ok(()) => return true,
                Err(e) => {
                    log::warn!("Adapter connect attempt {}/{} failed: {}", attempt, attempts, e);
                    if attempt == attempts || stop.load(Ordering::Relaxed) {
                        break;
                    }
                    sleep_until(Instant::now() + self.config.connect_backoff, stop);
                }
            }
        }
        false
    }

    fn scan_tag(&mut self, tag: &TagSnapshot, report: &mut CycleReport) {
        let definition = &tag.definition;
        let timeout = self.config.read_timeout;
        let started = Instant::now();

        let raw = match self.adapter.read(definition.address(), timeout) {
            Ok(_) if started.elapsed() > timeout => Err(CommunicationError::Timeout {
                address: definition.address().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(raw) if !raw.is_finite() => Err(CommunicationError::Device {
                address: definition.address().to_string(),
                message: format!("non-finite value {raw}"),
            }),
            other => other,
        };

        let value = match raw {
            Ok(raw) => definition.data_type.coerce(raw),
            Err(e) => {
                log::warn!(
                    "Read failed for tag {} at {} ({}): {}",
                    definition.id,
                    definition.address(),
                    e.kind(),
                    e
                );
                self.sink.on_read_failure(&definition.id, &e);
                self.mark_stale(&definition.id, &e.to_string());
                report.tags_failed += 1;
                report.failed_tags.push(definition.id.clone());
                return;
            }
        };

        // Strictly after the previous sample even if the clock has not ticked.
        let floor = tag.state.updated_at_us.map_or(0, |prev| prev + 1);
        let timestamp_us = self.timebase.unix_us().max(floor);

        if let Err(e) = self.registry.update(&definition.id, value, timestamp_us) {
            log::warn!("Discarding value for {}: {}", definition.id, e);
            report.tags_failed += 1;
            report.failed_tags.push(definition.id.clone());
            return;
        }
        report.tags_read += 1;
        self.stats.reads_ok += 1;

        self.history
            .entry(definition.id.clone())
            .or_insert_with(|| HistoryWindow::new(self.config.anomaly_window))
            .push(value);

        self.check_alarm(definition, value, timestamp_us, report);

        let reading = Reading {
            tag_id: definition.id.clone(),
            value,
            timestamp_us,
        };
        self.sink.on_reading(&reading);
        if let Some(displaced) = self.queue.push(reading) {
            report.readings_displaced += 1;
            self.stats.readings_displaced += 1;
            self.sink.on_reading_displaced(&displaced);
        }
        report.readings_enqueued += 1;
        self.stats.readings_enqueued += 1;
    }

    fn check_alarm(
        &mut self,
        definition: &TagDefinition,
        value: f64,
        timestamp_us: u64,
        report: &mut CycleReport,
    ) {
        if let Some(event) = self.evaluator.evaluate(definition, value, timestamp_us) {
            self.stats.alarms_raised += 1;
            self.sink.on_alarm(&event);
            report.alarms.push(event);
        }
    }

    fn run_anomaly_pass(&mut self, tags: &[TagSnapshot], report: &mut CycleReport) {
        for tag in tags {
            let id = &tag.definition.id;
            // A tag that just went stale has nothing new to score.
            if report.failed_tags.contains(id) {
                continue;
            }
            let Some(window) = self.history.get(id) else {
                continue;
            };
            let result = self.detector.detect(id, &window.newest_first());
            if result.is_anomaly {
                self.stats.anomalies_detected += 1;
            }
            self.sink.on_anomaly(&result);
            report.anomalies.push(result);
        }
        // Forget windows of tags removed from the registry.
        self.history
            .retain(|id, _| tags.iter().any(|t| &t.definition.id == id));
    }

    fn mark_stale(&self, id: &TagId, reason: &str) {
        if let Err(e) = self.registry.mark_stale(id, reason) {
            log::debug!("Could not mark {} stale: {}", id, e);
        }
    }
}

fn sleep_until(deadline: Instant, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(IDLE_SLICE));
    }
}

/// Scan loop running on its own thread.
pub struct ScannerHandle {
    stop: Arc<AtomicBool>,
    join: thread::JoinHandle<ScanStats>,
}

impl ScannerHandle {
    pub fn spawn<A>(mut scheduler: ScanScheduler<A>, stop: Arc<AtomicBool>) -> std::io::Result<Self>
    where
        A: ProtocolAdapter + 'static,
    {
        let stop_scan = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("kora-scan".to_string())
            .spawn(move || scheduler.run(&stop_scan))?;
        Ok(Self { stop, join })
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal stop and wait for the loop to exit at the next tag boundary.
    pub fn stop(self) -> ScanStats {
        self.stop.store(true, Ordering::Relaxed);
        self.join()
    }

    /// Wait for the loop to exit on its own (the stop flag is shared).
    pub fn join(self) -> ScanStats {
        match self.join.join() {
            Ok(stats) => stats,
            Err(_) => {
                log::error!("Scan thread panicked");
                ScanStats::default()
            }
        }
    }
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::adapter_sim::SimulatedAdapter;
    use crate::tags::demo_tags;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        alarms: Mutex<Vec<AlarmEvent>>,
        anomalies: Mutex<Vec<AnomalyResult>>,
        displaced: Mutex<Vec<Reading>>,
        stop_after_first_reading: Option<Arc<AtomicBool>>,
    }

    impl EventSink for RecordingSink {
        fn on_alarm(&self, event: &AlarmEvent) {
            self.alarms.lock().unwrap().push(event.clone());
        }

        fn on_anomaly(&self, result: &AnomalyResult) {
            self.anomalies.lock().unwrap().push(result.clone());
        }

        fn on_reading(&self, _reading: &Reading) {
            if let Some(stop) = &self.stop_after_first_reading {
                stop.store(true, Ordering::Relaxed);
            }
        }

        fn on_reading_displaced(&self, displaced: &Reading) {
            self.displaced.lock().unwrap().push(displaced.clone());
        }
    }

    fn test_config() -> ScanConfig {
        ScanConfig {
            period: Duration::from_millis(10),
            read_timeout: Duration::from_millis(200),
            anomaly_interval: 1,
            connect_backoff: Duration::ZERO,
            ..ScanConfig::default()
        }
    }

    fn scheduler(
        sim: SimulatedAdapter,
        defs: Vec<TagDefinition>,
        config: ScanConfig,
    ) -> (ScanScheduler<SimulatedAdapter>, Arc<TagRegistry>, Arc<ReadingQueue>) {
        let registry = Arc::new(TagRegistry::new(defs).unwrap());
        let queue = Arc::new(ReadingQueue::new(100));
        let scheduler = ScanScheduler::new(
            sim,
            config,
            Arc::clone(&registry),
            Arc::clone(&queue),
            TimeBase::new(),
        );
        (scheduler, registry, queue)
    }

    fn timestamp(registry: &TagRegistry, id: &str) -> Option<u64> {
        registry.get(&TagId::from(id)).unwrap().state.updated_at_us
    }

    #[test]
    fn timestamp_advances_only_for_successful_reads() {
        let mut sim = SimulatedAdapter::new(3);
        // Cycle order is F01, P01, T01. P01 fails on the second cycle.
        sim.script("P01", [10.0]);
        sim.fail_next("P01", 1);
        let (mut scan, registry, queue) = scheduler(sim, demo_tags(), test_config());
        let stop = AtomicBool::new(false);

        let first = scan.run_cycle(&stop);
        assert_eq!(first.tags_read, 3);
        let before: Vec<_> = ["F01", "P01", "T01"]
            .iter()
            .map(|id| timestamp(&registry, id).unwrap())
            .collect();

        let second = scan.run_cycle(&stop);
        assert_eq!(second.tags_read, 2);
        assert_eq!(second.tags_failed, 1);
        assert!(!second.interrupted);

        assert!(timestamp(&registry, "F01").unwrap() > before[0]);
        assert_eq!(timestamp(&registry, "P01").unwrap(), before[1]);
        assert!(timestamp(&registry, "T01").unwrap() > before[2]);

        let p01 = registry.get(&TagId::from("P01")).unwrap().state;
        assert!(p01.stale);
        assert_eq!(p01.value, Some(10.0));

        // Three readings from the first cycle, two from the second.
        assert_eq!(queue.len(), 5);
        let p01_readings = std::iter::from_fn(|| queue.pop())
            .filter(|r| r.tag_id == TagId::from("P01"))
            .count();
        assert_eq!(p01_readings, 1);
    }

    #[test]
    fn end_to_end_alarm_and_anomaly_on_third_reading() {
        let mut sim = SimulatedAdapter::new(1);
        sim.script("T01", [50.0, 60.0, 150.0]);
        let defs = vec![TagDefinition::new("T01", "Boiler_Temp", "°C", 100.0)];
        let (scan, _registry, queue) = scheduler(sim, defs, test_config());
        let sink = Arc::new(RecordingSink::default());
        let mut scan = scan.with_sink(sink.clone());
        let stop = AtomicBool::new(false);

        let reports: Vec<_> = (0..3).map(|_| scan.run_cycle(&stop)).collect();

        assert!(reports[0].alarms.is_empty());
        assert!(reports[1].alarms.is_empty());
        assert_eq!(reports[2].alarms.len(), 1);
        assert_eq!(reports[2].alarms[0].value, 150.0);
        assert_eq!(reports[2].alarms[0].limit, 100.0);

        assert!(!reports[0].anomalies[0].is_anomaly);
        assert!(!reports[1].anomalies[0].is_anomaly);
        let third = &reports[2].anomalies[0];
        assert!(third.is_anomaly);
        assert!(third.confidence >= 0.9);
        assert!(third.explanation.contains("exceeds"));
        assert_eq!(third.window_size, 3);

        assert_eq!(sink.alarms.lock().unwrap().len(), 1);
        assert_eq!(sink.anomalies.lock().unwrap().len(), 3);
        let values: Vec<f64> = std::iter::from_fn(|| queue.pop()).map(|r| r.value).collect();
        assert_eq!(values, vec![50.0, 60.0, 150.0]);
    }

    #[test]
    fn stop_is_honoured_at_the_next_tag_boundary() {
        let stop = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(RecordingSink {
            stop_after_first_reading: Some(Arc::clone(&stop)),
            ..RecordingSink::default()
        });
        let (scan, registry, queue) =
            scheduler(SimulatedAdapter::new(5), demo_tags(), test_config());
        let mut scan = scan.with_sink(sink);

        let report = scan.run_cycle(&stop);
        assert!(report.interrupted);
        assert_eq!(report.tags_read, 1);
        assert_eq!(queue.len(), 1);
        assert!(timestamp(&registry, "F01").is_some());
        assert!(timestamp(&registry, "T01").is_none());
        assert_eq!(scan.stats().interrupted_cycles, 1);
        assert_eq!(scan.stats().cycles_executed, 0);
    }

    #[test]
    fn stop_waits_for_in_flight_read() {
        let mut sim = SimulatedAdapter::new(9);
        sim.set_latency("T01", Duration::from_millis(300));
        let defs = vec![TagDefinition::new("T01", "Boiler_Temp", "°C", 100.0)];
        let config = ScanConfig {
            read_timeout: Duration::from_secs(1),
            ..test_config()
        };
        let (scan, registry, _queue) = scheduler(sim, defs, config);
        let status = scan.status();

        let handle = ScannerHandle::spawn(scan, Arc::new(AtomicBool::new(false))).unwrap();
        thread::sleep(Duration::from_millis(100));
        let stats = handle.stop();

        assert_eq!(stats.cycles_executed, 1);
        assert!(timestamp(&registry, "T01").is_some());
        assert!(!status.is_running());
    }

    #[test]
    fn overrunning_cycles_start_immediately_without_backlog() {
        let mut sim = SimulatedAdapter::new(2);
        sim.set_latency("T01", Duration::from_millis(30));
        let defs = vec![TagDefinition::new("T01", "Boiler_Temp", "°C", 100.0)];
        let (scan, _registry, _queue) = scheduler(sim, defs, test_config());

        let handle = ScannerHandle::spawn(scan, Arc::new(AtomicBool::new(false))).unwrap();
        thread::sleep(Duration::from_millis(200));
        let stats = handle.stop();

        assert!(stats.cycles_executed >= 2);
        assert!(stats.overruns >= 1);
        // Back-to-back cycles never exceed what the elapsed time allows.
        assert!(stats.cycles_executed <= 10);
    }

    #[test]
    fn slow_read_becomes_timeout_and_stale() {
        let mut sim = SimulatedAdapter::new(4);
        sim.set_latency("T01", Duration::from_millis(100));
        let defs = vec![TagDefinition::new("T01", "Boiler_Temp", "°C", 100.0)];
        let config = ScanConfig {
            read_timeout: Duration::from_millis(20),
            ..test_config()
        };
        let (mut scan, registry, queue) = scheduler(sim, defs, config);

        let report = scan.run_cycle(&AtomicBool::new(false));
        assert_eq!(report.tags_failed, 1);
        assert!(queue.is_empty());
        let state = registry.get(&TagId::from("T01")).unwrap().state;
        assert!(state.stale);
        assert!(state.last_error.unwrap().contains("timed out"));
    }

    #[test]
    fn unreachable_device_marks_every_tag_stale() {
        let mut sim = SimulatedAdapter::new(4);
        sim.fail_connects(3);
        let (mut scan, registry, queue) = scheduler(sim, demo_tags(), test_config());

        let report = scan.run_cycle(&AtomicBool::new(false));
        assert_eq!(report.tags_failed, 3);
        assert!(queue.is_empty());
        assert!(registry.snapshot().iter().all(|t| t.state.stale));
        assert_eq!(scan.adapter_mut().connect_calls(), 3);

        // The device comes back on the next cycle.
        let report = scan.run_cycle(&AtomicBool::new(false));
        assert_eq!(report.tags_read, 3);
        assert!(registry.snapshot().iter().all(|t| !t.state.stale));
    }

    #[test]
    fn anomaly_pass_runs_on_its_interval() {
        let config = ScanConfig {
            anomaly_interval: 2,
            ..test_config()
        };
        let (mut scan, _registry, _queue) =
            scheduler(SimulatedAdapter::new(8), demo_tags(), config);
        let stop = AtomicBool::new(false);
        assert!(scan.run_cycle(&stop).anomalies.is_empty());
        assert_eq!(scan.run_cycle(&stop).anomalies.len(), 3);
        assert!(scan.run_cycle(&stop).anomalies.is_empty());
    }

    #[test]
    fn tags_added_between_cycles_are_scanned() {
        let (mut scan, registry, _queue) =
            scheduler(SimulatedAdapter::new(8), demo_tags(), test_config());
        let stop = AtomicBool::new(false);
        scan.run_cycle(&stop);
        registry
            .add_tag(TagDefinition::new("L01", "Tank_Level", "%", 95.0))
            .unwrap();
        assert_eq!(scan.run_cycle(&stop).tags_read, 4);
    }

    #[test]
    fn full_queue_displaces_oldest_without_slowing_the_scan() {
        let config = ScanConfig {
            period: Duration::from_millis(50),
            ..test_config()
        };
        let period = config.period;
        let registry = Arc::new(TagRegistry::new(demo_tags()).unwrap());
        // Nothing consumes this queue.
        let queue = Arc::new(ReadingQueue::new(1));
        let sink = Arc::new(RecordingSink::default());
        let mut scan = ScanScheduler::new(
            SimulatedAdapter::new(6),
            config,
            Arc::clone(&registry),
            Arc::clone(&queue),
            TimeBase::new(),
        )
        .with_sink(sink.clone());
        let stop = AtomicBool::new(false);

        for cycle in 0..5 {
            let started = Instant::now();
            let report = scan.run_cycle(&stop);
            assert!(started.elapsed() < period, "cycle {cycle} blocked on the queue");
            assert_eq!(report.readings_enqueued, 3);
            let expected_displaced = if cycle == 0 { 2 } else { 3 };
            assert_eq!(report.readings_displaced, expected_displaced);
        }

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dropped(), 14);
        assert_eq!(scan.stats().readings_displaced, 14);
        assert_eq!(sink.displaced.lock().unwrap().len(), 14);
        // The survivor is the newest reading of the last cycle.
        let survivor = queue.pop().unwrap();
        assert_eq!(survivor.tag_id, TagId::from("T01"));
        assert_eq!(Some(survivor.timestamp_us), timestamp(&registry, "T01"));
    }

    #[test]
    fn non_finite_read_is_a_device_error() {
        let mut sim = SimulatedAdapter::new(3);
        sim.script("T01", [f64::NAN, f64::INFINITY, 42.0]);
        let defs = vec![TagDefinition::new("T01", "Boiler_Temp", "°C", 100.0)];
        let (mut scan, registry, queue) = scheduler(sim, defs, test_config());
        let stop = AtomicBool::new(false);

        for _ in 0..2 {
            let report = scan.run_cycle(&stop);
            assert_eq!(report.tags_failed, 1);
            assert!(report.alarms.is_empty());
        }
        assert!(queue.is_empty());
        let state = registry.get(&TagId::from("T01")).unwrap().state;
        assert!(state.stale);
        assert!(state.value.is_none());
        assert!(state.last_error.unwrap().contains("non-finite"));

        assert_eq!(scan.run_cycle(&stop).tags_read, 1);
        assert_eq!(queue.pop().unwrap().value, 42.0);
    }

    #[test]
    fn anomaly_pass_skips_tags_that_failed_this_cycle() {
        let mut sim = SimulatedAdapter::new(3);
        sim.script("P01", [10.0]);
        sim.fail_next("P01", 1);
        let (scan, _registry, _queue) = scheduler(sim, demo_tags(), test_config());
        let sink = Arc::new(RecordingSink::default());
        let mut scan = scan.with_sink(sink.clone());
        let stop = AtomicBool::new(false);

        assert_eq!(scan.run_cycle(&stop).anomalies.len(), 3);

        let report = scan.run_cycle(&stop);
        assert_eq!(report.failed_tags, vec![TagId::from("P01")]);
        let scored: Vec<&TagId> = report.anomalies.iter().map(|a| &a.tag_id).collect();
        assert_eq!(scored, vec![&TagId::from("F01"), &TagId::from("T01")]);
        assert_eq!(sink.anomalies.lock().unwrap().len(), 5);
    }

    #[test]
    fn interrupted_cycle_still_records_read_failures() {
        let mut sim = SimulatedAdapter::new(5);
        // Cycle order is F01, P01, T01: F01 fails, P01 triggers the stop.
        sim.fail_next("F01", 1);
        let stop = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(RecordingSink {
            stop_after_first_reading: Some(Arc::clone(&stop)),
            ..RecordingSink::default()
        });
        let (scan, registry, _queue) = scheduler(sim, demo_tags(), test_config());
        let mut scan = scan.with_sink(sink);
        let status = scan.status();

        let report = scan.run_cycle(&stop);
        assert!(report.interrupted);
        assert_eq!(report.tags_read, 1);
        assert_eq!(report.tags_failed, 1);
        assert!(registry.get(&TagId::from("F01")).unwrap().state.stale);

        assert_eq!(scan.stats().read_failures, 1);
        assert_eq!(scan.stats().cycles_executed, 0);
        assert_eq!(status.read_failures(), 1);
        assert_eq!(status.cycles_completed(), 0);
    }

    #[test]
    fn stop_cuts_connect_backoff_short() {
        let mut sim = SimulatedAdapter::new(4);
        sim.fail_connects(10);
        let config = ScanConfig {
            connect_attempts: 3,
            connect_backoff: Duration::from_secs(10),
            ..test_config()
        };
        let (mut scan, registry, _queue) = scheduler(sim, demo_tags(), config);

        let stop = Arc::new(AtomicBool::new(false));
        let stopper = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                stop.store(true, Ordering::Relaxed);
            })
        };

        let started = Instant::now();
        let report = scan.run_cycle(&stop);
        stopper.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.tags_failed, 3);
        assert!(registry.snapshot().iter().all(|t| t.state.stale));
        // One backoff was cut short; no third attempt follows the stop.
        assert_eq!(scan.adapter_mut().connect_calls(), 2);
    }
}
