use kora_core::queue::ReadingQueue;
use kora_core::status::EngineStatus;
use kora_core::tags::TagRegistry;
use kora_io::metrics::{
    init_metrics, serve_metrics, StatusEndpoint, ENGINE_RUNNING, QUEUE_DEPTH, QUEUE_DROPPED,
    SCAN_CYCLES, SCAN_CYCLE_DURATION_US, SCAN_OVERRUNS, TAG_STALE,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const UPDATE_INTERVAL: Duration = Duration::from_millis(200);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(
    addr: Option<&str>,
    endpoint: StatusEndpoint,
    stop: Arc<AtomicBool>,
) -> io::Result<Option<thread::JoinHandle<()>>> {
    match addr {
        Some(addr) => {
            info!(addr = %addr, "Starting metrics server");
            serve_metrics(addr, endpoint, stop).map(Some)
        }
        None => Ok(None),
    }
}

/// Copy engine counters into the Prometheus registry until `stop` is set.
pub fn start_metrics_updater(
    status: Arc<EngineStatus>,
    registry: Arc<TagRegistry>,
    queue: Arc<ReadingQueue>,
    stop: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("kora-telemetry".to_string())
        .spawn(move || {
            let mut last_cycles = 0u64;
            let mut last_overruns = 0u64;
            let mut last_dropped = 0u64;
            loop {
                let cycles = status.cycles_completed();
                if cycles > last_cycles {
                    SCAN_CYCLES.inc_by(cycles - last_cycles);
                    SCAN_CYCLE_DURATION_US.observe(status.last_cycle_duration_us() as f64);
                    last_cycles = cycles;
                }
                let overruns = status.overruns();
                if overruns > last_overruns {
                    SCAN_OVERRUNS.inc_by(overruns - last_overruns);
                    last_overruns = overruns;
                }
                let dropped = queue.dropped();
                if dropped > last_dropped {
                    QUEUE_DROPPED.inc_by(dropped - last_dropped);
                    last_dropped = dropped;
                }
                QUEUE_DEPTH.set(queue.len() as i64);
                ENGINE_RUNNING.set(i64::from(status.is_running()));
                for snap in registry.snapshot() {
                    TAG_STALE
                        .with_label_values(&[snap.definition.id.as_str()])
                        .set(i64::from(snap.state.stale));
                }

                if stop.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(UPDATE_INTERVAL);
            }
        })
}
