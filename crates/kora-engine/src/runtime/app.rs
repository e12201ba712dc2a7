use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::infra::sink::EngineEvents;
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use kora_core::adapter::ProtocolAdapter;
use kora_core::adapter_sim::SimulatedAdapter;
use kora_core::anomaly::{AnomalyDetector, ThresholdHeuristic};
use kora_core::error::{CommunicationError, ConfigurationError};
use kora_core::queue::ReadingQueue;
use kora_core::scan::{ScanScheduler, ScanStats, ScannerHandle};
use kora_core::status::EngineStatus;
use kora_core::tags::{demo_tags, load_tag_file, TagDefinition, TagRegistry};
use kora_core::timebase::TimeBase;
#[cfg(feature = "modbus")]
use kora_io::hal_modbus::{ModbusAdapter, RegisterAddress};
use kora_io::metrics::StatusEndpoint;
use kora_io::protocol::catalog_from_definitions;
use kora_io::{
    BackendSync, BearerToken, CredentialError, HttpRemoteStore, MemoryStore, RemoteStore,
    StoreError, SyncHandle, SyncStatsSnapshot,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("backend credentials: {0}")]
    Credential(#[from] CredentialError),

    #[error("backend client: {0}")]
    Store(#[from] StoreError),

    #[error("failed to load tags from backend after {attempts} attempt(s): {source}")]
    Catalog { attempts: u32, source: StoreError },

    #[error("device adapter: {0}")]
    Adapter(#[from] CommunicationError),

    #[error("failed to open audit log {path}: {source}")]
    Audit {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to start {what}: {source}")]
    Startup {
        what: &'static str,
        source: std::io::Error,
    },
}

impl AppError {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Configuration(_) | Self::Credential(_) => ExitCode::from(2),
            _ => ExitCode::FAILURE,
        }
    }
}

/// Device behind the scan loop, chosen at startup.
enum EngineAdapter {
    Simulated(SimulatedAdapter),
    #[cfg(feature = "modbus")]
    Modbus(ModbusAdapter),
}

impl ProtocolAdapter for EngineAdapter {
    fn connect(&mut self) -> Result<(), CommunicationError> {
        match self {
            Self::Simulated(a) => a.connect(),
            #[cfg(feature = "modbus")]
            Self::Modbus(a) => a.connect(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Simulated(a) => a.is_connected(),
            #[cfg(feature = "modbus")]
            Self::Modbus(a) => a.is_connected(),
        }
    }

    fn read(&mut self, address: &str, timeout: Duration) -> Result<f64, CommunicationError> {
        match self {
            Self::Simulated(a) => a.read(address, timeout),
            #[cfg(feature = "modbus")]
            Self::Modbus(a) => a.read(address, timeout),
        }
    }

    fn write(
        &mut self,
        address: &str,
        value: f64,
        timeout: Duration,
    ) -> Result<(), CommunicationError> {
        match self {
            Self::Simulated(a) => a.write(address, value, timeout),
            #[cfg(feature = "modbus")]
            Self::Modbus(a) => a.write(address, value, timeout),
        }
    }
}

/// Totals reported when the engine stops.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub scan: ScanStats,
    pub sync: SyncStatsSnapshot,
    pub queue_dropped: u64,
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Run with --help for usage.");
            return ExitCode::from(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }

    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());
    match run(config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Kora engine failed");
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}

/// Build the engine from `config`, run until interrupted or the run
/// duration elapses, then shut down in order: scanner, sync drain, telemetry.
pub fn run(config: RuntimeConfig) -> Result<RunSummary, AppError> {
    let run_seconds = config.run_seconds;
    run_until(config, || wait_for_shutdown(run_seconds))
}

/// [`run`] with the wait between startup and shutdown supplied by the caller.
/// The shutdown sequence runs even when `wait` fails; its error is returned
/// afterwards.
fn run_until<W>(config: RuntimeConfig, wait: W) -> Result<RunSummary, AppError>
where
    W: FnOnce() -> Result<(), AppError>,
{
    telemetry::init();
    let timebase = TimeBase::new();

    let backend = match &config.backend_url {
        Some(url) => {
            let token = BearerToken::from_env(&config.token_env)?;
            let store = HttpRemoteStore::new(
                url,
                token,
                Duration::from_millis(config.http_timeout_ms),
            )?;
            info!(url = %store.base_url(), "Forwarding readings to backend");
            Some(store)
        }
        None => None,
    };

    let definitions = load_definitions(&config, backend.as_ref())?;
    let registry = Arc::new(TagRegistry::new(definitions)?);
    info!(tags = registry.len(), "Tag registry loaded");

    let store: Box<dyn RemoteStore> = match backend {
        Some(store) => Box::new(store),
        None => {
            info!("No backend configured; readings are kept in memory");
            Box::new(MemoryStore::with_catalog(catalog_from_definitions(
                &registry.definitions(),
            )))
        }
    };

    let adapter = build_adapter(&config, &registry, &timebase)?;
    let audit = init_audit_logger(config.audit_path.as_deref())?;
    let events = Arc::new(EngineEvents::new(audit, timebase));
    let queue = Arc::new(ReadingQueue::new(config.queue_capacity));
    let status = Arc::new(EngineStatus::new());

    let heuristic = ThresholdHeuristic {
        safety_limit: config.safety_limit,
    };
    let detector = match &config.model_path {
        Some(path) => AnomalyDetector::from_model_file(path, heuristic),
        None => AnomalyDetector::new(heuristic),
    };

    let scan_config = config.scan_config();
    info!(
        period_ms = scan_config.period.as_millis() as u64,
        read_timeout_ms = scan_config.read_timeout.as_millis() as u64,
        anomaly_interval = scan_config.anomaly_interval,
        model = detector.has_model(),
        "Starting scan loop"
    );
    let scheduler = ScanScheduler::new(
        adapter,
        scan_config,
        Arc::clone(&registry),
        Arc::clone(&queue),
        timebase,
    )
    .with_sink(events.clone())
    .with_detector(detector)
    .with_status(Arc::clone(&status));

    let sync = BackendSync::new(
        store,
        Arc::clone(&registry),
        Arc::clone(&queue),
        config.sync_config(),
    )
    .with_observer(events.clone());

    let telemetry_stop = Arc::new(AtomicBool::new(false));
    let endpoint = StatusEndpoint {
        status: Arc::clone(&status),
        registry: Arc::clone(&registry),
    };
    let metrics_handle = telemetry::start_metrics_server(
        config.metrics_addr.as_deref(),
        endpoint,
        Arc::clone(&telemetry_stop),
    )
    .map_err(|source| AppError::Startup {
        what: "metrics server",
        source,
    })?;
    let updater_handle = telemetry::start_metrics_updater(
        Arc::clone(&status),
        Arc::clone(&registry),
        Arc::clone(&queue),
        Arc::clone(&telemetry_stop),
    )
    .map_err(|source| AppError::Startup {
        what: "metrics updater",
        source,
    })?;

    events.audit(
        AuditEventType::SystemStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "tags": registry.len(),
            "backend": config.backend_url.is_some(),
            "modbus": config.modbus_addr,
            "metrics_enabled": config.metrics_addr.is_some(),
        }),
    );

    let sync_stop = Arc::new(AtomicBool::new(false));
    let sync_handle = SyncHandle::spawn(sync, Arc::clone(&sync_stop)).map_err(|source| {
        telemetry_stop.store(true, Ordering::Relaxed);
        AppError::Startup {
            what: "sync thread",
            source,
        }
    })?;
    let scanner = match ScannerHandle::spawn(scheduler, Arc::new(AtomicBool::new(false))) {
        Ok(scanner) => scanner,
        Err(source) => {
            sync_stop.store(true, Ordering::Relaxed);
            sync_handle.join();
            telemetry_stop.store(true, Ordering::Relaxed);
            return Err(AppError::Startup {
                what: "scan thread",
                source,
            });
        }
    };

    info!("Kora engine running. Press Ctrl+C to stop.");
    let waited = wait();
    if let Err(e) = &waited {
        error!(error = %e, "Shutdown wait failed, stopping engine");
    }

    info!("Stopping scan loop");
    let scan = scanner.stop();
    info!(pending = queue.len(), "Draining backend queue");
    sync_stop.store(true, Ordering::Relaxed);
    let sync = sync_handle.join();

    telemetry_stop.store(true, Ordering::Relaxed);
    if updater_handle.join().is_err() {
        warn!("Metrics updater panicked");
    }
    if let Some(handle) = metrics_handle {
        if handle.join().is_err() {
            warn!("Metrics server panicked");
        }
    }

    let summary = RunSummary {
        scan,
        sync,
        queue_dropped: queue.dropped(),
    };
    info!(
        cycles_executed = summary.scan.cycles_executed,
        overruns = summary.scan.overruns,
        read_failures = summary.scan.read_failures,
        alarms = summary.scan.alarms_raised,
        anomalies = summary.scan.anomalies_detected,
        published = summary.sync.published,
        dropped = summary.sync.dropped() + summary.queue_dropped,
        "Run complete"
    );
    events.audit(
        AuditEventType::SystemShutdown,
        serde_json::json!({
            "cycles_executed": summary.scan.cycles_executed,
            "overruns": summary.scan.overruns,
            "alarms_raised": summary.scan.alarms_raised,
            "anomalies_detected": summary.scan.anomalies_detected,
            "readings_published": summary.sync.published,
            "readings_dropped": summary.sync.dropped(),
            "queue_dropped": summary.queue_dropped,
            "clean": waited.is_ok(),
        }),
    );
    waited?;
    Ok(summary)
}

fn load_definitions(
    config: &RuntimeConfig,
    backend: Option<&HttpRemoteStore>,
) -> Result<Vec<TagDefinition>, AppError> {
    if let Some(path) = &config.tags_path {
        info!(path = %path.display(), "Loading tag definitions");
        return Ok(load_tag_file(path)?);
    }
    match backend {
        Some(store) if config.tags_from_backend => {
            let (catalog, attempts) = config
                .retry_policy()
                .run(
                    None,
                    |_| store.fetch_catalog(),
                    |attempt, error, delay| {
                        warn!(
                            attempt,
                            error = %error,
                            retry_in_ms = delay.as_millis() as u64,
                            "Tag catalog fetch failed, retrying"
                        );
                    },
                )
                .map_err(|failure| AppError::Catalog {
                    attempts: failure.attempts,
                    source: failure.error,
                })?;
            info!(entries = catalog.len(), attempts, "Loaded tag catalog from backend");
            Ok(catalog
                .iter()
                .map(|entry| entry.to_definition(config.safety_limit))
                .collect())
        }
        _ => {
            info!("Using built-in demo tags");
            Ok(demo_tags())
        }
    }
}

fn build_adapter(
    config: &RuntimeConfig,
    registry: &TagRegistry,
    timebase: &TimeBase,
) -> Result<EngineAdapter, AppError> {
    match &config.modbus_addr {
        #[cfg(feature = "modbus")]
        Some(addr) => {
            for definition in registry.definitions() {
                RegisterAddress::parse(definition.address()).map_err(|e| {
                    ConfigurationError::InvalidSetting {
                        name: "--modbus",
                        reason: format!("tag {}: {e}", definition.id),
                    }
                })?;
            }
            info!(addr = %addr, "Using Modbus TCP device");
            let adapter = ModbusAdapter::new(addr, Duration::from_millis(config.read_timeout_ms))?;
            Ok(EngineAdapter::Modbus(adapter))
        }
        #[cfg(not(feature = "modbus"))]
        Some(_) => {
            let _ = registry;
            Err(ConfigurationError::InvalidSetting {
                name: "--modbus",
                reason: "built without Modbus support".to_string(),
            }
            .into())
        }
        None => {
            let seed = config.seed.unwrap_or_else(|| timebase.unix_us());
            info!(seed, "Using simulated PLC");
            Ok(EngineAdapter::Simulated(SimulatedAdapter::new(seed)))
        }
    }
}

fn init_audit_logger(audit_path: Option<&Path>) -> Result<Option<Arc<AuditLogger>>, AppError> {
    audit_path
        .map(|path| match AuditLogger::new(path) {
            Ok(logger) => {
                info!(path = %path.display(), "Audit logging enabled");
                Ok(Arc::new(logger))
            }
            Err(source) => Err(AppError::Audit {
                path: path.to_path_buf(),
                source,
            }),
        })
        .transpose()
}

fn wait_for_shutdown(run_seconds: Option<u64>) -> Result<(), AppError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| AppError::Startup {
            what: "signal runtime",
            source,
        })?;

    runtime.block_on(async {
        let deadline = async {
            match run_seconds {
                Some(seconds) => {
                    tokio::time::sleep(Duration::from_secs(seconds)).await;
                    info!(seconds, "Run duration elapsed");
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let signal = tokio::select! {
            signal = tokio::signal::ctrl_c() => Some(signal),
            _ = &mut deadline => None,
        };
        match signal {
            Some(Ok(())) => info!("Shutdown signal received"),
            Some(Err(e)) => {
                warn!(error = %e, "Cannot listen for Ctrl+C");
                deadline.await;
            }
            None => {}
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;
    use tempfile::tempdir;

    fn short_run_config(audit: &Path) -> RuntimeConfig {
        RuntimeConfig {
            period_ms: 50,
            seed: Some(11),
            drain_grace_ms: 500,
            audit_path: Some(audit.to_path_buf()),
            ..RuntimeConfig::default()
        }
    }

    fn audit_event_types(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| {
                let entry: serde_json::Value = serde_json::from_str(line).unwrap();
                entry["event_type"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }

    #[test]
    fn failed_wait_still_stops_every_thread() {
        let dir = tempdir().unwrap();
        let audit = dir.path().join("audit.jsonl");

        let started = Instant::now();
        let result = run_until(short_run_config(&audit), || {
            thread::sleep(Duration::from_millis(200));
            Err(AppError::Startup {
                what: "signal runtime",
                source: std::io::Error::other("no reactor"),
            })
        });

        assert!(matches!(
            result,
            Err(AppError::Startup {
                what: "signal runtime",
                ..
            })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        let events = audit_event_types(&audit);
        assert_eq!(events.first().map(String::as_str), Some("system_start"));
        assert_eq!(events.last().map(String::as_str), Some("system_shutdown"));
    }

    #[test]
    fn completed_wait_returns_a_summary() {
        let dir = tempdir().unwrap();
        let audit = dir.path().join("audit.jsonl");

        let summary = run_until(short_run_config(&audit), || {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .unwrap();

        assert!(summary.scan.cycles_executed >= 1);
        assert_eq!(summary.queue_dropped, 0);
    }
}
