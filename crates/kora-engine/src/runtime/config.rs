use kora_core::anomaly::{DEFAULT_SAFETY_LIMIT, DEFAULT_WINDOW};
use kora_core::error::ConfigurationError;
use kora_core::queue::DEFAULT_QUEUE_CAPACITY;
use kora_core::scan::ScanConfig;
use kora_io::credential::DEFAULT_TOKEN_ENV;
use kora_io::retry::RetryPolicy;
use kora_io::SyncConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub period_ms: u64,
    pub read_timeout_ms: u64,
    pub anomaly_interval: u64,
    pub anomaly_window: usize,
    pub safety_limit: f64,
    pub tags_path: Option<PathBuf>,
    pub tags_from_backend: bool,
    pub model_path: Option<PathBuf>,
    pub seed: Option<u64>,
    pub modbus_addr: Option<String>,
    pub backend_url: Option<String>,
    pub token_env: String,
    pub http_timeout_ms: u64,
    pub queue_capacity: usize,
    pub publish_attempts: u32,
    pub drain_grace_ms: u64,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            period_ms: 2_000,
            read_timeout_ms: 500,
            anomaly_interval: 5,
            anomaly_window: DEFAULT_WINDOW,
            safety_limit: DEFAULT_SAFETY_LIMIT,
            tags_path: None,
            tags_from_backend: false,
            model_path: None,
            seed: None,
            modbus_addr: None,
            backend_url: None,
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            http_timeout_ms: 5_000,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            publish_attempts: 5,
            drain_grace_ms: 5_000,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
        }
    }
}

fn value<'a>(
    args: &'a [String],
    i: &mut usize,
    flag: &'static str,
) -> Result<&'a str, ConfigurationError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| ConfigurationError::InvalidSetting {
            name: flag,
            reason: "missing value".to_string(),
        })
}

fn parse<T>(raw: &str, flag: &'static str) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigurationError::InvalidSetting {
        name: flag,
        reason: format!("'{raw}': {e}"),
    })
}

fn invalid(name: &'static str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        name,
        reason: reason.to_string(),
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigurationError> {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--run-seconds" => {
                    let seconds = parse(value(args, &mut i, "--run-seconds")?, "--run-seconds")?;
                    cfg.run_seconds = Some(seconds);
                }
                "--period-ms" => {
                    cfg.period_ms = parse(value(args, &mut i, "--period-ms")?, "--period-ms")?;
                }
                "--read-timeout-ms" => {
                    cfg.read_timeout_ms =
                        parse(value(args, &mut i, "--read-timeout-ms")?, "--read-timeout-ms")?;
                }
                "--anomaly-interval" => {
                    cfg.anomaly_interval =
                        parse(value(args, &mut i, "--anomaly-interval")?, "--anomaly-interval")?;
                }
                "--anomaly-window" => {
                    cfg.anomaly_window =
                        parse(value(args, &mut i, "--anomaly-window")?, "--anomaly-window")?;
                }
                "--safety-limit" => {
                    cfg.safety_limit =
                        parse(value(args, &mut i, "--safety-limit")?, "--safety-limit")?;
                }
                "--tags" => {
                    cfg.tags_path = Some(PathBuf::from(value(args, &mut i, "--tags")?));
                }
                "--tags-from-backend" => {
                    cfg.tags_from_backend = true;
                }
                "--model" => {
                    cfg.model_path = Some(PathBuf::from(value(args, &mut i, "--model")?));
                }
                "--seed" => {
                    cfg.seed = Some(parse(value(args, &mut i, "--seed")?, "--seed")?);
                }
                "--modbus" => {
                    cfg.modbus_addr = Some(value(args, &mut i, "--modbus")?.to_string());
                }
                "--backend-url" => {
                    cfg.backend_url = Some(value(args, &mut i, "--backend-url")?.to_string());
                }
                "--token-env" => {
                    cfg.token_env = value(args, &mut i, "--token-env")?.to_string();
                }
                "--http-timeout-ms" => {
                    cfg.http_timeout_ms =
                        parse(value(args, &mut i, "--http-timeout-ms")?, "--http-timeout-ms")?;
                }
                "--queue-capacity" => {
                    cfg.queue_capacity =
                        parse(value(args, &mut i, "--queue-capacity")?, "--queue-capacity")?;
                }
                "--publish-attempts" => {
                    cfg.publish_attempts =
                        parse(value(args, &mut i, "--publish-attempts")?, "--publish-attempts")?;
                }
                "--drain-grace-ms" => {
                    cfg.drain_grace_ms =
                        parse(value(args, &mut i, "--drain-grace-ms")?, "--drain-grace-ms")?;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    cfg.log_dir = Some(PathBuf::from(value(args, &mut i, "--log-dir")?));
                }
                "--metrics-addr" => {
                    cfg.metrics_addr = Some(value(args, &mut i, "--metrics-addr")?.to_string());
                }
                "--audit-log" => {
                    cfg.audit_path = Some(PathBuf::from(value(args, &mut i, "--audit-log")?));
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    return Ok(cfg);
                }
                other => {
                    return Err(ConfigurationError::InvalidSetting {
                        name: "argument",
                        reason: format!("unknown option '{other}'"),
                    });
                }
            }
            i += 1;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.period_ms == 0 {
            return Err(invalid("--period-ms", "must be greater than zero"));
        }
        if self.read_timeout_ms == 0 {
            return Err(invalid("--read-timeout-ms", "must be greater than zero"));
        }
        if self.anomaly_interval == 0 {
            return Err(invalid("--anomaly-interval", "must be at least 1"));
        }
        if self.anomaly_window == 0 {
            return Err(invalid("--anomaly-window", "must be at least 1"));
        }
        if !self.safety_limit.is_finite() {
            return Err(invalid("--safety-limit", "must be a finite number"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("--queue-capacity", "must be at least 1"));
        }
        if self.publish_attempts == 0 {
            return Err(invalid("--publish-attempts", "must be at least 1"));
        }
        if self.http_timeout_ms == 0 {
            return Err(invalid("--http-timeout-ms", "must be greater than zero"));
        }
        if self.token_env.trim().is_empty() {
            return Err(invalid("--token-env", "must name an environment variable"));
        }
        if self.tags_from_backend {
            if self.backend_url.is_none() {
                return Err(invalid("--tags-from-backend", "requires --backend-url"));
            }
            if self.tags_path.is_some() {
                return Err(invalid("--tags-from-backend", "cannot be combined with --tags"));
            }
        }
        Ok(())
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            period: Duration::from_millis(self.period_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            anomaly_window: self.anomaly_window,
            anomaly_interval: self.anomaly_interval,
            ..ScanConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.publish_attempts,
            ..RetryPolicy::default()
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            retry: self.retry_policy(),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            ..SyncConfig::default()
        }
    }

    pub fn print_help() {
        println!(
            r#"Kora - telemetry acquisition and monitoring engine

USAGE:
    kora-engine [OPTIONS]

ACQUISITION:
    --period-ms <MS>          Scan period [default: 2000]
    --read-timeout-ms <MS>    Per-tag read timeout [default: 500]
    --tags <PATH>             JSON tag definition file [default: built-in demo tags]
    --tags-from-backend       Load tag definitions from the backend catalog
    --modbus <ADDR>           Read a Modbus TCP device (e.g. 192.168.1.10:502);
                              tag addresses take the form ir:<reg>[/scale] or hr:<reg>[/scale]
    --seed <N>                Seed for the simulated PLC [default: time based]

ANALYSIS:
    --model <PATH>            Trained anomaly model (JSON) from train-model
    --safety-limit <VALUE>    Fallback anomaly threshold [default: 100]
    --anomaly-window <N>      Readings kept per tag for detection [default: 10]
    --anomaly-interval <N>    Run detection every N cycles [default: 5]

BACKEND:
    --backend-url <URL>       Backend base URL (e.g. http://127.0.0.1:8000);
                              readings are kept in memory when absent
    --token-env <VAR>         Variable holding the bearer token [default: KORA_API_TOKEN]
    --http-timeout-ms <MS>    Backend request timeout [default: 5000]
    --queue-capacity <N>      Readings buffered for the backend [default: 1000]
    --publish-attempts <N>    Attempts per reading before it is dropped [default: 5]
    --drain-grace-ms <MS>     Time allowed to flush the queue on shutdown [default: 5000]

OBSERVABILITY:
    --json-logs               Output logs in JSON format (for log aggregation)
    --log-dir <PATH>          Also write JSON logs to a daily rolling file
    --metrics-addr <ADDR>     Serve /metrics, /status, /health and /ready (e.g. 0.0.0.0:9090)
    --audit-log <PATH>        Append audit events to a JSONL file

GENERAL:
    --run-seconds <SECS>      Run for a fixed duration then exit
    -h, --help                Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                  Set log filter (e.g., RUST_LOG=debug,kora_io=trace)
    KORA_API_TOKEN            Bearer token for the backend (see --token-env)

EXAMPLES:
    # Standalone simulation with metrics
    kora-engine --metrics-addr 0.0.0.0:9090

    # Forward readings to the backend
    KORA_API_TOKEN=... kora-engine --backend-url http://127.0.0.1:8000 \
        --audit-log /var/log/kora/audit.jsonl

    # Short test run
    kora-engine --run-seconds 10 --period-ms 200
"#
        );
    }
}
