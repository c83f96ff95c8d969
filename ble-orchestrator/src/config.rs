use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: f64) -> Duration {
    Duration::from_secs_f64(env_parsed(key, default_secs))
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok()
}

/// Daemon-wide configuration, read once at startup from the environment and
/// passed by `Arc` to every component. There is no config-file format or
/// hot-reload — the surface is small enough that `std::env` is the idiomatic
/// match, the same way the teacher's CLIs lean on `clap` only for argument
/// parsing rather than a dedicated config crate.
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: String,
    pub use_tcp: bool,
    pub tcp_host: String,
    pub tcp_port: u16,

    pub log_level: String,
    pub log_dir: Option<String>,
    pub debug: bool,

    pub scan_interval: Duration,
    pub cache_ttl: Duration,
    pub connect_timeout: Duration,
    pub retry_count: u32,
    pub retry_interval: Duration,

    pub scan_adapter: String,
    pub connect_adapter: String,

    pub watchdog_interval: Duration,
    pub watchdog_failure_threshold: u32,

    pub request_max_age: Duration,
    pub skip_old_requests: bool,

    pub scan_lookup_workers: usize,
    pub deadlock_threshold: Duration,
    pub exclusion_handshake_timeout: Duration,
    pub adapter_reset_wait: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            socket_path: env_string("BLE_ORCHESTRATOR_SOCKET", "/tmp/ble-orchestrator.sock"),
            use_tcp: env_flag("BLE_ORCHESTRATOR_TCP"),
            tcp_host: env_string("BLE_ORCHESTRATOR_HOST", "127.0.0.1"),
            tcp_port: env_parsed("BLE_ORCHESTRATOR_PORT", 8378u16),

            log_level: env_string("BLE_ORCHESTRATOR_LOG_LEVEL", "info"),
            log_dir: std::env::var("BLE_ORCHESTRATOR_LOG_DIR").ok(),
            debug: env_flag("BLE_ORCHESTRATOR_DEBUG"),

            scan_interval: env_secs("BLE_ORCHESTRATOR_SCAN_INTERVAL", 0.5),
            cache_ttl: env_secs("BLE_ORCHESTRATOR_CACHE_TTL", 300.0),
            connect_timeout: env_secs("BLE_ORCHESTRATOR_CONNECT_TIMEOUT", 10.0),
            retry_count: env_parsed("BLE_ORCHESTRATOR_RETRY_COUNT", 2u32),
            retry_interval: env_secs("BLE_ORCHESTRATOR_RETRY_INTERVAL", 1.0),

            scan_adapter: env_string("BLE_ORCHESTRATOR_SCAN_ADAPTER", "hci0"),
            connect_adapter: env_string("BLE_ORCHESTRATOR_CONNECT_ADAPTER", "hci1"),

            watchdog_interval: env_secs("BLE_ORCHESTRATOR_WATCHDOG_INTERVAL", 30.0),
            watchdog_failure_threshold: env_parsed("BLE_ORCHESTRATOR_WATCHDOG_THRESHOLD", 3u32),

            request_max_age: env_secs("BLE_ORCHESTRATOR_REQUEST_MAX_AGE", 30.0),
            skip_old_requests: std::env::var("BLE_ORCHESTRATOR_SKIP_OLD_REQUESTS")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(true),

            scan_lookup_workers: env_parsed("BLE_ORCHESTRATOR_SCAN_WORKERS", 3usize),
            deadlock_threshold: Duration::from_secs(90),
            exclusion_handshake_timeout: Duration::from_secs(10),
            adapter_reset_wait: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env()
    }
}
