use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "configs/worker.toml";

/// Full worker configuration, layered from a default file, an optional
/// explicit path, and `FOREMAN__`-prefixed environment variables (later
/// sources win).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub metadata: MetadataSettings,
    pub observability: ObservabilitySettings,
    pub concurrency: ConcurrencySettings,
    pub time_limits: TimeLimitSettings,
    pub rate_limiting: RateLimitingSettings,
    pub broker: BrokerSettings,
    pub routing: RoutingSettings,
    pub beat: BeatSettings,
    pub state: StateSettings,
    pub serialization: SerializationSettings,
    pub results: ResultSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            metadata: MetadataSettings::default(),
            observability: ObservabilitySettings::default(),
            concurrency: ConcurrencySettings::default(),
            time_limits: TimeLimitSettings::default(),
            rate_limiting: RateLimitingSettings::default(),
            broker: BrokerSettings::default(),
            routing: RoutingSettings::default(),
            beat: BeatSettings::default(),
            state: StateSettings::default(),
            serialization: SerializationSettings::default(),
            results: ResultSettings::default(),
        }
    }
}

impl WorkerConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_ref())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix("FOREMAN").separator("__"));

        let config = builder.build()?;
        config.try_deserialize().context("invalid worker configuration")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    pub worker_name: String,
    pub hostname: String,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            worker_name: "foreman@%h".to_string(),
            hostname: gethostname(),
        }
    }
}

fn gethostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
    pub metrics_port: u16,
    pub enable_metrics: bool,
    pub send_events: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            enable_metrics: true,
            send_events: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    pub worker_concurrency: usize,
    pub prefetch_multiplier: usize,
    pub acks_late: bool,
    pub max_tasks_per_child: Option<u64>,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            worker_concurrency: num_cpus::get(),
            prefetch_multiplier: 4,
            acks_late: false,
            max_tasks_per_child: None,
        }
    }
}

impl ConcurrencySettings {
    pub fn prefetch(&self) -> usize {
        self.worker_concurrency * self.prefetch_multiplier
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLimitSettings {
    pub task_time_limit_secs: Option<u64>,
    pub task_soft_time_limit_secs: Option<u64>,
    pub eta_scheduler_precision_secs: f64,
}

impl Default for TimeLimitSettings {
    fn default() -> Self {
        Self {
            task_time_limit_secs: None,
            task_soft_time_limit_secs: None,
            eta_scheduler_precision_secs: 1.0,
        }
    }
}

impl TimeLimitSettings {
    pub fn hard_limit(&self) -> Option<Duration> {
        self.task_time_limit_secs.map(Duration::from_secs)
    }

    pub fn soft_limit(&self) -> Option<Duration> {
        self.task_soft_time_limit_secs.map(Duration::from_secs)
    }

    pub fn eta_scheduler_precision(&self) -> Duration {
        Duration::from_secs_f64(self.eta_scheduler_precision_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingSettings {
    pub disable_rate_limits: bool,
    pub default_rate_limit_per_sec: Option<f64>,
}

impl Default for RateLimitingSettings {
    fn default() -> Self {
        Self {
            disable_rate_limits: false,
            default_rate_limit_per_sec: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub url: String,
    pub connection_timeout_secs: u64,
    pub retry_on_startup: bool,
    pub max_retries: Option<u32>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            connection_timeout_secs: 10,
            retry_on_startup: true,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub default_queue: String,
    pub default_exchange: String,
    pub default_exchange_type: String,
    pub default_routing_key: String,
    pub default_delivery_mode: u8,
    pub create_missing_queues: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            default_exchange: "default".to_string(),
            default_exchange_type: "direct".to_string(),
            default_routing_key: "default".to_string(),
            default_delivery_mode: 2,
            create_missing_queues: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatSettings {
    pub enabled: bool,
    pub max_loop_interval_secs: u64,
    pub schedule_filename: String,
}

impl Default for BeatSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_loop_interval_secs: 300,
            schedule_filename: "celerybeat-schedule.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    pub state_db: String,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            state_db: "foreman-state.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializationSettings {
    pub task_serializer: String,
}

impl Default for SerializationSettings {
    fn default() -> Self {
        Self {
            task_serializer: "json".to_string(),
        }
    }
}

impl SerializationSettings {
    pub fn serializer(&self) -> foreman_registry::Serializer {
        match self.task_serializer.as_str() {
            "yaml" => foreman_registry::Serializer::Yaml,
            "msgpack" => foreman_registry::Serializer::Msgpack,
            "pickle" => foreman_registry::Serializer::Pickle,
            _ => foreman_registry::Serializer::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultSettings {
    pub result_backend: Option<String>,
    pub ignore_result: bool,
    pub store_errors_even_if_ignored: bool,
    pub track_started: bool,
    pub task_result_expires_secs: u64,
}

impl Default for ResultSettings {
    fn default() -> Self {
        Self {
            result_backend: None,
            ignore_result: false,
            store_errors_even_if_ignored: false,
            track_started: false,
            task_result_expires_secs: 86400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_give_a_usable_worker_config() {
        let config = WorkerConfig::default();
        assert!(config.concurrency.worker_concurrency >= 1);
        assert_eq!(config.concurrency.prefetch(), config.concurrency.worker_concurrency * 4);
    }

    #[test]
    fn serializer_falls_back_to_json_for_unknown_names() {
        let settings = SerializationSettings { task_serializer: "protobuf".to_string() };
        assert!(matches!(settings.serializer(), foreman_registry::Serializer::Json));
    }
}
