use std::fmt::Display;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::billing::DEFAULT_MANAGED_NOTE;
use crate::hypervisor::proxmox::{ProxmoxConfig, StorageDefaults};
use crate::hypervisor::GuestKind;
use crate::ledger::{AllocationSpec, ClusterSettings};
use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read {key} from {path}: {source}")]
    SecretFile {
        key: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// key: app-config -> explicit settings handed to constructors
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_address: String,
    pub bind_port: u16,
    /// Keep serving when migrations fail.
    pub allow_migration_failure: bool,
    pub shared_secret: String,
    pub proxmox: ProxmoxConfig,
    pub default_spec: AllocationSpec,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub confirm_attempts: u32,
    pub confirm_interval: Duration,
    pub reconcile_threshold: Duration,
    pub max_in_flight: Duration,
    pub reconcile_interval: Duration,
    pub health_check_interval: Duration,
    pub usage_poll_interval: Duration,
    pub usage_poll_concurrency: usize,
    pub usage_max_age: Duration,
    pub billing_write_timeout: Duration,
    pub billing_flush_interval: Duration,
    pub managed_note: String,
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(key) {
            Some(value) => value.parse::<T>().map_err(|err| ConfigError::Invalid {
                key,
                reason: err.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn positive_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + Display + Copy,
        T::Err: Display,
    {
        let value = self.parse_or(key, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    fn secs_or(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.positive_or(key, default).map(Duration::from_secs)
    }

    fn millis_or(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.positive_or(key, default).map(Duration::from_millis)
    }

    fn flag(&self, key: &str) -> bool {
        self.optional(key)
            .map(|value| {
                let normalized = value.to_ascii_lowercase();
                matches!(normalized.as_str(), "1" | "true" | "yes")
            })
            .unwrap_or(false)
    }

    /// The `_FILE` variant wins when it names a readable, non-empty file.
    fn secret(
        &self,
        value_key: &'static str,
        file_key: &'static str,
    ) -> Result<Option<String>, ConfigError> {
        if let Some(path) = self.optional(file_key) {
            let contents = fs::read_to_string(&path).map_err(|source| ConfigError::SecretFile {
                key: file_key,
                path: path.clone(),
                source,
            })?;
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
        Ok(self.optional(value_key))
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let storage_defaults = StorageDefaults::default();
        let storage = StorageDefaults {
            bus: env.string_or("PVE_DEFAULT_STORAGE_BUS", &storage_defaults.bus),
            engine: env.string_or("PVE_DEFAULT_STORAGE_ENGINE", &storage_defaults.engine),
            format: env.string_or("PVE_DEFAULT_STORAGE_FORMAT", &storage_defaults.format),
            cloudinit: env.string_or("PVE_CLOUDINIT_STORAGE", &storage_defaults.cloudinit),
            network_bridge: env.string_or("PVE_NETWORK_BRIDGE", &storage_defaults.network_bridge),
            container_template: env.optional("PVE_CONTAINER_TEMPLATE"),
        };
        let proxmox = ProxmoxConfig {
            hostname: env.string_or("PVE_HOSTNAME", "pve.baonq.me"),
            username: env.string_or("PVE_USER", "root@pam"),
            password: env.secret("PVE_PASSWORD", "PVE_PASSWORD_FILE")?,
            node: env.string_or("PVE_NODE", "pve"),
            verify_tls: env.flag("PVE_VERIFY_TLS"),
            request_timeout: env.secs_or("PVE_REQUEST_TIMEOUT_SECS", 30)?,
            task_poll_interval: env.millis_or("PVE_TASK_POLL_INTERVAL_MS", 500)?,
            storage,
        };
        proxmox.api_base().map_err(|err| ConfigError::Invalid {
            key: "PVE_HOSTNAME",
            value: proxmox.hostname.clone(),
            reason: err.to_string(),
        })?;

        let default_spec = AllocationSpec {
            kind: env.parse_or("PVE_DEFAULT_GUEST_KIND", GuestKind::Qemu)?,
            cpus: env.positive_or("ALLOCATION_DEFAULT_CPUS", 1)?,
            memory_mib: env.positive_or("ALLOCATION_DEFAULT_MEMORY_MIB", 1024)?,
            storage_gib: env.positive_or("ALLOCATION_DEFAULT_STORAGE_GIB", 10)?,
        };
        default_spec
            .validate()
            .map_err(|reason| ConfigError::Invalid {
                key: "ALLOCATION_DEFAULT_MEMORY_MIB",
                value: default_spec.memory_mib.to_string(),
                reason,
            })?;

        let retry = RetryPolicy {
            max_attempts: env.positive_or("ORCHESTRATOR_RETRY_ATTEMPTS", 3)?,
            initial_delay: env.millis_or("ORCHESTRATOR_RETRY_INITIAL_MS", 250)?,
            max_delay: env.millis_or("ORCHESTRATOR_RETRY_MAX_MS", 10_000)?,
            ..RetryPolicy::default()
        };

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            database_max_connections: env.positive_or("DATABASE_MAX_CONNECTIONS", 5)?,
            bind_address: env.string_or("BIND_ADDRESS", "0.0.0.0"),
            bind_port: env.parse_or("BIND_PORT", 3000)?,
            allow_migration_failure: env.flag("ALLOW_MIGRATION_FAILURE"),
            shared_secret: env.required("BRIDGE_SHARED_SECRET")?,
            proxmox,
            default_spec,
            call_timeout: env.secs_or("ORCHESTRATOR_CALL_TIMEOUT_SECS", 30)?,
            retry,
            confirm_attempts: env.positive_or("ORCHESTRATOR_CONFIRM_ATTEMPTS", 10)?,
            confirm_interval: env.millis_or("ORCHESTRATOR_CONFIRM_INTERVAL_MS", 2_000)?,
            reconcile_threshold: env.secs_or("RECONCILE_THRESHOLD_SECS", 300)?,
            max_in_flight: env.secs_or("RECONCILE_MAX_IN_FLIGHT_SECS", 3_600)?,
            reconcile_interval: env.secs_or("RECONCILE_INTERVAL_SECS", 60)?,
            health_check_interval: env.secs_or("PVE_HEALTH_CHECK_INTERVAL_SECS", 60)?,
            usage_poll_interval: env.secs_or("USAGE_POLL_INTERVAL_SECS", 300)?,
            usage_poll_concurrency: env.positive_or("USAGE_POLL_CONCURRENCY", 4)?,
            usage_max_age: env.secs_or("USAGE_MAX_AGE_SECS", 900)?,
            billing_write_timeout: env.secs_or("BILLING_WRITE_TIMEOUT_SECS", 10)?,
            billing_flush_interval: env.secs_or("BILLING_FLUSH_INTERVAL_SECS", 30)?,
            managed_note: env.string_or("BILLING_MANAGED_NOTE", DEFAULT_MANAGED_NOTE),
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.bind_address, self.bind_port);
        raw.parse().map_err(|err: std::net::AddrParseError| ConfigError::Invalid {
            key: "BIND_ADDRESS",
            value: raw,
            reason: err.to_string(),
        })
    }

    /// Row stored for the configured cluster at startup.
    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            hostname: self.proxmox.hostname.clone(),
            username: self.proxmox.username.clone(),
            password: self.proxmox.password.clone(),
            notes: None,
        }
    }

    pub fn orchestrator_config(&self, cluster_id: i32) -> OrchestratorConfig {
        OrchestratorConfig {
            cluster_id,
            default_spec: self.default_spec,
            call_timeout: self.call_timeout,
            retry: self.retry.clone(),
            confirm_attempts: self.confirm_attempts,
            confirm_interval: self.confirm_interval,
            reconcile_threshold: to_chrono(self.reconcile_threshold),
            max_in_flight: to_chrono(self.max_in_flight),
        }
    }

    pub fn usage_max_age(&self) -> chrono::Duration {
        to_chrono(self.usage_max_age)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX)
}
