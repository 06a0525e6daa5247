//! Configuration for the hatchery.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hatchery_id::HatcheryId;
use hatchery_networking::{parse_optional_addr, AddressPool};
use serde::{Deserialize, Serialize};

use crate::intake::IntakeConfig;
use crate::network::NetworkPlanner;
use crate::orchestrator::OrchestratorConfig;
use crate::provisioning::PoolConfig;
use crate::reaper::ReaperConfig;
use crate::spawn::SpawnConfig;

/// One provisioning pool: keep `count` ready instances of a model.
///
/// Exactly one of `model_path` (v1, `group/name`) and `model_v2` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_v2: Option<String>,
    pub count: u32,
}

impl PoolEntry {
    fn validate(&self) -> Result<()> {
        match (&self.model_path, &self.model_v2) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => bail!(
                "provisioning entry must set exactly one of model_path and model_v2: {:?}",
                self
            ),
        }
    }
}

/// A v2 model used for jobs that do not name a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultModelV2 {
    pub worker_model_v2: String,
    /// Binaries the model provides. Empty means it matches only jobs
    /// without binary requirements.
    #[serde(default)]
    pub binaries: Vec<String>,
}

/// Static network settings for cloned instances.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Comma-separated CIDR ranges; empty lets the provider assign addresses.
    pub ip_range: String,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
}

/// Hatchery configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name recorded in instance annotations and used when booking jobs.
    pub name: String,

    /// Job backend API URL.
    pub api_url: String,

    /// Bearer token for the job backend.
    pub api_token: Option<String>,

    /// Address of the health and status API.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Upper bound on concurrent spawns, also sizing the intake window.
    pub max_concurrent_provisioning: usize,

    pub poll_interval: Duration,
    pub worker_ttl: Duration,
    pub worker_registration_ttl: Duration,
    pub reaper_interval: Duration,
    pub provisioning_interval: Duration,

    /// Pending-claim expiry; `None` keeps claims until released.
    pub pending_claim_expiry: Option<Duration>,

    pub spawn_cache_ttl: Duration,
    pub provider_timeout: Duration,
    pub wait_ip_timeout: Duration,

    pub network: NetworkSettings,
    pub provisioning: Vec<PoolEntry>,
    pub default_models_v2: Vec<DefaultModelV2>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // Ownership annotations carry the name, so it must survive restarts.
        let name = match var("HATCHERY_NAME").or_else(|| var("HOSTNAME")) {
            Some(name) => name.trim().to_string(),
            None => bail!(
                "HATCHERY_NAME is not set and no HOSTNAME to fall back on; \
                 pick a stable name such as {}",
                HatcheryId::new()
            ),
        };

        let api_url =
            var("HATCHERY_API_URL").unwrap_or_else(|| "http://127.0.0.1:8081".to_string());
        let api_token = var("HATCHERY_API_TOKEN");

        let listen_addr = var("HATCHERY_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8086".to_string())
            .parse()
            .context("invalid HATCHERY_LISTEN_ADDR")?;

        let log_level = var("HATCHERY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let number = |key: &str, default: u64| -> Result<u64> {
            match var(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid {}: {}", key, raw)),
                None => Ok(default),
            }
        };

        let max_concurrent_provisioning =
            number("HATCHERY_MAX_CONCURRENT_PROVISIONING", 10)? as usize;
        if max_concurrent_provisioning == 0 {
            bail!("HATCHERY_MAX_CONCURRENT_PROVISIONING must be at least 1");
        }

        let minutes = |m: u64| Duration::from_secs(m * 60);
        // Intervals and timeouts of zero would spin or never succeed.
        let seconds = |key: &str, default: u64| -> Result<Duration> {
            Ok(Duration::from_secs(number(key, default)?.max(1)))
        };
        let poll_interval = seconds("HATCHERY_POLL_INTERVAL_SECS", 10)?;
        let worker_ttl = minutes(number("HATCHERY_WORKER_TTL_MINUTES", 10)?);
        let worker_registration_ttl =
            minutes(number("HATCHERY_WORKER_REGISTRATION_TTL_MINUTES", 10)?);
        let reaper_interval = seconds("HATCHERY_REAPER_INTERVAL_SECS", 60)?;
        let provisioning_interval = seconds("HATCHERY_PROVISIONING_INTERVAL_SECS", 60)?;
        let pending_claim_expiry = match number("HATCHERY_PENDING_CLAIM_EXPIRY_SECS", 600)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let spawn_cache_ttl = Duration::from_secs(number("HATCHERY_SPAWN_CACHE_TTL_SECS", 30)?);
        let provider_timeout = seconds("HATCHERY_PROVIDER_TIMEOUT_SECS", 60)?;
        let wait_ip_timeout = seconds("HATCHERY_WAIT_IP_TIMEOUT_SECS", 300)?;

        let network = NetworkSettings {
            ip_range: var("HATCHERY_IP_RANGE").unwrap_or_default(),
            netmask: parse_optional_addr(&var("HATCHERY_NETMASK").unwrap_or_default())
                .context("invalid HATCHERY_NETMASK")?
                .unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
            gateway: parse_optional_addr(&var("HATCHERY_GATEWAY").unwrap_or_default())
                .context("invalid HATCHERY_GATEWAY")?,
            dns: var("HATCHERY_DNS")
                .unwrap_or_default()
                .split(',')
                .filter_map(|s| parse_optional_addr(s).transpose())
                .collect::<Result<_, _>>()
                .context("invalid HATCHERY_DNS")?,
        };
        // Fail at startup rather than on the first clone.
        AddressPool::from_ranges(&network.ip_range).context("invalid HATCHERY_IP_RANGE")?;

        let provisioning: Vec<PoolEntry> = match var("HATCHERY_PROVISIONING") {
            Some(raw) => serde_json::from_str(&raw).context("invalid HATCHERY_PROVISIONING")?,
            None => Vec::new(),
        };
        for entry in &provisioning {
            entry.validate()?;
        }

        let default_models_v2 = match var("HATCHERY_DEFAULT_MODELS_V2") {
            Some(raw) => serde_json::from_str(&raw).context("invalid HATCHERY_DEFAULT_MODELS_V2")?,
            None => Vec::new(),
        };

        Ok(Self {
            name,
            api_url,
            api_token,
            listen_addr,
            log_level,
            max_concurrent_provisioning,
            poll_interval,
            worker_ttl,
            worker_registration_ttl,
            reaper_interval,
            provisioning_interval,
            pending_claim_expiry,
            spawn_cache_ttl,
            provider_timeout,
            wait_ip_timeout,
            network,
            provisioning,
            default_models_v2,
        })
    }

    pub fn intake(&self) -> IntakeConfig {
        IntakeConfig {
            poll_interval: self.poll_interval,
            capacity: self.max_concurrent_provisioning,
            ..IntakeConfig::default()
        }
    }

    pub fn spawn(&self) -> SpawnConfig {
        SpawnConfig {
            cache_ttl: self.spawn_cache_ttl,
            ..SpawnConfig::default()
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent: self.max_concurrent_provisioning,
            default_models_v2: self.default_models_v2.clone(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reaper_interval,
            worker_ttl: self.worker_ttl,
            registration_ttl: self.worker_registration_ttl,
            provider_timeout: self.provider_timeout,
            ..ReaperConfig::default()
        }
    }

    pub fn pools(&self) -> PoolConfig {
        PoolConfig {
            interval: self.provisioning_interval,
            pools: self.provisioning.clone(),
            wait_ip_timeout: self.wait_ip_timeout,
            provider_timeout: self.provider_timeout,
            ..PoolConfig::default()
        }
    }

    /// Address planner for the configured range.
    pub fn network_planner(&self) -> Result<NetworkPlanner> {
        let pool = AddressPool::from_ranges(&self.network.ip_range)
            .context("invalid HATCHERY_IP_RANGE")?;
        Ok(NetworkPlanner::new(
            pool,
            self.network.netmask,
            self.network.gateway,
            self.network.dns.clone(),
        ))
    }
}
