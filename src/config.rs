use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::tier::{Tier, TierTable};

/// Configuration for container-based local execution.
///
/// Every local invocation runs in a sandboxed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image used when a service does not name its own
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "2g")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "2.0")
    pub cpu_limit: Option<String>,
    /// Container runtime binary
    pub runtime: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "pixel-dispatch/runtime:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("2g".to_string()),
            cpu_limit: Some("2.0".to_string()),
            runtime: "docker".to_string(),
        }
    }
}

/// Static description of one transformation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceConfig {
    pub id: String,
    /// Reported as `modelUsed` in results.
    pub model: String,
    /// Local worker-pool size.
    pub concurrency: usize,
    pub remote_only: bool,
    /// Must keep working without a network.
    pub offline_required: bool,
    /// Only tiers permitting unrestricted content may use it.
    pub unrestricted_content: bool,
    pub image: Option<String>,
    pub estimated_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            concurrency: 1,
            remote_only: false,
            offline_required: false,
            unrestricted_content: false,
            image: None,
            estimated_ms: 3000,
        }
    }
}

impl ServiceConfig {
    pub fn new(id: impl Into<String>, model: impl Into<String>, concurrency: usize) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            concurrency,
            ..Default::default()
        }
    }

    pub fn remote_only(mut self) -> Self {
        self.remote_only = true;
        self
    }

    pub fn offline_required(mut self) -> Self {
        self.offline_required = true;
        self
    }

    pub fn unrestricted(mut self) -> Self {
        self.unrestricted_content = true;
        self
    }

    pub fn with_estimate(mut self, ms: u64) -> Self {
        self.estimated_ms = ms;
        self
    }

    /// Services with a local worker pool.
    pub fn is_local_capable(&self) -> bool {
        !self.remote_only
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGrant {
    pub key: String,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    pub acquire_timeout_ms: u64,
    /// Short wait used when Hybrid mode tries the local pool first.
    pub hybrid_acquire_timeout_ms: u64,
    /// Upper bound on a single worker invocation.
    pub operation_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5000,
            hybrid_acquire_timeout_ms: 250,
            operation_timeout_ms: 120_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn hybrid_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.hybrid_acquire_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectivityConfig {
    /// Probed with a GET; no URL means the monitor is not started.
    pub probe_url: Option<String>,
    pub probe_interval_ms: u64,
    /// Probe round trips at or above this are Slow.
    pub slow_threshold_ms: u64,
    /// A classification older than this degrades to Offline.
    pub stale_after_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_interval_ms: 5000,
            slow_threshold_ms: 800,
            stale_after_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Payloads larger than this stay on a warm local worker.
    pub local_payload_threshold_bytes: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            local_payload_threshold_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub endpoint: String,
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_remote_timeout_ms() -> u64 {
    60_000
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_ms: default_remote_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    pub services: Vec<ServiceConfig>,
    pub tiers: TierTable,
    pub keys: Vec<KeyGrant>,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub connectivity: ConnectivityConfig,
    pub routing: RoutingConfig,
    pub remote: Option<RemoteConfig>,
    pub sandbox: SandboxConfig,
    pub max_jobs: usize,
    /// Finished jobs older than this are purged by the server.
    pub job_retention_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            tiers: TierTable::default(),
            keys: Vec::new(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            connectivity: ConnectivityConfig::default(),
            routing: RoutingConfig::default(),
            remote: None,
            sandbox: SandboxConfig::default(),
            max_jobs: 10_000,
            job_retention_secs: 3600,
        }
    }
}

fn default_services() -> Vec<ServiceConfig> {
    vec![
        ServiceConfig::new("enhance", "real-esrgan-x4", 2).with_estimate(3000),
        ServiceConfig::new("bg_remover", "u2net", 2).with_estimate(2000),
        ServiceConfig::new("super_resolution", "swinir-large", 1).with_estimate(8000),
        ServiceConfig::new("denoiser", "nafnet", 2).with_estimate(2500),
        ServiceConfig::new("style_transfer", "adain-vgg19", 1).with_estimate(6000),
        ServiceConfig::new("face_swap", "inswapper-128", 1).with_estimate(7000),
        ServiceConfig::new("vip_magic_morph", "sdxl-morph", 1)
            .unrestricted()
            .with_estimate(15_000),
    ]
}

impl OrchestratorConfig {
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    /// An empty catalog, for building configurations from scratch.
    pub fn empty() -> Self {
        Self {
            services: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.services.retain(|s| s.id != service.id);
        self.services.push(service);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>, tier: Tier) -> Self {
        self.keys.push(KeyGrant {
            key: key.into(),
            tier,
        });
        self
    }

    pub fn with_remote(mut self, endpoint: impl Into<String>) -> Self {
        self.remote = Some(RemoteConfig::new(endpoint));
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), services = config.services.len(), "Loaded configuration");
        Ok(config)
    }

    /// Static key → tier map for the registry.
    pub fn key_map(&self) -> HashMap<String, Tier> {
        self.keys
            .iter()
            .map(|grant| (grant.key.clone(), grant.tier))
            .collect()
    }

    /// Reject contradictory or unusable configuration. Run once at startup.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if service.id.trim().is_empty() {
                return Err(config_error("service with an empty id"));
            }
            if !seen.insert(service.id.as_str()) {
                return Err(config_error(format!("duplicate service id {}", service.id)));
            }
            if service.remote_only && service.offline_required {
                return Err(config_error(format!(
                    "service {} is both remote-only and required offline",
                    service.id
                )));
            }
            if service.remote_only && self.remote.is_none() {
                return Err(config_error(format!(
                    "service {} is remote-only but no remote endpoint is configured",
                    service.id
                )));
            }
            if service.is_local_capable() && service.concurrency == 0 {
                return Err(config_error(format!(
                    "service {} has zero local concurrency",
                    service.id
                )));
            }
        }

        self.tiers.validate()?;

        let mut keys = HashSet::new();
        for grant in &self.keys {
            if grant.key.trim().is_empty() {
                return Err(config_error("empty access key"));
            }
            if !keys.insert(grant.key.as_str()) {
                return Err(config_error(format!("access key granted twice ({})", grant.tier)));
            }
        }

        if let Some(remote) = &self.remote {
            if remote.endpoint.trim().is_empty() {
                return Err(config_error("remote endpoint is empty"));
            }
        }
        if self.max_jobs == 0 {
            return Err(config_error("max_jobs must be positive"));
        }
        Ok(())
    }
}

fn config_error(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Config(msg.into())
}
