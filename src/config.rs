use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::medium::Namespace;
use crate::orchestration::{CapabilityPolicy, ProviderPolicy};
use crate::{hlog_debug, Error, Result};

/// Top-level configuration, stored as `~/.handoff/handoff.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the shared medium. Defaults to `~/.handoff/medium`.
    pub medium_root: Option<String>,
    /// Use filesystem notifications to wake waiters early.
    #[serde(default = "default_watch")]
    pub watch: bool,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub lock: LockSettings,
    /// capability -> ordered providers (primary first).
    #[serde(default = "default_policy")]
    pub policy: BTreeMap<String, CapabilityPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub poll_interval_ms: u64,
    pub io_retries: u32,
    pub io_backoff_ms: u64,
    pub io_backoff_max_ms: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            io_retries: 3,
            io_backoff_ms: 100,
            io_backoff_max_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub resource_id: String,
    pub lease_ttl_ms: u64,
    pub acquire_timeout_ms: u64,
    /// How long a queue ticket survives without a heartbeat.
    pub ticket_ttl_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            resource_id: "accelerator".to_string(),
            lease_ttl_ms: 120_000,
            acquire_timeout_ms: 60_000,
            ticket_ttl_ms: 5_000,
        }
    }
}

fn default_watch() -> bool {
    true
}

fn provider(name: &str, deadline_ms: u64, requires_accelerator: bool) -> ProviderPolicy {
    ProviderPolicy {
        name: name.to_string(),
        deadline_ms,
        requires_accelerator,
    }
}

fn default_policy() -> BTreeMap<String, CapabilityPolicy> {
    let mut policy = BTreeMap::new();
    policy.insert(
        "synthesis".to_string(),
        CapabilityPolicy {
            providers: vec![
                provider("qwen3", 5_000, true),
                provider("vibevoice", 30_000, true),
            ],
        },
    );
    policy.insert(
        "transcription".to_string(),
        CapabilityPolicy {
            providers: vec![
                provider("whisper-local", 60_000, true),
                provider("whisper-cloud", 120_000, false),
            ],
        },
    );
    policy.insert(
        "translation".to_string(),
        CapabilityPolicy {
            providers: vec![
                provider("opus-mt", 10_000, true),
                provider("cloud-llm", 30_000, false),
            ],
        },
    );
    policy.insert(
        "lipsync".to_string(),
        CapabilityPolicy {
            providers: vec![provider("wav2lip", 300_000, true)],
        },
    );
    policy
}

impl Default for Config {
    fn default() -> Self {
        Self {
            medium_root: None,
            watch: default_watch(),
            coordinator: CoordinatorSettings::default(),
            lock: LockSettings::default(),
            policy: default_policy(),
        }
    }
}

impl Config {
    pub fn handoff_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".handoff"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::handoff_dir()?.join("handoff.toml"))
    }

    pub fn medium_dir(&self) -> Result<PathBuf> {
        match &self.medium_root {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::handoff_dir()?.join("medium")),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lock.lease_ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.acquire_timeout_ms)
    }

    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_millis(self.lock.ticket_ttl_ms)
    }

    /// Check the invariants the coordinator relies on.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.poll_interval_ms == 0 {
            return Err(Error::Validation(
                "coordinator.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.lock.lease_ttl_ms < self.coordinator.poll_interval_ms {
            return Err(Error::Validation(format!(
                "lock.lease_ttl_ms ({}) is shorter than the poll interval ({})",
                self.lock.lease_ttl_ms, self.coordinator.poll_interval_ms
            )));
        }
        if self.lock.resource_id.is_empty() {
            return Err(Error::Validation("lock.resource_id is empty".to_string()));
        }
        for (capability, policy) in &self.policy {
            if policy.providers.is_empty() {
                return Err(Error::Validation(format!(
                    "policy.{} has no providers",
                    capability
                )));
            }
            if policy.providers.len() > 2 {
                return Err(Error::Validation(format!(
                    "policy.{} lists {} providers; only a primary and a secondary are allowed",
                    capability,
                    policy.providers.len()
                )));
            }
            if let Some(p) = policy.providers.iter().find(|p| p.deadline_ms == 0) {
                return Err(Error::Validation(format!(
                    "policy.{} provider {} has a zero deadline",
                    capability, p.name
                )));
            }
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        hlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            hlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        hlog_debug!(
            "Config loaded: medium_root={:?}, capabilities={}",
            config.medium_root,
            config.policy.len()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::handoff_dir()?;
        if !dir.exists() {
            hlog_debug!("Creating handoff directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        hlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Create the medium root and every namespace directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        let root = self.medium_dir()?;
        for ns in Namespace::ALL {
            let dir = root.join(ns.as_str());
            if !dir.exists() {
                hlog_debug!("Creating namespace directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
