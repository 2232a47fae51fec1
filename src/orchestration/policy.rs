//! Provider policy: which providers serve a capability, in which order, with
//! which deadline.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One provider entry as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPolicy {
    pub name: String,
    pub deadline_ms: u64,
    #[serde(default)]
    pub requires_accelerator: bool,
}

/// Ordered providers for one capability: primary first, optional secondary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    pub providers: Vec<ProviderPolicy>,
}

/// A provider resolved for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub name: String,
    pub capability: String,
    pub requires_accelerator: bool,
    /// How long a single attempt may wait for an answer.
    pub deadline: Duration,
}

impl Provider {
    pub fn new(name: &str, capability: &str, deadline: Duration) -> Self {
        Self {
            name: name.to_string(),
            capability: capability.to_string(),
            requires_accelerator: false,
            deadline,
        }
    }

    pub fn with_accelerator(mut self) -> Self {
        self.requires_accelerator = true;
        self
    }
}

/// Primary and optional secondary provider for a capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderChain {
    pub primary: Provider,
    pub secondary: Option<Provider>,
}

/// capability -> provider chain.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    chains: BTreeMap<String, ProviderChain>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[policy]` section of the config.
    pub fn from_config(policy: &BTreeMap<String, CapabilityPolicy>) -> Result<Self> {
        let mut table = Self::new();
        for (capability, entry) in policy {
            let mut providers = entry.providers.iter().map(|p| {
                let provider = Provider::new(&p.name, capability, Duration::from_millis(p.deadline_ms));
                if p.requires_accelerator {
                    provider.with_accelerator()
                } else {
                    provider
                }
            });
            let primary = providers
                .next()
                .ok_or_else(|| Error::Validation(format!("policy.{} has no providers", capability)))?;
            let secondary = providers.next();
            if providers.next().is_some() {
                return Err(Error::Validation(format!(
                    "policy.{} has more than two providers",
                    capability
                )));
            }
            table.insert(ProviderChain { primary, secondary });
        }
        Ok(table)
    }

    /// Register a chain under its primary's capability.
    pub fn insert(&mut self, chain: ProviderChain) {
        self.chains.insert(chain.primary.capability.clone(), chain);
    }

    pub fn resolve(&self, capability: &str) -> Result<&ProviderChain> {
        self.chains
            .get(capability)
            .ok_or_else(|| Error::PolicyNotFound(capability.to_string()))
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }
}
