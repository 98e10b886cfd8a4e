//! Resource mapping tables
//!
//! Translates an abstract [`ResourceTier`] into the backend-specific
//! capacity descriptor: an EC2 machine type, an LXD (cpu, memory) pair, or
//! an OpenStack flavor ID. Built once from a JSON payload at startup and
//! immutable afterwards; the table is the only owner of the mapping.
//!
//! Build-time validation is fail-fast: a single unknown tier name rejects
//! the whole payload. Absence of a table is legal for backends that carry
//! an authoritative default descriptor; a lookup miss then falls back to
//! that default and never fails on its own.

use crate::error::ConfigError;
use crate::resource::ResourceTier;
use serde::Deserialize;
use std::collections::HashMap;

/// Immutable tier → descriptor table, generic over the descriptor shape.
#[derive(Debug, Clone, Default)]
pub struct ResourceMap<D> {
    entries: HashMap<ResourceTier, D>,
}

impl<D> ResourceMap<D> {
    /// Table with no entries; every lookup misses.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Build from validated (tier-name, descriptor) pairs. The first
    /// unrecognized tier name fails the whole build.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, D)>,
    {
        let mut entries = HashMap::new();
        for (name, descriptor) in pairs {
            let tier = ResourceTier::parse(&name)?;
            entries.insert(tier, descriptor);
        }
        Ok(Self { entries })
    }

    pub fn lookup(&self, tier: ResourceTier) -> Option<&D> {
        self.entries.get(&tier)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// LXD capacity shape: CPU core count plus an LXD memory string ("4GB").
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LxdCapacity {
    pub cpu: u32,
    pub memory: String,
}

/// Entry shape of the LXD mapping document, a list of
/// `{"resource_type_name": "nano", "cpu": 2, "memory": "4GB"}` objects.
#[derive(Debug, Deserialize)]
struct LxdMappingEntry {
    resource_type_name: String,
    cpu: u32,
    memory: String,
}

/// Parse the flat-object mapping form used by the EC2 and Nova backends:
/// `{"nano": "c5a.large", "micro": "c5a.xlarge"}` (value = machine type or
/// flavor ID).
pub fn parse_flat_mapping(field: &str, json: &str) -> Result<ResourceMap<String>, ConfigError> {
    let raw: HashMap<String, String> =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError {
            field: field.to_string(),
            reason: e.to_string(),
        })?;
    ResourceMap::from_pairs(raw)
}

/// Parse the list mapping form used by the LXD backend.
pub fn parse_lxd_mapping(field: &str, json: &str) -> Result<ResourceMap<LxdCapacity>, ConfigError> {
    let raw: Vec<LxdMappingEntry> =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError {
            field: field.to_string(),
            reason: e.to_string(),
        })?;
    ResourceMap::from_pairs(raw.into_iter().map(|e| {
        (
            e.resource_type_name,
            LxdCapacity {
                cpu: e.cpu,
                memory: e.memory,
            },
        )
    }))
}
