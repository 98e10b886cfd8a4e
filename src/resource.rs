//! Resource tier enumeration
//!
//! A `ResourceTier` is the abstract CI-runner size class shared by every
//! backend. The orchestrator supplies it as a string; parsing is strict and
//! an unrecognized name is an error at the point it arrives (configuration
//! load for mapping tables, invalid-argument for requests). No backend ever
//! invents a tier.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Abstract runner size class, independent of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTier {
    Nano,
    Micro,
    Small,
    Medium,
    Large,
    XLarge,
    #[serde(rename = "2xlarge")]
    XLarge2,
    #[serde(rename = "3xlarge")]
    XLarge3,
    #[serde(rename = "4xlarge")]
    XLarge4,
}

impl ResourceTier {
    /// All known tiers, in size order.
    pub const ALL: [ResourceTier; 9] = [
        ResourceTier::Nano,
        ResourceTier::Micro,
        ResourceTier::Small,
        ResourceTier::Medium,
        ResourceTier::Large,
        ResourceTier::XLarge,
        ResourceTier::XLarge2,
        ResourceTier::XLarge3,
        ResourceTier::XLarge4,
    ];

    /// Parse a tier name. Unknown names are a configuration error, not a
    /// runtime one: the only free-form sources of tier names are mapping
    /// tables loaded at startup.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "nano" => Ok(ResourceTier::Nano),
            "micro" => Ok(ResourceTier::Micro),
            "small" => Ok(ResourceTier::Small),
            "medium" => Ok(ResourceTier::Medium),
            "large" => Ok(ResourceTier::Large),
            "xlarge" => Ok(ResourceTier::XLarge),
            "2xlarge" => Ok(ResourceTier::XLarge2),
            "3xlarge" => Ok(ResourceTier::XLarge3),
            "4xlarge" => Ok(ResourceTier::XLarge4),
            _ => Err(ConfigError::UnknownResourceType(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceTier::Nano => "nano",
            ResourceTier::Micro => "micro",
            ResourceTier::Small => "small",
            ResourceTier::Medium => "medium",
            ResourceTier::Large => "large",
            ResourceTier::XLarge => "xlarge",
            ResourceTier::XLarge2 => "2xlarge",
            ResourceTier::XLarge3 => "3xlarge",
            ResourceTier::XLarge4 => "4xlarge",
        }
    }
}

impl std::fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
