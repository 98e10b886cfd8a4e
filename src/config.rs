//! Backend configuration
//!
//! Every backend reads a flat set of named environment values exactly once
//! at startup and snapshots them into an immutable config struct passed
//! into the backend constructor. Nothing reads the ambient environment
//! mid-request. Missing required values and malformed JSON fail startup
//! before any RPC surface is reachable.
//!
//! The pure `from_values` constructors carry the parsing and validation so
//! tests never have to touch the process environment.

use crate::error::ConfigError;
use crate::mapping::{self, LxdCapacity, ResourceMap};
use serde::Deserialize;

// Environment key values
pub const ENV_AWS_IMAGE_ID: &str = "AWS_IMAGE_ID";
pub const ENV_AWS_RESOURCE_TYPE_MAPPING: &str = "AWS_RESOURCE_TYPE_MAPPING";

pub const ENV_LXD_HOST: &str = "LXD_HOST";
pub const ENV_LXD_CLIENT_CERT: &str = "LXD_CLIENT_CERT";
pub const ENV_LXD_CLIENT_KEY: &str = "LXD_CLIENT_KEY";
pub const ENV_LXD_HOSTS: &str = "LXD_HOSTS";
pub const ENV_LXD_IMAGE_ALIAS: &str = "LXD_IMAGE_ALIAS";
pub const ENV_LXD_RESOURCE_TYPE_MAPPING: &str = "LXD_RESOURCE_TYPE_MAPPING";

pub const ENV_OS_AUTH_URL: &str = "OS_AUTH_URL";
pub const ENV_OS_USERNAME: &str = "OS_USERNAME";
pub const ENV_OS_PASSWORD: &str = "OS_PASSWORD";
pub const ENV_OS_PROJECT_NAME: &str = "OS_PROJECT_NAME";
pub const ENV_OS_USER_DOMAIN_NAME: &str = "OS_USER_DOMAIN_NAME";
pub const ENV_OS_FLAVOR_ID: &str = "OS_FLAVOR_ID";
pub const ENV_OS_IMAGE_ID: &str = "OS_IMAGE_ID";
pub const ENV_OS_NETWORK_ID: &str = "OS_NETWORK_ID";
pub const ENV_OS_REGION_NAME: &str = "OS_REGION_NAME";
pub const ENV_OS_RESOURCE_TYPE_MAPPING: &str = "OS_RESOURCE_TYPE_MAPPING";

/// us-west-2 focal 20.04 LTS amd64 hvm:ebs-ssd
pub const DEFAULT_AWS_IMAGE_ID: &str = "ami-02868af3c3df4b3aa";

/// Read an environment value, treating empty strings as unset (the
/// orchestrator exports every known key, set or not).
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_required(key: &str) -> Result<String, ConfigError> {
    env_opt(key).ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

/// EC2 backend configuration.
#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub image_id: String,
    /// tier → EC2 machine type. Required: EC2 has no sensible
    /// backend-wide machine-type default.
    pub mapping: ResourceMap<String>,
}

impl AwsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_values(
            env_opt(ENV_AWS_IMAGE_ID),
            env_opt(ENV_AWS_RESOURCE_TYPE_MAPPING),
        )
    }

    pub fn from_values(
        image_id: Option<String>,
        mapping_json: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mapping_json = mapping_json
            .ok_or_else(|| ConfigError::MissingEnv(ENV_AWS_RESOURCE_TYPE_MAPPING.to_string()))?;
        Ok(Self {
            image_id: image_id.unwrap_or_else(|| DEFAULT_AWS_IMAGE_ID.to_string()),
            mapping: mapping::parse_flat_mapping(ENV_AWS_RESOURCE_TYPE_MAPPING, &mapping_json)?,
        })
    }
}

/// One LXD host: API address plus client-certificate material (PEM
/// contents, already read from disk).
#[derive(Debug, Clone)]
pub struct LxdHostConfig {
    pub host: String,
    pub client_cert: String,
    pub client_key: String,
}

impl LxdHostConfig {
    /// Build a host entry, reading certificate and key PEM from the given
    /// paths.
    pub fn load(host: &str, cert_path: &str, key_path: &str) -> Result<Self, ConfigError> {
        let read = |path: &str| {
            std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
                field: path.to_string(),
                reason: format!("failed to read: {}", e),
            })
        };
        Ok(Self {
            host: host.to_string(),
            client_cert: read(cert_path)?,
            client_key: read(key_path)?,
        })
    }
}

/// Entry shape of the `LXD_HOSTS` JSON document.
#[derive(Debug, Deserialize)]
struct LxdHostEntry {
    host: String,
    client_cert: String,
    client_key: String,
}

/// LXD backend configuration. The only backend that may hold more than one
/// endpoint.
#[derive(Debug, Clone)]
pub struct LxdConfig {
    pub hosts: Vec<LxdHostConfig>,
    /// Image alias input; empty means the built-in ubuntu default. Parsed
    /// by the backend (`providers::lxd::parse_alias`).
    pub image_alias: String,
    pub mapping: ResourceMap<LxdCapacity>,
}

impl LxdConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let hosts = match env_opt(ENV_LXD_HOSTS) {
            Some(json) => Self::hosts_from_json(&json)?,
            None => vec![Self::single_host_from_env()?],
        };
        if hosts.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: ENV_LXD_HOSTS.to_string(),
                reason: "must configure at least one LXD host".to_string(),
            });
        }

        let mapping = match env_opt(ENV_LXD_RESOURCE_TYPE_MAPPING) {
            Some(json) => mapping::parse_lxd_mapping(ENV_LXD_RESOURCE_TYPE_MAPPING, &json)?,
            None => ResourceMap::empty(),
        };

        Ok(Self {
            hosts,
            image_alias: env_opt(ENV_LXD_IMAGE_ALIAS).unwrap_or_default(),
            mapping,
        })
    }

    fn single_host_from_env() -> Result<LxdHostConfig, ConfigError> {
        let unset: Vec<&str> = [ENV_LXD_HOST, ENV_LXD_CLIENT_CERT, ENV_LXD_CLIENT_KEY]
            .into_iter()
            .filter(|key| env_opt(key).is_none())
            .collect();
        if !unset.is_empty() {
            return Err(ConfigError::MissingEnv(unset.join(", ")));
        }

        LxdHostConfig::load(
            &env_required(ENV_LXD_HOST)?,
            &env_required(ENV_LXD_CLIENT_CERT)?,
            &env_required(ENV_LXD_CLIENT_KEY)?,
        )
    }

    /// Parse the multi-host JSON list: `[{host, client_cert, client_key}]`
    /// with cert/key as file paths.
    pub fn hosts_from_json(json: &str) -> Result<Vec<LxdHostConfig>, ConfigError> {
        let entries: Vec<LxdHostEntry> =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError {
                field: ENV_LXD_HOSTS.to_string(),
                reason: e.to_string(),
            })?;
        entries
            .iter()
            .map(|e| LxdHostConfig::load(&e.host, &e.client_cert, &e.client_key))
            .collect()
    }
}

/// OpenStack Nova backend configuration.
#[derive(Debug, Clone)]
pub struct OpenStackConfig {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain_name: String,
    /// Authoritative default flavor; used when the mapping misses.
    pub flavor_id: String,
    pub image_id: String,
    pub network_id: String,
    /// Restricts compute-endpoint resolution to one catalog region.
    /// Unset means the first public compute endpoint wins.
    pub region_name: Option<String>,
    /// Optional tier → flavor ID overrides.
    pub mapping: ResourceMap<String>,
}

impl OpenStackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let required = [
            ENV_OS_AUTH_URL,
            ENV_OS_USERNAME,
            ENV_OS_PASSWORD,
            ENV_OS_PROJECT_NAME,
            ENV_OS_USER_DOMAIN_NAME,
            ENV_OS_FLAVOR_ID,
            ENV_OS_IMAGE_ID,
            ENV_OS_NETWORK_ID,
        ];
        let unset: Vec<&str> = required
            .into_iter()
            .filter(|key| env_opt(key).is_none())
            .collect();
        if !unset.is_empty() {
            return Err(ConfigError::MissingEnv(unset.join(", ")));
        }

        let mapping = match env_opt(ENV_OS_RESOURCE_TYPE_MAPPING) {
            Some(json) => mapping::parse_flat_mapping(ENV_OS_RESOURCE_TYPE_MAPPING, &json)?,
            None => ResourceMap::empty(),
        };

        Ok(Self {
            auth_url: env_required(ENV_OS_AUTH_URL)?,
            username: env_required(ENV_OS_USERNAME)?,
            password: env_required(ENV_OS_PASSWORD)?,
            project_name: env_required(ENV_OS_PROJECT_NAME)?,
            user_domain_name: env_required(ENV_OS_USER_DOMAIN_NAME)?,
            flavor_id: env_required(ENV_OS_FLAVOR_ID)?,
            image_id: env_required(ENV_OS_IMAGE_ID)?,
            network_id: env_required(ENV_OS_NETWORK_ID)?,
            region_name: env_opt(ENV_OS_REGION_NAME),
            mapping,
        })
    }
}
