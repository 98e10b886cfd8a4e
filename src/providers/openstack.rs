//! OpenStack Nova backend
//!
//! A single endpoint: one Keystone-scoped token and the compute service URL
//! discovered from the service catalog, both obtained once at startup and
//! held for the process lifetime. Servers boot at creation, so there is no
//! explicit start step; creation blocks until Nova reports ACTIVE. Deletion
//! is a single call followed by a wait until the server is gone, which can
//! take minutes while Nova tears down ports and volumes.

use crate::config::OpenStackConfig;
use crate::error::{Result, ShoesError};
use crate::provider::{AddInstanceRequest, InstanceDetail, ShoesProvider};
use crate::resource::ResourceTier;
use crate::validation::{validate_runner_name, validate_uuid_id};
use crate::wait::WaitPolicy;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

const SHOES_TYPE: &str = "openstack";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: String,
    url: String,
}

/// Pick the public compute endpoint from the service catalog, restricted to
/// `region` when one is configured. Multi-region clouds list one compute
/// entry per region; without the filter an arbitrary region's Nova wins.
fn resolve_compute_url(catalog: &[CatalogEntry], region: Option<&str>) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == "compute")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| {
            endpoint.interface == "public" && region.map_or(true, |r| endpoint.region == r)
        })
        .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default, rename = "accessIPv4")]
    access_ipv4: String,
}

/// Nova-backed shoes provider.
pub struct OpenStackShoes {
    client: reqwest::Client,
    compute_url: String,
    token: String,
    config: OpenStackConfig,
    boot_wait: WaitPolicy,
    teardown_wait: WaitPolicy,
}

impl OpenStackShoes {
    /// Authenticate against Keystone and resolve the compute endpoint from
    /// the service catalog. Runs once at startup; the token is held for the
    /// process lifetime and never rotated.
    pub async fn new(config: OpenStackConfig) -> Result<Self> {
        let client = reqwest::Client::new();
        let auth_body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": config.username,
                            "domain": {"name": config.user_domain_name},
                            "password": config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": config.project_name,
                        "domain": {"name": config.user_domain_name},
                    }
                }
            }
        });

        let auth_url = format!("{}/auth/tokens", config.auth_url.trim_end_matches('/'));
        let response = client
            .post(&auth_url)
            .json(&auth_body)
            .send()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "authenticate", None, e))?;
        if !response.status().is_success() {
            return Err(ShoesError::substrate(
                SHOES_TYPE,
                "authenticate",
                None,
                format!("keystone returned {}", response.status()),
            ));
        }
        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ShoesError::substrate(
                    SHOES_TYPE,
                    "authenticate",
                    None,
                    "keystone response has no subject token",
                )
            })?
            .to_string();
        let envelope: TokenEnvelope = response
            .json()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "authenticate", None, e))?;

        let compute_url =
            resolve_compute_url(&envelope.token.catalog, config.region_name.as_deref())
                .ok_or_else(|| {
                    ShoesError::substrate(
                        SHOES_TYPE,
                        "authenticate",
                        None,
                        match &config.region_name {
                            Some(region) => format!(
                                "service catalog has no public compute endpoint in region {}",
                                region
                            ),
                            None => "service catalog has no public compute endpoint".to_string(),
                        },
                    )
                })?;

        Ok(Self::with_endpoint(client, compute_url, token, config))
    }

    /// Assemble with an already-resolved endpoint and token (tests point
    /// this at a fake Nova).
    pub fn with_endpoint(
        client: reqwest::Client,
        compute_url: String,
        token: String,
        config: OpenStackConfig,
    ) -> Self {
        Self {
            client,
            compute_url: compute_url.trim_end_matches('/').to_string(),
            token,
            config,
            boot_wait: WaitPolicy::for_boot(),
            teardown_wait: WaitPolicy::for_teardown(),
        }
    }

    fn flavor_for(&self, tier: ResourceTier) -> &str {
        // Miss falls back to the backend-wide default flavor
        self.config
            .mapping
            .lookup(tier)
            .map(String::as_str)
            .unwrap_or(&self.config.flavor_id)
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<Server>> {
        let response = self
            .client
            .get(format!("{}/servers/{}", self.compute_url, server_id))
            .header(AUTH_TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "get server", Some(server_id), e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ShoesError::substrate(
                SHOES_TYPE,
                "get server",
                Some(server_id),
                format!("nova returned {}", response.status()),
            ));
        }
        let envelope: ServerEnvelope = response
            .json()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "get server", Some(server_id), e))?;
        Ok(Some(envelope.server))
    }
}

#[async_trait]
impl ShoesProvider for OpenStackShoes {
    fn shoes_type(&self) -> &'static str {
        SHOES_TYPE
    }

    async fn add_instance(&self, req: AddInstanceRequest) -> Result<InstanceDetail> {
        validate_runner_name(&req.runner_name)?;

        let user_data = base64::engine::general_purpose::STANDARD.encode(&req.setup_script);
        let body = json!({
            "server": {
                "name": req.runner_name,
                "flavorRef": self.flavor_for(req.resource_type),
                "imageRef": self.config.image_id,
                "networks": [{"uuid": self.config.network_id}],
                "user_data": user_data,
            }
        });

        let response = self
            .client
            .post(format!("{}/servers", self.compute_url))
            .header(AUTH_TOKEN_HEADER, &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "create server", None, e))?;
        if !response.status().is_success() {
            return Err(ShoesError::substrate(
                SHOES_TYPE,
                "create server",
                None,
                format!("nova returned {}", response.status()),
            ));
        }
        let envelope: ServerEnvelope = response
            .json()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "create server", None, e))?;
        let server_id = envelope.server.id;
        info!("created server {} for runner {}", server_id, req.runner_name);

        // Block until the server is ACTIVE; Nova builds asynchronously
        let server = self
            .boot_wait
            .poll_until(SHOES_TYPE, "server active", || async {
                let server = self.get_server(&server_id).await?.ok_or_else(|| {
                    ShoesError::substrate(
                        SHOES_TYPE,
                        "server active",
                        Some(&server_id),
                        "server disappeared while building",
                    )
                })?;
                match server.status.as_str() {
                    "ACTIVE" => Ok(Some(server)),
                    "ERROR" => Err(ShoesError::substrate(
                        SHOES_TYPE,
                        "server active",
                        Some(&server_id),
                        "server entered ERROR state",
                    )),
                    _ => Ok(None),
                }
            })
            .await?;

        Ok(InstanceDetail {
            cloud_id: server.id,
            shoes_type: SHOES_TYPE.to_string(),
            ip_address: server.access_ipv4,
        })
    }

    async fn delete_instance(&self, cloud_id: &str) -> Result<()> {
        validate_uuid_id("cloud_id", cloud_id)?;

        let response = self
            .client
            .delete(format!("{}/servers/{}", self.compute_url, cloud_id))
            .header(AUTH_TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "delete server", Some(cloud_id), e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // Stale identifier: the caller's view of the instance is wrong
            return Err(ShoesError::invalid_argument(
                "cloud_id",
                format!("no server found with ID {}", cloud_id),
            ));
        }
        if !response.status().is_success() {
            return Err(ShoesError::substrate(
                SHOES_TYPE,
                "delete server",
                Some(cloud_id),
                format!("nova returned {}", response.status()),
            ));
        }

        // Teardown of ports and volumes is asynchronous; wait until the
        // server is gone
        self.teardown_wait
            .poll_until(SHOES_TYPE, "server deleted", || async {
                match self.get_server(cloud_id).await? {
                    None => Ok(Some(())),
                    Some(_) => Ok(None),
                }
            })
            .await?;

        info!("deleted server {}", cloud_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenStackConfig;
    use crate::mapping::{self, ResourceMap};

    fn test_config(mapping: ResourceMap<String>) -> OpenStackConfig {
        OpenStackConfig {
            auth_url: "http://keystone.example/v3".to_string(),
            username: "ci".to_string(),
            password: "secret".to_string(),
            project_name: "runners".to_string(),
            user_domain_name: "Default".to_string(),
            flavor_id: "flavor-default".to_string(),
            image_id: "image-1".to_string(),
            network_id: "net-1".to_string(),
            region_name: None,
            mapping,
        }
    }

    fn two_region_catalog() -> Vec<CatalogEntry> {
        vec![
            CatalogEntry {
                service_type: "identity".to_string(),
                endpoints: vec![CatalogEndpoint {
                    interface: "public".to_string(),
                    region: "RegionOne".to_string(),
                    url: "http://keystone.example/v3".to_string(),
                }],
            },
            CatalogEntry {
                service_type: "compute".to_string(),
                endpoints: vec![
                    CatalogEndpoint {
                        interface: "internal".to_string(),
                        region: "RegionOne".to_string(),
                        url: "http://nova-one.internal/v2.1".to_string(),
                    },
                    CatalogEndpoint {
                        interface: "public".to_string(),
                        region: "RegionOne".to_string(),
                        url: "http://nova-one.example/v2.1/".to_string(),
                    },
                    CatalogEndpoint {
                        interface: "public".to_string(),
                        region: "RegionTwo".to_string(),
                        url: "http://nova-two.example/v2.1".to_string(),
                    },
                ],
            },
        ]
    }

    #[test]
    fn test_compute_url_filters_by_region() {
        let catalog = two_region_catalog();
        assert_eq!(
            resolve_compute_url(&catalog, Some("RegionTwo")),
            Some("http://nova-two.example/v2.1".to_string())
        );
        assert_eq!(
            resolve_compute_url(&catalog, Some("RegionOne")),
            Some("http://nova-one.example/v2.1".to_string())
        );
        assert_eq!(resolve_compute_url(&catalog, Some("RegionThree")), None);
    }

    #[test]
    fn test_compute_url_without_region_takes_first_public() {
        let catalog = two_region_catalog();
        assert_eq!(
            resolve_compute_url(&catalog, None),
            Some("http://nova-one.example/v2.1".to_string())
        );
    }

    #[test]
    fn test_compute_url_requires_public_interface() {
        let catalog = vec![CatalogEntry {
            service_type: "compute".to_string(),
            endpoints: vec![CatalogEndpoint {
                interface: "internal".to_string(),
                region: "RegionOne".to_string(),
                url: "http://nova.internal/v2.1".to_string(),
            }],
        }];
        assert_eq!(resolve_compute_url(&catalog, None), None);
    }

    #[test]
    fn test_flavor_mapping_with_fallback() {
        let mapping = mapping::parse_flat_mapping(
            "OS_RESOURCE_TYPE_MAPPING",
            r#"{"nano": "flavor-nano"}"#,
        )
        .unwrap();
        let shoes = OpenStackShoes::with_endpoint(
            reqwest::Client::new(),
            "http://nova.example/v2.1".to_string(),
            "token".to_string(),
            test_config(mapping),
        );
        assert_eq!(shoes.flavor_for(ResourceTier::Nano), "flavor-nano");
        // Absent tiers use the backend-wide default, never fail
        assert_eq!(shoes.flavor_for(ResourceTier::Large), "flavor-default");
    }

    #[test]
    fn test_flavor_default_with_no_mapping() {
        let shoes = OpenStackShoes::with_endpoint(
            reqwest::Client::new(),
            "http://nova.example/v2.1".to_string(),
            "token".to_string(),
            test_config(ResourceMap::empty()),
        );
        assert_eq!(shoes.flavor_for(ResourceTier::Nano), "flavor-default");
    }
}
