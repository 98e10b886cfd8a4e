//! LXD backend
//!
//! The only backend with a multi-endpoint set: one or many independent LXD
//! hosts, each reached over HTTPS with a client certificate. Creation picks
//! a host through the selector strategy; deletion scans the set for the
//! host already holding the instance.
//!
//! Idempotency: before creating, every host is queried for an instance
//! named after the runner. A hit reuses that host and skips creation, which
//! makes create safe to retry after a partial prior failure (the
//! orchestrator timed out but the instance actually exists). The check is
//! best-effort, not linearizable: a create and a delete racing on the same
//! runner name are not serialized.
//!
//! LXD executes create/start/stop/delete as background operations; each is
//! settled by polling the operation resource through [`WaitPolicy`].

use crate::config::{LxdConfig, LxdHostConfig};
use crate::error::{ConfigError, Result, ShoesError};
use crate::mapping::{LxdCapacity, ResourceMap};
use crate::provider::{AddInstanceRequest, InstanceDetail, ShoesProvider};
use crate::selector::{HostSelector, RandomSelector};
use crate::validation::{validate_runner_name, validate_uuid_id};
use crate::wait::WaitPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

const SHOES_TYPE: &str = "lxd";

/// Container hardening required for nested CI workloads: the runner payload
/// spawns its own containers and needs an unconfined apparmor profile and
/// open device cgroup.
const RAW_LXC_CONFIG: &str = "lxc.apparmor.profile = unconfined\n\
                              lxc.cgroup.devices.allow = a\n\
                              lxc.cap.drop=";

/// Wire wrapper every LXD endpoint returns.
#[derive(Debug, Deserialize)]
struct LxdEnvelope<T> {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    error: String,
    /// Operation resource path for async responses ("/1.0/operations/...").
    #[serde(default)]
    operation: String,
    metadata: Option<T>,
}

/// Background operation resource. `status_code` 103 = running,
/// 200 = success, 400 = failure.
#[derive(Debug, Deserialize)]
struct LxdOperation {
    status_code: Option<i64>,
    #[serde(default)]
    err: String,
}

#[derive(Debug, Deserialize)]
struct LxdInstance {
    name: String,
}

/// Image source for new instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, String>>,
}

/// Parse the configured image alias into an instance source.
///
/// Accepts three forms: empty (the ubuntu/bionic default image), a remote
/// pull URL `https://<server>:8443/<alias>`, or a plain local alias.
pub fn parse_alias(input: &str) -> Result<InstanceSource> {
    if input.is_empty() {
        let mut properties = HashMap::new();
        properties.insert("os".to_string(), "ubuntu".to_string());
        properties.insert("release".to_string(), "bionic".to_string());
        return Ok(InstanceSource {
            kind: "image".to_string(),
            mode: None,
            server: None,
            alias: None,
            properties: Some(properties),
        });
    }

    if input.starts_with("http") {
        let url = reqwest::Url::parse(input).map_err(|e| {
            ShoesError::Config(ConfigError::InvalidValue {
                field: crate::config::ENV_LXD_IMAGE_ALIAS.to_string(),
                reason: format!("failed to parse alias URL: {}", e),
            })
        })?;
        let host = url.host_str().ok_or_else(|| {
            ShoesError::Config(ConfigError::InvalidValue {
                field: crate::config::ENV_LXD_IMAGE_ALIAS.to_string(),
                reason: "alias URL has no host".to_string(),
            })
        })?;
        let server = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };
        let alias = url.path().trim_start_matches('/').to_string();
        return Ok(InstanceSource {
            kind: "image".to_string(),
            mode: Some("pull".to_string()),
            server: Some(server),
            alias: Some(alias),
            properties: None,
        });
    }

    Ok(InstanceSource {
        kind: "image".to_string(),
        mode: None,
        server: None,
        alias: Some(input.to_string()),
        properties: None,
    })
}

#[derive(Debug, Serialize)]
struct InstancesPost<'a> {
    name: &'a str,
    source: &'a InstanceSource,
    config: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct InstanceStatePut<'a> {
    action: &'a str,
    timeout: i64,
}

/// One LXD endpoint: an authenticated connection handle plus its API base
/// URL. Safe to share across concurrent request tasks.
pub struct LxdHost {
    client: reqwest::Client,
    base_url: String,
}

impl LxdHost {
    /// Connect with the client certificate from configuration. LXD serves
    /// a self-signed certificate, so verification is skipped the way the
    /// trust model for certificate-paired hosts expects.
    pub fn connect(config: &LxdHostConfig) -> Result<Self> {
        let pem = format!("{}{}", config.client_cert, config.client_key);
        let identity = reqwest::Identity::from_pem(pem.as_bytes()).map_err(|e| {
            ShoesError::Config(ConfigError::InvalidValue {
                field: config.host.clone(),
                reason: format!("failed to load client certificate: {}", e),
            })
        })?;
        let client = reqwest::Client::builder()
            .identity(identity)
            .danger_accept_invalid_certs(true)
            .user_agent("shoes-provider")
            .build()
            .map_err(|e| {
                ShoesError::Config(ConfigError::InvalidValue {
                    field: config.host.clone(),
                    reason: format!("failed to build HTTP client: {}", e),
                })
            })?;
        Ok(Self::with_client(client, &config.host))
    }

    /// Wrap a pre-built HTTP client (tests point this at a fake endpoint).
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Look up an instance by name. `None` means the host does not hold it.
    async fn get_instance(&self, name: &str) -> Result<Option<LxdInstance>> {
        let response = self
            .client
            .get(self.url(&format!("/1.0/instances/{}", name)))
            .send()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "get instance", Some(name), e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope: LxdEnvelope<LxdInstance> = response
            .json()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "get instance", Some(name), e))?;
        if envelope.kind == "error" {
            return Ok(None);
        }
        Ok(envelope.metadata)
    }

    /// Settle a background operation by polling its resource until it
    /// leaves the running state. Returns the operation's error message on
    /// failure so callers can tolerate specific conditions.
    async fn wait_operation(
        &self,
        step: &'static str,
        operation_path: &str,
        policy: WaitPolicy,
    ) -> std::result::Result<(), ShoesError> {
        let outcome: std::result::Result<(), String> = policy
            .poll_until(SHOES_TYPE, step, || async {
                let envelope: LxdEnvelope<LxdOperation> = self
                    .client
                    .get(self.url(operation_path))
                    .send()
                    .await
                    .map_err(|e| ShoesError::substrate(SHOES_TYPE, step, None, e))?
                    .json()
                    .await
                    .map_err(|e| ShoesError::substrate(SHOES_TYPE, step, None, e))?;
                let op = envelope.metadata.ok_or_else(|| {
                    ShoesError::substrate(SHOES_TYPE, step, None, "operation has no metadata")
                })?;
                // An operation without a status code will never settle;
                // fail instead of polling to the deadline
                let code = op.status_code.ok_or_else(|| {
                    ShoesError::substrate(SHOES_TYPE, step, None, "operation has no status code")
                })?;
                if code < 200 {
                    return Ok(None); // still running
                }
                if code == 200 {
                    Ok(Some(Ok(())))
                } else {
                    Ok(Some(Err(op.err)))
                }
            })
            .await?;
        outcome.map_err(|message| OperationFailed { message }.into())
    }

    /// Issue a request that yields a background operation and wait for it.
    async fn run_async_request(
        &self,
        step: &'static str,
        request: reqwest::RequestBuilder,
        policy: WaitPolicy,
    ) -> std::result::Result<(), ShoesError> {
        let envelope: LxdEnvelope<serde_json::Value> = request
            .send()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, step, None, e))?
            .json()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, step, None, e))?;
        if envelope.kind == "error" {
            return Err(ShoesError::substrate(SHOES_TYPE, step, None, envelope.error));
        }
        if envelope.operation.is_empty() {
            return Ok(());
        }
        self.wait_operation(step, &envelope.operation, policy).await
    }
}

/// Failure message reported by an LXD background operation, preserved so
/// callers can recognize tolerable conditions ("already running").
#[derive(Debug)]
struct OperationFailed {
    message: String,
}

impl From<OperationFailed> for ShoesError {
    fn from(failed: OperationFailed) -> Self {
        ShoesError::substrate(SHOES_TYPE, "operation", None, failed.message)
    }
}

/// LXD-backed shoes provider over one or many hosts.
pub struct LxdShoes {
    hosts: Vec<LxdHost>,
    image_source: InstanceSource,
    mapping: ResourceMap<LxdCapacity>,
    selector: Box<dyn HostSelector>,
}

impl LxdShoes {
    pub fn new(config: LxdConfig) -> Result<Self> {
        let hosts = config
            .hosts
            .iter()
            .map(LxdHost::connect)
            .collect::<Result<Vec<_>>>()?;
        let image_source = parse_alias(&config.image_alias)?;
        Ok(Self::from_hosts(
            hosts,
            image_source,
            config.mapping,
            Box::new(RandomSelector),
        ))
    }

    /// Assemble from pre-built hosts with an explicit selection strategy.
    pub fn from_hosts(
        hosts: Vec<LxdHost>,
        image_source: InstanceSource,
        mapping: ResourceMap<LxdCapacity>,
        selector: Box<dyn HostSelector>,
    ) -> Self {
        assert!(!hosts.is_empty(), "endpoint set validated at config load");
        Self {
            hosts,
            image_source,
            mapping,
            selector,
        }
    }

    /// Pick the host for a new instance. Called once per create, never for
    /// delete.
    fn schedule_host(&self) -> &LxdHost {
        &self.hosts[self.selector.pick(self.hosts.len())]
    }

    /// Search every host for an instance with this name. A host that
    /// cannot answer does not hold the instance for our purposes; the scan
    /// skips it so a degraded endpoint set keeps serving.
    async fn find_host(&self, instance_name: &str) -> Option<&LxdHost> {
        for host in &self.hosts {
            match self.lookup_on(host, instance_name).await {
                Ok(Some(_)) => return Some(host),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "skipping {} while scanning for {}: {}",
                        host.base_url(),
                        instance_name,
                        e
                    );
                }
            }
        }
        None
    }

    async fn lookup_on(&self, host: &LxdHost, name: &str) -> Result<Option<String>> {
        Ok(host.get_instance(name).await?.map(|i| i.name))
    }

    fn instance_config(&self, req: &AddInstanceRequest) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("security.nesting".to_string(), "true".to_string());
        config.insert("security.privileged".to_string(), "true".to_string());
        config.insert("raw.lxc".to_string(), RAW_LXC_CONFIG.to_string());
        config.insert("user.user-data".to_string(), req.setup_script.clone());
        if let Some(capacity) = self.mapping.lookup(req.resource_type) {
            config.insert("limits.cpu".to_string(), capacity.cpu.to_string());
            config.insert("limits.memory".to_string(), capacity.memory.clone());
        }
        config
    }
}

#[async_trait]
impl ShoesProvider for LxdShoes {
    fn shoes_type(&self) -> &'static str {
        SHOES_TYPE
    }

    async fn add_instance(&self, req: AddInstanceRequest) -> Result<InstanceDetail> {
        validate_runner_name(&req.runner_name)?;
        let instance_name = req.runner_name.as_str();

        let host = match self.find_host(instance_name).await {
            Some(host) => {
                info!(
                    "instance {} already exists on {}, reusing",
                    instance_name,
                    host.base_url()
                );
                host
            }
            None => {
                let host = self.schedule_host();
                let config = self.instance_config(&req);
                let body = InstancesPost {
                    name: instance_name,
                    source: &self.image_source,
                    config: &config,
                };
                host.run_async_request(
                    "create instance",
                    host.client.post(host.url("/1.0/instances")).json(&body),
                    WaitPolicy::for_boot(),
                )
                .await
                .map_err(|e| attach_instance(e, instance_name))?;
                info!("created instance {} on {}", instance_name, host.base_url());
                host
            }
        };

        // The reuse path can race with a host that already started the
        // instance; "already running" is success, not an error.
        let state = InstanceStatePut {
            action: "start",
            timeout: -1,
        };
        if let Err(e) = host
            .run_async_request(
                "start instance",
                host.client
                    .put(host.url(&format!("/1.0/instances/{}/state", instance_name)))
                    .json(&state),
                WaitPolicy::for_boot(),
            )
            .await
        {
            if is_already_running(&e) {
                warn!("instance {} already running", instance_name);
            } else {
                return Err(attach_instance(e, instance_name));
            }
        }

        // The live identifier is the name itself: LXD instances are
        // name-addressed, which is what makes the lookup above possible.
        Ok(InstanceDetail {
            cloud_id: instance_name.to_string(),
            shoes_type: SHOES_TYPE.to_string(),
            // LXD does not expose an address synchronously at start
            ip_address: String::new(),
        })
    }

    async fn delete_instance(&self, cloud_id: &str) -> Result<()> {
        validate_uuid_id("cloud_id", cloud_id)?;

        let host = self.find_host(cloud_id).await.ok_or_else(|| {
            ShoesError::invalid_argument(
                "cloud_id",
                format!("no configured host holds instance {}", cloud_id),
            )
        })?;

        let state = InstanceStatePut {
            action: "stop",
            timeout: -1,
        };
        host.run_async_request(
            "stop instance",
            host.client
                .put(host.url(&format!("/1.0/instances/{}/state", cloud_id)))
                .json(&state),
            WaitPolicy::for_teardown(),
        )
        .await
        .map_err(|e| attach_instance(e, cloud_id))?;

        host.run_async_request(
            "delete instance",
            host.client
                .delete(host.url(&format!("/1.0/instances/{}", cloud_id))),
            WaitPolicy::for_teardown(),
        )
        .await
        .map_err(|e| attach_instance(e, cloud_id))?;

        info!("deleted instance {} from {}", cloud_id, host.base_url());
        Ok(())
    }
}

fn is_already_running(err: &ShoesError) -> bool {
    matches!(err, ShoesError::Substrate { message, .. }
        if message.eq_ignore_ascii_case("The instance is already running"))
}

fn attach_instance(err: ShoesError, instance: &str) -> ShoesError {
    match err {
        ShoesError::Substrate {
            backend,
            step,
            message,
            source,
            ..
        } => ShoesError::Substrate {
            backend,
            step,
            instance: Some(instance.to_string()),
            message,
            source,
        },
        other => other,
    }
}
