//! AWS EC2 backend
//!
//! Creation is run → tag → start: `RunInstances` completes synchronously,
//! the `Name` tag attaches the runner name for later lookup (EC2's create
//! call does not accept one), and the explicit `StartInstances` is a no-op
//! kept for instances that boot slowly out of `pending`. Deletion is a
//! single `TerminateInstances` (EC2 folds stop and delete into one
//! operation) followed by a poll until the instance reports `terminated`,
//! which can take minutes while EBS and ENIs detach.

use crate::config::AwsConfig;
use crate::error::{Result, ShoesError};
use crate::provider::{AddInstanceRequest, InstanceDetail, ShoesProvider};
use crate::resource::ResourceTier;
use crate::validation::{validate_ec2_instance_id, validate_runner_name};
use crate::wait::WaitPolicy;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{InstanceStateName, InstanceType, Tag};
use aws_sdk_ec2::Client as Ec2Client;
use base64::Engine;
use tracing::{info, warn};

const SHOES_TYPE: &str = "aws";

/// EC2-backed shoes provider. Holds one client for one account/region;
/// the client is safe to share across concurrent request tasks.
pub struct AwsShoes {
    client: Ec2Client,
    config: AwsConfig,
    teardown_wait: WaitPolicy,
}

impl AwsShoes {
    pub async fn new(config: AwsConfig) -> Self {
        let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::with_client(Ec2Client::new(&sdk_config), config)
    }

    /// Construct with an explicit client (tests point this at localstack).
    pub fn with_client(client: Ec2Client, config: AwsConfig) -> Self {
        Self {
            client,
            config,
            teardown_wait: WaitPolicy::for_teardown(),
        }
    }

    fn machine_type(&self, tier: ResourceTier) -> Option<InstanceType> {
        self.config
            .mapping
            .lookup(tier)
            .map(|name| InstanceType::from(name.as_str()))
    }

    async fn create_runner_instance(
        &self,
        runner_name: &str,
        script: &str,
        tier: ResourceTier,
    ) -> Result<(String, String)> {
        // EC2 wants user data pre-encoded
        let user_data = base64::engine::general_purpose::STANDARD.encode(script);

        let result = self
            .client
            .run_instances()
            .min_count(1)
            .max_count(1)
            .image_id(&self.config.image_id)
            .set_instance_type(self.machine_type(tier))
            .user_data(user_data)
            .send()
            .await
            .map_err(|e| ShoesError::substrate(SHOES_TYPE, "create instance", None, e))?;

        let instance = result.instances().first().ok_or_else(|| {
            ShoesError::substrate(
                SHOES_TYPE,
                "create instance",
                None,
                "RunInstances returned no instances",
            )
        })?;
        let instance_id = instance
            .instance_id()
            .ok_or_else(|| {
                ShoesError::substrate(
                    SHOES_TYPE,
                    "create instance",
                    None,
                    "created instance has no ID",
                )
            })?
            .to_string();
        let ip = instance.public_ip_address().unwrap_or_default().to_string();
        info!("created instance {} for runner {}", instance_id, runner_name);

        // Tagging failure is terminal: the instance is left running but
        // unreachable by name, which the caller must clean up by ID.
        self.client
            .create_tags()
            .resources(&instance_id)
            .tags(Tag::builder().key("Name").value(runner_name).build())
            .send()
            .await
            .map_err(|e| {
                ShoesError::substrate(SHOES_TYPE, "attach tag", Some(&instance_id), e)
            })?;

        match self
            .client
            .start_instances()
            .instance_ids(&instance_id)
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) => {
                // Fresh instances are usually pending or already running,
                // which StartInstances reports as an incorrect state. That
                // is success for our purposes.
                let service_err = e.into_service_error();
                if service_err.meta().code() == Some("IncorrectInstanceState") {
                    warn!(
                        "instance {} not startable yet, treating as already starting",
                        instance_id
                    );
                } else {
                    return Err(ShoesError::substrate(
                        SHOES_TYPE,
                        "start instance",
                        Some(&instance_id),
                        service_err,
                    ));
                }
            }
        }

        Ok((instance_id, ip))
    }

    async fn delete_runner_instance(&self, instance_id: &str) -> Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| {
                ShoesError::substrate(SHOES_TYPE, "terminate instance", Some(instance_id), e)
            })?;

        self.teardown_wait
            .poll_until(SHOES_TYPE, "instance terminated", || async {
                match self
                    .client
                    .describe_instances()
                    .instance_ids(instance_id)
                    .send()
                    .await
                {
                    Ok(response) => {
                        let state = response
                            .reservations()
                            .iter()
                            .flat_map(|r| r.instances())
                            .find(|i| i.instance_id() == Some(instance_id))
                            .and_then(|i| i.state())
                            .and_then(|s| s.name().cloned());
                        match state {
                            Some(InstanceStateName::Terminated) | None => Ok(Some(())),
                            _ => Ok(None),
                        }
                    }
                    Err(e) => {
                        // A terminated instance eventually disappears from
                        // DescribeInstances entirely.
                        let service_err = e.into_service_error();
                        if service_err.meta().code() == Some("InvalidInstanceID.NotFound") {
                            Ok(Some(()))
                        } else {
                            Err(ShoesError::substrate(
                                SHOES_TYPE,
                                "describe instance",
                                Some(instance_id),
                                service_err,
                            ))
                        }
                    }
                }
            })
            .await?;

        info!("terminated instance {}", instance_id);
        Ok(())
    }
}

#[async_trait]
impl ShoesProvider for AwsShoes {
    fn shoes_type(&self) -> &'static str {
        SHOES_TYPE
    }

    async fn add_instance(&self, req: AddInstanceRequest) -> Result<InstanceDetail> {
        validate_runner_name(&req.runner_name)?;

        let (cloud_id, ip_address) = self
            .create_runner_instance(&req.runner_name, &req.setup_script, req.resource_type)
            .await?;

        Ok(InstanceDetail {
            cloud_id,
            shoes_type: SHOES_TYPE.to_string(),
            ip_address,
        })
    }

    async fn delete_instance(&self, cloud_id: &str) -> Result<()> {
        validate_ec2_instance_id(cloud_id)?;
        self.delete_runner_instance(cloud_id).await
    }
}
