//! Provider-agnostic facade for instance lifecycle operations
//!
//! Every backend (AWS EC2, LXD, OpenStack Nova) implements the same
//! two-operation contract against an unrelated vendor API. The plugin
//! server depends only on this trait, never on a concrete backend, so the
//! host can treat every backend interchangeably and new substrates slot in
//! without touching the transport.

use crate::error::Result;
use crate::resource::ResourceTier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A creation request from the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddInstanceRequest {
    /// UUID-shaped unique identifier for the runner; used as the instance
    /// name where the backend supports name-addressed lookup.
    pub runner_name: String,
    /// Opaque boot payload (cloud-init user data / shell script) injected
    /// into the new instance.
    pub setup_script: String,
    /// Abstract size class, translated per backend via the mapping table.
    pub resource_type: ResourceTier,
}

/// Normalized result of a successful creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetail {
    /// Backend-native identifier the orchestrator must present on delete.
    pub cloud_id: String,
    /// Fixed literal identifying the serving backend ("aws", "lxd",
    /// "openstack").
    pub shoes_type: String,
    /// Reachable address, or empty when the substrate allocates none
    /// synchronously.
    pub ip_address: String,
}

/// The two-operation contract every backend implements.
///
/// Requests are independent and may run concurrently on separate tasks;
/// implementations hold only immutable state after construction and must be
/// safe to share across tasks.
#[async_trait]
pub trait ShoesProvider: Send + Sync {
    /// Backend tag returned in every creation response.
    fn shoes_type(&self) -> &'static str;

    /// Provision an instance and bring it to a running state.
    ///
    /// Blocks until the substrate's create (and start, where the substrate
    /// needs an explicit one) has settled. A failure partway through is
    /// terminal for this request; the operation is safe to retry as a
    /// whole.
    async fn add_instance(&self, req: AddInstanceRequest) -> Result<InstanceDetail>;

    /// Stop and remove the instance behind `cloud_id`, waiting for the
    /// substrate-side teardown to settle. May take minutes.
    async fn delete_instance(&self, cloud_id: &str) -> Result<()>;
}
