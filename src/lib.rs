//! shoes-provider library
//!
//! Provisions and tears down ephemeral CI-runner instances behind a uniform
//! two-operation contract, with one backend per compute substrate: AWS EC2,
//! LXD hosts, and OpenStack Nova.

pub mod config;
pub mod error;
pub mod mapping;
pub mod plugin;
pub mod provider;
pub mod providers;
pub mod resource;
pub mod selector;
pub mod validation;
pub mod wait;

// Re-export commonly used types
pub use error::{ConfigError, Result, ShoesError};
pub use provider::{AddInstanceRequest, InstanceDetail, ShoesProvider};
pub use resource::ResourceTier;
