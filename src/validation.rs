//! Input validation utilities
//!
//! Validates caller-supplied identifiers before any substrate call is
//! issued. Runner names are UUID-shaped: the orchestrator derives them from
//! its own job UUIDs, and the LXD/OpenStack backends reuse the name as the
//! instance identifier for later lookup.

use crate::error::{Result, ShoesError};
use uuid::Uuid;

/// Validate a runner name (UUID-shaped unique identifier).
pub fn validate_runner_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ShoesError::invalid_argument(
            "runner_name",
            "runner name cannot be empty",
        ));
    }
    if Uuid::parse_str(name).is_err() {
        return Err(ShoesError::invalid_argument(
            "runner_name",
            format!("runner name must be a UUID, got: {}", name),
        ));
    }
    Ok(())
}

/// Validate an EC2 instance ID.
///
/// Instance IDs start with "i-" followed by hexadecimal characters.
pub fn validate_ec2_instance_id(instance_id: &str) -> Result<()> {
    if !instance_id.starts_with("i-") {
        return Err(ShoesError::invalid_argument(
            "cloud_id",
            format!("instance ID must start with 'i-', got: {}", instance_id),
        ));
    }
    if instance_id.len() < 10 || instance_id.len() > 19 {
        return Err(ShoesError::invalid_argument(
            "cloud_id",
            format!(
                "instance ID must be 10-19 characters, got: {} (len: {})",
                instance_id,
                instance_id.len()
            ),
        ));
    }
    let id_part = &instance_id[2..];
    if !id_part.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ShoesError::invalid_argument(
            "cloud_id",
            format!(
                "instance ID must contain only alphanumeric characters after 'i-', got: {}",
                instance_id
            ),
        ));
    }
    Ok(())
}

/// Validate a backend-issued UUID identifier (LXD instance names and
/// OpenStack server IDs are both UUID-shaped).
pub fn validate_uuid_id(field: &str, id: &str) -> Result<()> {
    if Uuid::parse_str(id).is_err() {
        return Err(ShoesError::invalid_argument(
            field,
            format!("must be a UUID, got: {}", id),
        ));
    }
    Ok(())
}
