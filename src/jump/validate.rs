//! Jump chain validation

use super::types::{HopConfig, ValidationResult};
use crate::ssh::{AuthMethod, SshConfig};

/// Chains longer than this get a warning
const MAX_RECOMMENDED_HOPS: usize = 3;

/// Per-hop latency limits below this are likely to reject healthy hops
const MIN_SENSIBLE_HOP_LATENCY_MS: u64 = 100;

/// Check every hop has what it needs to authenticate
pub fn validate_jump_chain(hops: &[HopConfig]) -> ValidationResult {
    let mut result = ValidationResult::default();

    for (i, hop) in hops.iter().enumerate() {
        let label = format!("hop {}", i + 1);
        check_endpoint(&label, &hop.ssh, &mut result.errors);

        if let Some(max) = hop.max_latency_ms {
            if max < MIN_SENSIBLE_HOP_LATENCY_MS {
                result.warnings.push(format!(
                    "{}: max_latency_ms {} is below {}ms and may reject healthy hops",
                    label, max, MIN_SENSIBLE_HOP_LATENCY_MS
                ));
            }
        }
    }

    if hops.len() > MAX_RECOMMENDED_HOPS {
        result.warnings.push(format!(
            "{} hops configured; chains longer than {} add noticeable latency",
            hops.len(),
            MAX_RECOMMENDED_HOPS
        ));
    }

    result.valid = result.errors.is_empty();
    result
}

/// Host, username and the credential matching the auth method
pub(crate) fn check_endpoint(label: &str, config: &SshConfig, errors: &mut Vec<String>) {
    if config.host.trim().is_empty() {
        errors.push(format!("{}: host is required", label));
    }
    if config.port == 0 {
        errors.push(format!("{}: port must be non-zero", label));
    }
    if config.username.trim().is_empty() {
        errors.push(format!("{}: username is required", label));
    }
    match &config.auth {
        AuthMethod::Password { password } if password.is_empty() => {
            errors.push(format!("{}: password auth requires a password", label));
        }
        AuthMethod::Key { key_path, .. } if key_path.trim().is_empty() => {
            errors.push(format!("{}: key auth requires a key_path", label));
        }
        _ => {}
    }
}
