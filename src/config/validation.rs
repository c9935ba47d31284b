//! Configuration validation logic.

use std::net::SocketAddr;

use crate::config::BridgeConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Accepted bounds for the initial idle window.
pub const MIN_INITIAL_IDLE_SECS: u64 = 120;
pub const MAX_INITIAL_IDLE_SECS: u64 = 600;

/// Validate a BridgeConfig for semantic correctness.
pub fn validate_bridge_config(config: &BridgeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.http.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError(format!(
            "http.bind_address '{}' is not a socket address",
            config.http.bind_address
        )));
    }
    if config.control.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError(format!(
            "control.bind_address '{}' is not a socket address",
            config.control.bind_address
        )));
    }

    let initial = config.timeouts.initial_idle_secs;
    if !(MIN_INITIAL_IDLE_SECS..=MAX_INITIAL_IDLE_SECS).contains(&initial) {
        errors.push(ValidationError(format!(
            "timeouts.initial_idle_secs must be between {} and {}, got {}",
            MIN_INITIAL_IDLE_SECS, MAX_INITIAL_IDLE_SECS, initial
        )));
    }
    if config.timeouts.progress_idle_secs == 0 {
        errors.push(ValidationError(
            "timeouts.progress_idle_secs must be > 0".to_string(),
        ));
    }

    if config.control.max_frame_bytes == 0 {
        errors.push(ValidationError(
            "control.max_frame_bytes must be > 0".to_string(),
        ));
    }
    if config.limits.max_body_bytes == 0 {
        errors.push(ValidationError(
            "limits.max_body_bytes must be > 0".to_string(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_bridge_config(&BridgeConfig::default()).is_ok());
    }

    #[test]
    fn test_initial_idle_out_of_range() {
        let mut config = BridgeConfig::default();
        config.timeouts.initial_idle_secs = 30;

        let errs = validate_bridge_config(&config).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].0.contains("initial_idle_secs"));

        config.timeouts.initial_idle_secs = 601;
        assert!(validate_bridge_config(&config).is_err());

        config.timeouts.initial_idle_secs = 120;
        assert!(validate_bridge_config(&config).is_ok());
    }

    #[test]
    fn test_bad_bind_address() {
        let mut config = BridgeConfig::default();
        config.http.bind_address = "not-an-address".to_string();

        let errs = validate_bridge_config(&config).unwrap_err();
        assert!(errs[0].0.contains("http.bind_address"));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = BridgeConfig::default();
        config.control.max_frame_bytes = 0;
        config.limits.max_body_bytes = 0;

        let errs = validate_bridge_config(&config).unwrap_err();
        assert_eq!(errs.len(), 2);
    }
}
