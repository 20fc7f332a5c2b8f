//! Configuration linting
//!
//! Flags settings that parse and validate but are likely mistakes, and
//! combinations that cannot work at all.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

/// Warn about risky settings; error on combinations that cannot work
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if !config.certificate.enabled {
        return result;
    }

    if config.issuer.command.is_empty() {
        result.add_warning(ValidationWarning::new(
            "No issuer command configured; renewal attempts will fail until one is set",
        ));
    }

    if config.alerts.webhook.is_none() {
        result.add_warning(ValidationWarning::new(
            "No alert webhook configured; alerts will only be logged",
        ));
    }

    if config.proxy.pid_file.is_none() {
        result.add_warning(ValidationWarning::new(
            "No proxy pid-file configured; signal and restart reloads are unavailable",
        ));
    }

    if config.proxy.reload_url.is_none() {
        result.add_warning(ValidationWarning::new(
            "No proxy reload-url configured; there is no fallback when a signal reload fails",
        ));
    }

    if config.renewal.renew_threshold <= config.renewal.check_interval {
        result.add_warning(ValidationWarning::new(format!(
            "renew-threshold ({}s) is not longer than check-interval ({}s); \
             the certificate may expire between checks",
            config.renewal.renew_threshold.as_secs(),
            config.renewal.check_interval.as_secs()
        )));
    }

    if config.host_listener.listening && config.host_listener.pause_command.is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Configuration,
            format!(
                "Host listens on port {} but has no pause-command; the challenge port cannot be freed",
                config.host_listener.privileged_port
            ),
        ));
    }

    result
}
