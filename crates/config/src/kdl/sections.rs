//! Per-block KDL parsing.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use tracing::trace;

use crate::renewal::RenewalConfig;
use crate::{AlertsConfig, CertificateSettings, HostListenerConfig, IssuerConfig, ProxyConfig};

use super::helpers::{
    get_bool_entry, get_millis_entry, get_secs_entry, get_string_entry, get_string_list_entry,
    get_u64_entry,
};

/// Parse the `certificate` block
pub fn parse_certificate(node: &kdl::KdlNode) -> Result<CertificateSettings> {
    trace!("Parsing certificate block");

    let defaults = CertificateSettings::default();
    let settings = CertificateSettings {
        enabled: get_bool_entry(node, "enabled").unwrap_or(defaults.enabled),
        identifier: get_string_entry(node, "identifier")
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        email: get_string_entry(node, "email").unwrap_or_default(),
        base_path: get_string_entry(node, "base-path")
            .map(PathBuf::from)
            .unwrap_or(defaults.base_path),
    };

    trace!(
        enabled = settings.enabled,
        identifier = %settings.identifier,
        base_path = %settings.base_path.display(),
        "Parsed certificate block"
    );

    Ok(settings)
}

/// Parse the `renewal` block
pub fn parse_renewal(node: &kdl::KdlNode) -> Result<RenewalConfig> {
    trace!("Parsing renewal block");

    let defaults = RenewalConfig::default();
    let max_retries = match get_u64_entry(node, "max-retries")? {
        Some(v) => u32::try_from(v).map_err(|_| anyhow!("'max-retries' is out of range: {}", v))?,
        None => defaults.max_retries,
    };

    let config = RenewalConfig {
        check_interval: get_secs_entry(node, "check-interval-secs")?
            .unwrap_or(defaults.check_interval),
        renew_threshold: get_secs_entry(node, "renew-threshold-secs")?
            .unwrap_or(defaults.renew_threshold),
        max_retries,
        retry_interval: get_secs_entry(node, "retry-interval-secs")?
            .unwrap_or(defaults.retry_interval),
        max_backoff: get_secs_entry(node, "max-backoff-secs")?.unwrap_or(defaults.max_backoff),
        startup_delay: get_secs_entry(node, "startup-delay-secs")?
            .unwrap_or(defaults.startup_delay),
        issue_timeout: get_secs_entry(node, "issue-timeout-secs")?
            .unwrap_or(defaults.issue_timeout),
    };

    trace!(
        check_interval_secs = config.check_interval.as_secs(),
        renew_threshold_secs = config.renew_threshold.as_secs(),
        max_retries = config.max_retries,
        retry_interval_secs = config.retry_interval.as_secs(),
        "Parsed renewal block"
    );

    Ok(config)
}

/// Parse the `issuer` block
pub fn parse_issuer(node: &kdl::KdlNode) -> Result<IssuerConfig> {
    trace!("Parsing issuer block");

    let command = get_string_list_entry(node, "command");
    if node.children().and_then(|c| c.get("command")).is_some() && command.is_empty() {
        return Err(anyhow!(
            "Issuer 'command' requires a program, e.g., command \"/usr/local/bin/issue-cert\""
        ));
    }

    Ok(IssuerConfig { command })
}

/// Parse the `proxy` block
pub fn parse_proxy(node: &kdl::KdlNode) -> Result<ProxyConfig> {
    trace!("Parsing proxy block");

    let defaults = ProxyConfig::default();
    let config = ProxyConfig {
        pid_file: get_string_entry(node, "pid-file").map(PathBuf::from),
        reload_url: get_string_entry(node, "reload-url"),
        restart_command: get_string_list_entry(node, "restart-command"),
        verify_delay: get_millis_entry(node, "verify-delay-ms")?.unwrap_or(defaults.verify_delay),
    };

    trace!(
        pid_file = ?config.pid_file,
        has_reload_url = config.reload_url.is_some(),
        "Parsed proxy block"
    );

    Ok(config)
}

/// Parse the `alerts` block
pub fn parse_alerts(node: &kdl::KdlNode) -> Result<AlertsConfig> {
    trace!("Parsing alerts block");

    Ok(AlertsConfig {
        webhook: get_string_entry(node, "webhook"),
    })
}

/// Parse the `host-listener` block
pub fn parse_host_listener(node: &kdl::KdlNode) -> Result<HostListenerConfig> {
    trace!("Parsing host-listener block");

    let defaults = HostListenerConfig::default();
    let privileged_port = match get_u64_entry(node, "privileged-port")? {
        Some(v) => u16::try_from(v)
            .map_err(|_| anyhow!("'privileged-port' must be a valid port number, got {}", v))?,
        None => defaults.privileged_port,
    };

    let config = HostListenerConfig {
        privileged_port,
        listening: get_bool_entry(node, "listening").unwrap_or(defaults.listening),
        pause_command: get_string_list_entry(node, "pause-command"),
        resume_command: get_string_list_entry(node, "resume-command"),
    };

    trace!(
        port = config.privileged_port,
        listening = config.listening,
        "Parsed host-listener block"
    );

    Ok(config)
}
