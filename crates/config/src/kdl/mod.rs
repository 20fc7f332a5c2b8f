//! KDL configuration parsing.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use tracing::trace;

use crate::{Config, StateFile};

mod helpers;
mod sections;

pub use helpers::*;
pub use sections::*;

/// Parse a complete configuration document
pub fn parse_config(content: &str) -> Result<Config> {
    let doc: kdl::KdlDocument = content
        .parse()
        .map_err(|e: kdl::KdlError| anyhow!("Invalid KDL syntax: {:?}", miette::Report::new(e)))?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "certificate" => config.certificate = parse_certificate(node)?,
            "renewal" => config.renewal = parse_renewal(node)?,
            "state-file" => {
                let path = get_first_arg_string(node).ok_or_else(|| {
                    anyhow!("'state-file' requires a path, e.g., state-file \"/var/lib/certkeeper/state.json\"")
                })?;
                config.state_file = StateFile(PathBuf::from(path));
            }
            "issuer" => config.issuer = parse_issuer(node)?,
            "proxy" => config.proxy = parse_proxy(node)?,
            "alerts" => config.alerts = parse_alerts(node)?,
            "host-listener" => config.host_listener = parse_host_listener(node)?,
            other => {
                return Err(anyhow!(
                    "Unknown configuration block '{}'. Valid blocks: certificate, renewal, \
                     state-file, issuer, proxy, alerts, host-listener",
                    other
                ));
            }
        }
    }

    trace!(blocks = doc.nodes().len(), "Finished parsing configuration");
    Ok(config)
}
