//! Typed accessors over KDL nodes.
//!
//! A block's settings are child nodes with a single positional argument,
//! e.g. `max-retries 12` inside `renewal { ... }`.

use anyhow::{anyhow, Result};
use std::time::Duration;

/// First positional string argument of a node
pub fn get_first_arg_string(node: &kdl::KdlNode) -> Option<String> {
    positional(node)
        .next()
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// All positional string arguments of a node
pub fn get_string_args(node: &kdl::KdlNode) -> Vec<String> {
    positional(node)
        .filter_map(|v| v.as_string())
        .map(|s| s.to_string())
        .collect()
}

/// String value of child node `name`
pub fn get_string_entry(node: &kdl::KdlNode, name: &str) -> Option<String> {
    child(node, name).and_then(get_first_arg_string)
}

/// All string values of child node `name`
pub fn get_string_list_entry(node: &kdl::KdlNode, name: &str) -> Vec<String> {
    child(node, name).map(get_string_args).unwrap_or_default()
}

/// Integer value of child node `name`
pub fn get_int_entry(node: &kdl::KdlNode, name: &str) -> Option<i128> {
    child(node, name)
        .and_then(|n| positional(n).next())
        .and_then(|v| v.as_integer())
}

/// Boolean value of child node `name`
pub fn get_bool_entry(node: &kdl::KdlNode, name: &str) -> Option<bool> {
    child(node, name)
        .and_then(|n| positional(n).next())
        .and_then(|v| v.as_bool())
}

/// Non-negative integer seconds of child node `name`
pub fn get_secs_entry(node: &kdl::KdlNode, name: &str) -> Result<Option<Duration>> {
    get_u64_entry(node, name).map(|v| v.map(Duration::from_secs))
}

/// Non-negative integer milliseconds of child node `name`
pub fn get_millis_entry(node: &kdl::KdlNode, name: &str) -> Result<Option<Duration>> {
    get_u64_entry(node, name).map(|v| v.map(Duration::from_millis))
}

/// Non-negative integer value of child node `name`
pub fn get_u64_entry(node: &kdl::KdlNode, name: &str) -> Result<Option<u64>> {
    match get_int_entry(node, name) {
        Some(v) => u64::try_from(v).map(Some).map_err(|_| {
            anyhow!(
                "'{}' in block '{}' must be a non-negative integer, got {}",
                name,
                node.name().value(),
                v
            )
        }),
        None => Ok(None),
    }
}

fn child<'a>(node: &'a kdl::KdlNode, name: &str) -> Option<&'a kdl::KdlNode> {
    node.children().and_then(|doc| doc.get(name))
}

fn positional(node: &kdl::KdlNode) -> impl Iterator<Item = &kdl::KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}
