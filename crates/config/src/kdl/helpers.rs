//! Field accessors for KDL blocks.
//!
//! A field is a child node carrying a single positional argument, e.g.
//! `listen "0.0.0.0:5000"` inside `server { ... }`.

use ::kdl::{KdlNode, KdlValue};

use crate::ConfigError;

fn block_name(node: &KdlNode) -> &str {
    node.name().value()
}

/// Reject children of `node` not listed in `known`.
pub(super) fn reject_unknown(node: &KdlNode, known: &[&str]) -> Result<(), ConfigError> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let name = child.name().value();
        if !known.contains(&name) {
            return Err(ConfigError::invalid(
                block_name(node),
                format!("unknown field '{}'; expected one of {}", name, known.join(", ")),
            ));
        }
    }
    Ok(())
}

/// First positional argument of the child named `field`, if the child exists.
fn field_value<'a>(node: &'a KdlNode, field: &str) -> Result<Option<&'a KdlValue>, ConfigError> {
    let Some(child) = node
        .children()
        .and_then(|doc| doc.nodes().iter().find(|n| n.name().value() == field))
    else {
        return Ok(None);
    };

    child
        .entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .map(|entry| Some(entry.value()))
        .ok_or_else(|| {
            ConfigError::invalid(
                block_name(node),
                format!("field '{field}' requires a value"),
            )
        })
}

fn wrong_type(node: &KdlNode, field: &str, expected: &str) -> ConfigError {
    ConfigError::invalid(
        block_name(node),
        format!("field '{field}' must be {expected}"),
    )
}

pub(super) fn get_string_entry(node: &KdlNode, field: &str) -> Result<Option<String>, ConfigError> {
    match field_value(node, field)? {
        None => Ok(None),
        Some(value) => value
            .as_string()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| wrong_type(node, field, "a string")),
    }
}

pub(super) fn get_u64_entry(node: &KdlNode, field: &str) -> Result<Option<u64>, ConfigError> {
    match field_value(node, field)? {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|v| u64::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| wrong_type(node, field, "a non-negative integer")),
    }
}

pub(super) fn get_bool_entry(node: &KdlNode, field: &str) -> Result<Option<bool>, ConfigError> {
    match field_value(node, field)? {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| wrong_type(node, field, "#true or #false")),
    }
}
