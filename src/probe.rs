// Sapphillon
// SPDX-FileCopyrightText: 2025 Yuta Takahashi
// SPDX-License-Identifier: MPL-2.0 OR GPL-3.0-or-later

//! Installation probe.
//!
//! Decides from a capability snapshot whether a unit's nodes are registered.
//! A node belongs to a unit iff its `python_module` is exactly
//! `custom_nodes.<unit id>`; submodules and prefixes never match.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::host_api::ApiError;

/// Detail reported when no node matches.
pub const NO_MATCHES: &str = "No matching entries found in object_info";

/// Metadata the probe reads from one registered node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeMetadata {
    pub python_module: String,
    pub category: String,
}

/// Registered node name to its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilitySnapshot {
    nodes: BTreeMap<String, NodeMetadata>,
}

impl CapabilitySnapshot {
    /// Reads the snapshot from an `/object_info` body.
    ///
    /// The body must be a JSON object. Nodes without a string `python_module`
    /// get an empty module; a missing `category` becomes `"unknown"`.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ApiError> {
        let object = value
            .as_object()
            .ok_or_else(|| ApiError::Decode("object_info is not a JSON object".to_string()))?;

        let nodes = object
            .iter()
            .map(|(name, meta)| {
                let field = |key: &str| meta.get(key).and_then(serde_json::Value::as_str);
                let metadata = NodeMetadata {
                    python_module: field("python_module").unwrap_or_default().to_string(),
                    category: field("category").unwrap_or("unknown").to_string(),
                };
                (name.clone(), metadata)
            })
            .collect();
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A node attributed to the unit under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeMatch {
    pub node_name: String,
    pub python_module: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub found: bool,
    pub detail: String,
    pub matches: Vec<NodeMatch>,
}

/// Checks whether `unit_id` registered any node in `snapshot`.
pub fn check(unit_id: &str, snapshot: &CapabilitySnapshot) -> ProbeResult {
    let module = format!("custom_nodes.{unit_id}");
    let matches: Vec<NodeMatch> = snapshot
        .nodes
        .iter()
        .filter(|(_, meta)| meta.python_module == module)
        .map(|(name, meta)| NodeMatch {
            node_name: name.clone(),
            python_module: meta.python_module.clone(),
            category: meta.category.clone(),
        })
        .collect();

    if matches.is_empty() {
        return ProbeResult {
            found: false,
            detail: NO_MATCHES.to_string(),
            matches,
        };
    }

    let lines: Vec<String> = matches
        .iter()
        .map(|m| {
            format!(
                "- Node: {}, Module: {}, Category: {}",
                m.node_name, m.python_module, m.category
            )
        })
        .collect();
    ProbeResult {
        found: true,
        detail: format!("Found following entries:\n{}", lines.join("\n")),
        matches,
    }
}
