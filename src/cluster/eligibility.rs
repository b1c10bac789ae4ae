//! Decides which nodes may host transform tasks.
//!
//! A node is eligible when it declares the `transform` role. Clusters that
//! predate explicit roles are handled by a separate legacy inference path
//! (deprecated `node.transform` setting, then data role or data tiers) that is
//! tagged as such and can be switched off on its own.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::NodeSettings;
use crate::error::{Result, TransformError};

pub const TRANSFORM_ROLE: &str = "transform";
pub const DATA_ROLE: &str = "data";

/// Cluster-visible node attribute carrying the eligibility decision.
pub const TRANSFORM_ENABLED_NODE_ATTR: &str = "transform.node";

pub const NODE_ROLES_SETTING: &str = "node.roles";
pub const LEGACY_TRANSFORM_SETTING: &str = "node.transform";
pub const LEGACY_DATA_SETTING: &str = "node.data";
pub const LEGACY_DATA_TIERS_SETTING: &str = "node.data_tiers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityOptions {
    /// Allow inferring the role for nodes that do not declare `node.roles`.
    pub legacy_inference: bool,
}

impl Default for EligibilityOptions {
    fn default() -> Self {
        Self {
            legacy_inference: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EligibilitySource {
    /// `node.roles` is set; only its contents count.
    ExplicitRole,
    /// Derived from legacy settings on a node without `node.roles`.
    LegacyInference,
    /// No roles declared and legacy inference is disabled.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub source: EligibilitySource,
}

fn node_attr_key(attr: &str) -> String {
    format!("node.attr.{}", attr)
}

/// Resolve eligibility from a node's own settings.
pub fn resolve(settings: &NodeSettings, options: &EligibilityOptions) -> Result<Eligibility> {
    if let Some(roles) = settings.get_list(NODE_ROLES_SETTING) {
        return Ok(Eligibility {
            eligible: roles.iter().any(|r| r == TRANSFORM_ROLE),
            source: EligibilitySource::ExplicitRole,
        });
    }

    if !options.legacy_inference {
        return Ok(Eligibility {
            eligible: false,
            source: EligibilitySource::Disabled,
        });
    }

    Ok(Eligibility {
        eligible: legacy_eligibility(settings)?,
        source: EligibilitySource::LegacyInference,
    })
}

fn legacy_eligibility(settings: &NodeSettings) -> Result<bool> {
    if let Some(enabled) = settings.get_bool(LEGACY_TRANSFORM_SETTING)? {
        tracing::warn!(
            setting = LEGACY_TRANSFORM_SETTING,
            "Setting is deprecated, declare the transform role in [{}] instead",
            NODE_ROLES_SETTING
        );
        return Ok(enabled);
    }
    let data = settings.get_bool(LEGACY_DATA_SETTING)?.unwrap_or(true);
    let explicit_tier = settings
        .get_list(LEGACY_DATA_TIERS_SETTING)
        .is_some_and(|tiers| !tiers.is_empty());
    Ok(data || explicit_tier)
}

/// Build the node attributes published at startup.
///
/// Fails if the operator tried to set the reserved attribute directly.
pub fn startup_attributes(
    settings: &NodeSettings,
    options: &EligibilityOptions,
) -> Result<BTreeMap<String, String>> {
    if settings.contains(&node_attr_key(TRANSFORM_ENABLED_NODE_ATTR)) {
        return Err(TransformError::Configuration(
            "Directly setting transform node attributes is not permitted, please use the documented node settings instead"
                .to_string(),
        ));
    }

    let eligibility = resolve(settings, options)?;
    let mut attributes = BTreeMap::new();
    for (key, value) in settings_attributes(settings) {
        attributes.insert(key, value);
    }
    attributes.insert(
        TRANSFORM_ENABLED_NODE_ATTR.to_string(),
        eligibility.eligible.to_string(),
    );
    Ok(attributes)
}

fn settings_attributes(settings: &NodeSettings) -> Vec<(String, String)> {
    settings
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix("node.attr.")
                .map(|attr| (attr.to_string(), v.to_string()))
        })
        .collect()
}

/// Roles a node advertises in cluster state.
pub fn declared_roles(settings: &NodeSettings, eligibility: &Eligibility) -> BTreeSet<String> {
    let mut roles: BTreeSet<String> = match settings.get_list(NODE_ROLES_SETTING) {
        Some(list) => list.into_iter().collect(),
        None => {
            let mut legacy = BTreeSet::new();
            if settings
                .get_bool(LEGACY_DATA_SETTING)
                .ok()
                .flatten()
                .unwrap_or(true)
            {
                legacy.insert(DATA_ROLE.to_string());
            }
            legacy
        }
    };
    if eligibility.eligible {
        roles.insert(TRANSFORM_ROLE.to_string());
    }
    roles
}

/// Judge a remote node from what it publishes in cluster state.
///
/// The published attribute is authoritative. Nodes that do not publish it
/// fall back to legacy inference from their data role.
pub fn is_eligible(
    attributes: &BTreeMap<String, String>,
    roles: &BTreeSet<String>,
    options: &EligibilityOptions,
) -> bool {
    match attributes.get(TRANSFORM_ENABLED_NODE_ATTR).map(String::as_str) {
        Some("true") => true,
        Some(_) => false,
        None if roles.contains(TRANSFORM_ROLE) => true,
        None => options.legacy_inference && roles.contains(DATA_ROLE),
    }
}
