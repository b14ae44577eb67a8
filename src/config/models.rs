//! Node and secret configuration models.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Default cap for `eth_getLogs` block ranges. Most commercial providers
/// reject ranges past 10k blocks; 3000 keeps a margin for the slower ones.
pub const DEFAULT_MAX_BLOCKS_DISTANCE: u64 = 3000;

/// Block-range cap applied to public fallback nodes, which tend to be far
/// stricter than paid endpoints.
pub const PUBLIC_MAX_BLOCKS_DISTANCE: u64 = 100;

fn default_max_blocks_distance() -> Option<u64> {
    Some(DEFAULT_MAX_BLOCKS_DISTANCE)
}

fn default_true() -> bool {
    true
}

/// One upstream node of a chain pool.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    #[serde(default)]
    pub chain_name: String,
    #[serde(default)]
    pub node_name: String,
    /// URL template; `{name}` placeholders are expanded from [`Secrets`].
    pub url: String,
    #[serde(default = "default_max_blocks_distance")]
    pub max_blocks_distance: Option<u64>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_true")]
    pub supports_batch: bool,
    #[serde(default)]
    pub supports_blockbook: bool,
}

impl NodeConfig {
    /// Builds a node entry from its YAML config value. A bare string is
    /// shorthand for `{url: <string>}`.
    pub fn from_config_value(
        chain_name: &str,
        node_name: &str,
        value: &serde_yaml::Value,
    ) -> Result<Self> {
        let mut node: Self = match value {
            serde_yaml::Value::String(url) => Self {
                chain_name: String::new(),
                node_name: String::new(),
                url: url.clone(),
                max_blocks_distance: default_max_blocks_distance(),
                headers: Vec::new(),
                supports_batch: true,
                supports_blockbook: false,
            },
            other => serde_yaml::from_value(other.clone()).map_err(|err| {
                Error::config(format!(
                    "invalid node config for {chain_name}/{node_name}: {err}"
                ))
            })?,
        };
        node.chain_name = chain_name.to_string();
        node.node_name = node_name.to_string();
        Ok(node)
    }

    /// A public fallback node, named after the endpoint host.
    #[must_use]
    pub fn public(chain_name: &str, node_name: &str, url: &str) -> Self {
        Self {
            chain_name: chain_name.to_string(),
            node_name: node_name.to_string(),
            url: url.to_string(),
            max_blocks_distance: Some(PUBLIC_MAX_BLOCKS_DISTANCE),
            headers: Vec::new(),
            supports_batch: true,
            supports_blockbook: false,
        }
    }

    /// The concrete endpoint URL with all placeholders substituted.
    pub fn url(&self, secrets: &Secrets) -> Result<String> {
        expand_template(&self.url, |name| secrets.get(name).map(str::to_string))
    }
}

/// Flat map of named secret strings usable as `{name}` placeholders.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secrets(BTreeMap<String, String>);

impl Secrets {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Merges `other` over `self`; non-empty values from `other` win.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        let mut result = self.0.clone();
        for (name, value) in &other.0 {
            if !value.is_empty() || !result.contains_key(name) {
                result.insert(name.clone(), value.clone());
            }
        }
        Self(result)
    }

    /// A copy where every empty value is replaced with `sentinel`, used to
    /// detect templates whose real secret is missing.
    #[must_use]
    pub fn sentinel_filled(&self, sentinel: &str) -> Self {
        Self(
            self.0
                .iter()
                .map(|(name, value)| {
                    let value = if value.is_empty() {
                        sentinel.to_string()
                    } else {
                        value.clone()
                    };
                    (name.clone(), value)
                })
                .collect(),
        )
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Expands `{name}` placeholders in `template` via `lookup`. An unclosed
/// brace or an unknown name is a configuration error.
pub fn expand_template(
    template: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(Error::config(format!(
                "unclosed placeholder in template {template:?}"
            )));
        };
        let name = &after[..end];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                return Err(Error::config(format!(
                    "unknown placeholder {name:?} in template {template:?}"
                )))
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
