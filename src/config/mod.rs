//! Upstream pool configuration.
//!
//! The chains config is a two-level YAML map `chain -> node_name -> node`,
//! with `x_`-prefixed keys at either level skipped as metadata. Node URL
//! templates are validated against a sentinel-filled secret set at load
//! time, and chains whose private nodes all miss a real secret fall back to
//! the public endpoints known to the chain registry.

pub mod models;

pub use models::{NodeConfig, Secrets};

use crate::chains::{ChainRegistry, REGISTRY};
use crate::error::{Error, Result};
use crate::settings::Settings;
use indexmap::IndexMap;

const NODES_YAML: &str = include_str!("../../data/nodes.yaml");
const SECRETS_YAML: &str = include_str!("../../data/secrets.yaml");

/// Marker substituted for empty secret values when probing which node URLs
/// would stay unresolved with the real secrets.
pub const SECRET_PLACEHOLDER: &str = "__EVMPROXY_SECRET_PLACEHOLDER__";

pub type ChainNodes = IndexMap<String, NodeConfig>;

/// The full `chain -> node_name -> node` map. Insertion order of nodes is
/// the initial rotation order of the pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyConfig {
    pub chains: IndexMap<String, ChainNodes>,
}

fn is_extra_key(key: &str) -> bool {
    key.starts_with("x_")
}

impl ProxyConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        Self::from_yaml_value(&value)
    }

    pub fn from_yaml_value(value: &serde_yaml::Value) -> Result<Self> {
        let serde_yaml::Value::Mapping(chains_raw) = value else {
            return Err(Error::config("chains config must be a mapping"));
        };

        let mut chains = IndexMap::new();
        for (chain_key, chain_value) in chains_raw {
            let Some(chain_name) = chain_key.as_str() else {
                return Err(Error::config("chain names must be strings"));
            };
            if is_extra_key(chain_name) {
                continue;
            }
            let serde_yaml::Value::Mapping(nodes_raw) = chain_value else {
                return Err(Error::config(format!(
                    "chain {chain_name:?} config must be a mapping"
                )));
            };
            let mut nodes = IndexMap::new();
            for (node_key, node_value) in nodes_raw {
                let Some(node_name) = node_key.as_str() else {
                    return Err(Error::config(format!(
                        "node names of chain {chain_name:?} must be strings"
                    )));
                };
                if is_extra_key(node_name) {
                    continue;
                }
                let node = NodeConfig::from_config_value(chain_name, node_name, node_value)?;
                nodes.insert(node_name.to_string(), node);
            }
            chains.insert(chain_name.to_string(), nodes);
        }
        Ok(Self { chains })
    }

    /// Expands every node URL template against `secrets`, collecting all
    /// failures so a broken config names every offender at once.
    pub fn validate_templates(&self, secrets: &Secrets) -> Result<()> {
        let mut errors = Vec::new();
        for (chain_name, nodes) in &self.chains {
            for (node_name, node) in nodes {
                if let Err(err) = node.url(secrets) {
                    errors.push(format!("{chain_name}/{node_name}: {err}"));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::config(format!(
                "node URL template errors: {}",
                errors.join("; ")
            )))
        }
    }
}

/// The embedded default pools.
pub fn default_config() -> Result<ProxyConfig> {
    ProxyConfig::from_yaml_str(NODES_YAML)
}

/// The embedded universe of known secret names (all empty).
pub fn default_secrets() -> Result<Secrets> {
    Secrets::from_yaml_str(SECRETS_YAML)
}

/// Public-endpoint pools derived from the chain registry, one node per
/// public RPC URL, named after the endpoint host.
#[must_use]
pub fn public_config(registry: &ChainRegistry) -> ProxyConfig {
    let mut chains = IndexMap::new();
    for chain in registry.iter() {
        if chain.rpc_urls.is_empty() {
            continue;
        }
        let mut nodes = IndexMap::new();
        for url in &chain.rpc_urls {
            let node_name = url_host(url).unwrap_or_else(|| url.clone());
            nodes.insert(
                node_name.clone(),
                NodeConfig::public(&chain.shortname, &node_name, url),
            );
        }
        chains.insert(chain.shortname.clone(), nodes);
    }
    ProxyConfig { chains }
}

/// Per chain, keeps the private nodes whose URLs resolve with the real
/// secrets; when none do, substitutes the public node list. Chains left
/// with no nodes at all are kept (requests for them fail with
/// `NoNodesAvailable`).
#[must_use]
pub fn combine_with_public(
    config: &ProxyConfig,
    secrets: &Secrets,
    public: &ProxyConfig,
) -> ProxyConfig {
    let sentinel_secrets = secrets.sentinel_filled(SECRET_PLACEHOLDER);
    let mut chains = IndexMap::new();
    for (chain_name, nodes) in &config.chains {
        let mut resolved: ChainNodes = nodes
            .iter()
            .filter(|(_, node)| {
                node.url(&sentinel_secrets)
                    .is_ok_and(|url| !url.contains(SECRET_PLACEHOLDER))
            })
            .map(|(name, node)| (name.clone(), node.clone()))
            .collect();
        if resolved.is_empty() {
            resolved = public.chains.get(chain_name).cloned().unwrap_or_default();
        }
        chains.insert(chain_name.clone(), resolved);
    }
    ProxyConfig { chains }
}

/// Loads the chains config and secrets for `settings`: file overrides when
/// given, embedded defaults otherwise, then template validation and the
/// optional public fallback merge.
pub fn load(settings: &Settings) -> Result<(ProxyConfig, Secrets)> {
    let config = match &settings.config_path {
        Some(path) => ProxyConfig::from_yaml_str(&std::fs::read_to_string(path)?)?,
        None => default_config()?,
    };

    let mut secrets = default_secrets()?;
    match &settings.secrets_path {
        Some(path) => {
            let loaded = Secrets::from_yaml_str(&std::fs::read_to_string(path)?)?;
            secrets = secrets.merged_with(&loaded);
        }
        None => tracing::warn!("no secrets file configured"),
    }

    config.validate_templates(&secrets.sentinel_filled(SECRET_PLACEHOLDER))?;

    let config = if settings.fallback_to_public {
        combine_with_public(&config, &secrets, &public_config(&REGISTRY))
    } else {
        config
    };
    Ok((config, secrets))
}

fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest.split(['/', '?']).next()?;
    let host = host.rsplit_once('@').map_or(host, |(_, host)| host);
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}
