//! Static registry of known chains.
//!
//! Loaded once from the embedded `data/chains.json`. Lookup is by shortname
//! or by numeric chain id; a small alias table keeps legacy shortnames
//! resolving after renames.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;

const CHAINS_JSON: &str = include_str!("../data/chains.json");

/// Legacy shortname aliases, applied before registry lookup.
const COMPAT_ALIASES: &[(&str, &str)] = &[("b2", "bsquared")];

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChainInfo {
    pub id: u64,
    pub shortname: String,
    #[serde(default)]
    pub multicall3_address: Option<String>,
    #[serde(default)]
    pub non_evm: bool,
    /// Public JSON-RPC endpoints, used to derive the public fallback config.
    #[serde(default)]
    pub rpc_urls: Vec<String>,
}

#[derive(Debug)]
pub struct ChainRegistry {
    chains: Vec<ChainInfo>,
    by_id: HashMap<u64, usize>,
    by_name: HashMap<String, usize>,
}

pub static REGISTRY: LazyLock<ChainRegistry> = LazyLock::new(|| {
    ChainRegistry::from_json(CHAINS_JSON).expect("embedded chains.json is valid")
});

impl ChainRegistry {
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        let chains: Vec<ChainInfo> = serde_json::from_str(raw)?;
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for (idx, chain) in chains.iter().enumerate() {
            by_id.insert(chain.id, idx);
            by_name.insert(chain.shortname.to_lowercase(), idx);
        }
        Ok(Self {
            chains,
            by_id,
            by_name,
        })
    }

    #[must_use]
    pub fn by_id(&self, id: u64) -> Option<&ChainInfo> {
        self.by_id.get(&id).map(|idx| &self.chains[*idx])
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&ChainInfo> {
        self.by_name.get(name).map(|idx| &self.chains[*idx])
    }

    /// Resolves a chain token supplied by a caller: lowercase, apply the
    /// alias table, look up by shortname, and finally try the token as a
    /// decimal chain id.
    #[must_use]
    pub fn resolve(&self, token: &str) -> Option<&ChainInfo> {
        let name = token.to_lowercase();
        let name = COMPAT_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map_or(name.as_str(), |(_, target)| *target);

        if let Some(chain) = self.by_name(name) {
            return Some(chain);
        }
        if let Ok(id) = name.parse::<u64>() {
            return self.by_id(id);
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainInfo> {
        self.chains.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookups() {
        let mainnet = REGISTRY.by_name("mainnet").unwrap();
        assert_eq!(mainnet.id, 1);
        assert_eq!(
            mainnet.multicall3_address.as_deref(),
            Some("0xcA11bde05977b3631167028862bE2a173976CA11")
        );
        assert_eq!(REGISTRY.by_id(137).unwrap().shortname, "polygon");
        assert!(REGISTRY.by_name("nosuchchain").is_none());
    }

    #[test]
    fn test_resolve_order() {
        // Case-insensitive shortname
        assert_eq!(REGISTRY.resolve("Mainnet").unwrap().id, 1);
        // Legacy alias
        assert_eq!(REGISTRY.resolve("b2").unwrap().shortname, "bsquared");
        // Decimal id fallback
        assert_eq!(REGISTRY.resolve("59144").unwrap().shortname, "linea");
        assert!(REGISTRY.resolve("unknown").is_none());
    }

    #[test]
    fn test_non_evm_flag() {
        assert!(REGISTRY.by_name("bitcoin").unwrap().non_evm);
        assert!(!REGISTRY.by_name("mainnet").unwrap().non_evm);
    }
}
