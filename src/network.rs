use std::collections::BTreeMap;

use ethers::types::U256;
use eyre::ensure;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::errors::DeployError;
use crate::types::NetworkName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasPricing {
    /// Ask the node for its suggested price.
    #[default]
    Auto,
    /// Use `gas_price` as is.
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasStrategy {
    #[serde(default)]
    pub pricing: GasPricing,

    /// Gas price in wei, required for fixed pricing
    #[serde(default)]
    pub gas_price: Option<u64>,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl Default for GasStrategy {
    fn default() -> Self {
        Self {
            pricing: GasPricing::Auto,
            gas_price: None,
            multiplier: default_multiplier(),
        }
    }
}

impl GasStrategy {
    /// The price to bid given the node's suggestion.
    ///
    /// Fixed pricing ignores the suggestion. The multiplier is applied in
    /// thousandths to stay in integer arithmetic.
    pub fn price(&self, suggested: U256) -> U256 {
        let base = match self.pricing {
            GasPricing::Auto => suggested,
            GasPricing::Fixed => U256::from(self.gas_price.unwrap_or_default()),
        };

        let per_mille = (self.multiplier * 1000.0).round().max(0.0) as u64;

        base * U256::from(per_mille) / U256::from(1000u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExplorerKind {
    Etherscan,
    Sourcify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorerEndpoint {
    pub kind: ExplorerKind,

    pub api_url: String,

    /// Literal API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ExplorerEndpoint {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|key| !key.trim().is_empty())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    #[serde(default)]
    pub name: NetworkName,

    pub chain_id: u64,

    pub rpc_url: String,

    #[serde(default)]
    pub gas: GasStrategy,

    #[serde(default)]
    pub explorers: Vec<ExplorerEndpoint>,

    /// Environment variables holding the private keys of this network's
    /// accounts, in signer index order
    #[serde(default)]
    pub accounts: Vec<String>,

    /// Only live networks get their deployments verified
    #[serde(default)]
    pub live: bool,

    /// Networks that don't save deployments keep their ledger in memory
    #[serde(default = "default_true")]
    pub save_deployments: bool,

    /// Overrides the run wide confirmation count
    #[serde(default)]
    pub confirmations: Option<usize>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    networks: BTreeMap<NetworkName, NetworkProfile>,
}

impl NetworkRegistry {
    pub fn new(
        networks: BTreeMap<NetworkName, NetworkProfile>,
    ) -> eyre::Result<Self> {
        let mut validated = BTreeMap::new();

        for (name, mut profile) in networks {
            ensure!(
                profile.gas.multiplier > 0.0,
                "Network {name} has a non positive gas multiplier"
            );
            ensure!(
                profile.gas.pricing != GasPricing::Fixed
                    || profile.gas.gas_price.is_some(),
                "Network {name} uses fixed gas pricing without a gas_price"
            );

            profile.name = name.clone();
            validated.insert(name, profile);
        }

        Ok(Self {
            networks: validated,
        })
    }

    pub fn resolve(
        &self,
        name: &NetworkName,
    ) -> Result<NetworkProfile, DeployError> {
        self.networks
            .get(name)
            .cloned()
            .ok_or_else(|| DeployError::UnknownNetwork {
                name: name.clone(),
                known: self.names().join(", "),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.networks.keys().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(chain_id: u64) -> NetworkProfile {
        NetworkProfile {
            name: NetworkName::default(),
            chain_id,
            rpc_url: "http://localhost:8545".to_string(),
            gas: GasStrategy::default(),
            explorers: vec![],
            accounts: vec![],
            live: false,
            save_deployments: true,
            confirmations: None,
        }
    }

    #[test]
    fn resolves_configured_networks() -> eyre::Result<()> {
        let registry = NetworkRegistry::new(maplit::btreemap! {
            NetworkName::from("Columbus") => profile(501),
            NetworkName::from("Camino") => profile(500),
        })?;

        let columbus = registry.resolve(&"Columbus".into())?;
        assert_eq!(columbus.chain_id, 501);
        assert_eq!(columbus.name, NetworkName::from("Columbus"));

        let err = registry.resolve(&"Mainnet".into()).unwrap_err();
        assert!(matches!(err, DeployError::UnknownNetwork { .. }));
        assert!(err.to_string().contains("Camino, Columbus"));

        Ok(())
    }

    #[test]
    fn fixed_pricing_requires_a_price() {
        let mut bad = profile(1);
        bad.gas.pricing = GasPricing::Fixed;

        let result = NetworkRegistry::new(maplit::btreemap! {
            NetworkName::from("bad") => bad,
        });

        assert!(result.is_err());
    }

    #[test]
    fn gas_multiplier() {
        let auto = GasStrategy {
            pricing: GasPricing::Auto,
            gas_price: None,
            multiplier: 2.0,
        };
        assert_eq!(auto.price(U256::from(100u64)), U256::from(200u64));

        let fixed = GasStrategy {
            pricing: GasPricing::Fixed,
            gas_price: Some(30),
            multiplier: 1.5,
        };
        assert_eq!(fixed.price(U256::from(100u64)), U256::from(45u64));
    }
}
