use std::collections::{BTreeMap, HashSet};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use eyre::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::PrivateKey;
use crate::errors::DeployError;
use crate::network::NetworkProfile;
use crate::types::RoleName;

/// How a role maps to an account on a network.
///
/// Written the way named accounts usually are: `0` is the first signer,
/// `0x…` a fixed address and any other string the name of another role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleBinding {
    /// Index into the network's configured accounts
    Signer(usize),
    /// A fixed address, which can't sign
    Address(Address),
    /// Same account as another role
    Alias(RoleName),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    #[serde(default)]
    pub default: Option<RoleBinding>,

    /// Per network overrides of `default`
    #[serde(default)]
    pub networks: BTreeMap<String, RoleBinding>,
}

impl RoleConfig {
    fn binding_for(&self, profile: &NetworkProfile) -> Option<&RoleBinding> {
        self.networks
            .get(profile.name.as_str())
            .or(self.default.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRole {
    pub role: RoleName,
    pub address: Address,
}

/// Local signing keys for the active network.
///
/// Key material never leaves this type; the rest of the crate only sees
/// addresses and, for the deployer, the wallet handed to the chain client.
#[derive(Debug, Clone, Default)]
pub struct Signers {
    wallets: Vec<LocalWallet>,
}

impl Signers {
    pub fn new(keys: &[PrivateKey], chain_id: u64) -> Self {
        let wallets = keys
            .iter()
            .map(|key| {
                LocalWallet::from(key.key.clone()).with_chain_id(chain_id)
            })
            .collect();

        Self { wallets }
    }

    /// Loads the keys named by the profile's `accounts` entries.
    ///
    /// An `override_key` replaces the first account, mirroring the
    /// `--private-key` flag.
    pub fn from_env(
        profile: &NetworkProfile,
        override_key: Option<&PrivateKey>,
    ) -> eyre::Result<Self> {
        let mut keys = Vec::with_capacity(profile.accounts.len());

        for var in &profile.accounts {
            let raw = std::env::var(var).with_context(|| {
                format!("Missing account key {var} for {}", profile.name)
            })?;

            let key: PrivateKey = raw
                .parse()
                .with_context(|| format!("Invalid private key in {var}"))?;

            keys.push(key);
        }

        if let Some(key) = override_key {
            if keys.is_empty() {
                keys.push(key.clone());
            } else {
                keys[0] = key.clone();
            }
        }

        Ok(Self::new(&keys, profile.chain_id))
    }

    pub fn wallet(&self, index: usize) -> Option<&LocalWallet> {
        self.wallets.get(index)
    }

    pub fn address(&self, index: usize) -> Option<Address> {
        self.wallet(index).map(|wallet| wallet.address())
    }
}

#[derive(Debug, Clone)]
pub struct AccountResolver {
    roles: BTreeMap<RoleName, RoleConfig>,
    signers: Signers,
}

impl AccountResolver {
    pub fn new(
        roles: BTreeMap<RoleName, RoleConfig>,
        signers: Signers,
    ) -> Self {
        Self { roles, signers }
    }

    /// Follows aliases until a signer index or address is reached.
    fn resolve_binding(
        &self,
        role: &RoleName,
        profile: &NetworkProfile,
    ) -> Result<RoleBinding, DeployError> {
        let unresolved = || DeployError::UnresolvedAccount {
            role: role.clone(),
            network: profile.name.clone(),
        };

        let mut visited = HashSet::new();
        let mut current = role.clone();

        loop {
            if !visited.insert(current.clone()) {
                return Err(unresolved());
            }

            let binding = self
                .roles
                .get(&current)
                .and_then(|config| config.binding_for(profile))
                .ok_or_else(unresolved)?;

            match binding {
                RoleBinding::Alias(next) => current = next.clone(),
                other => return Ok(other.clone()),
            }
        }
    }

    pub fn resolve_role(
        &self,
        role: &RoleName,
        profile: &NetworkProfile,
    ) -> Result<Address, DeployError> {
        let address = match self.resolve_binding(role, profile)? {
            RoleBinding::Signer(index) => self.signers.address(index),
            RoleBinding::Address(address) => Some(address),
            RoleBinding::Alias(_) => None,
        };

        let address = address.ok_or_else(|| DeployError::UnresolvedAccount {
            role: role.clone(),
            network: profile.name.clone(),
        })?;

        debug!(%role, ?address, "Resolved account role");

        Ok(address)
    }

    /// The wallet behind a role, if the role maps to a local signer.
    pub fn signer_for(
        &self,
        role: &RoleName,
        profile: &NetworkProfile,
    ) -> Result<LocalWallet, DeployError> {
        match self.resolve_binding(role, profile)? {
            RoleBinding::Signer(index) => {
                self.signers.wallet(index).cloned().ok_or_else(|| {
                    DeployError::UnresolvedAccount {
                        role: role.clone(),
                        network: profile.name.clone(),
                    }
                })
            }
            _ => Err(DeployError::UnresolvedAccount {
                role: role.clone(),
                network: profile.name.clone(),
            }),
        }
    }

    pub fn resolve_roles<'a>(
        &self,
        roles: impl IntoIterator<Item = &'a RoleName>,
        profile: &NetworkProfile,
    ) -> Result<Vec<AccountRole>, DeployError> {
        let mut resolved: Vec<AccountRole> = Vec::new();

        for role in roles {
            if resolved.iter().any(|account| &account.role == role) {
                continue;
            }

            resolved.push(AccountRole {
                role: role.clone(),
                address: self.resolve_role(role, profile)?,
            });
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    fn resolver() -> AccountResolver {
        let roles = maplit::btreemap! {
            RoleName::from("deployer") => RoleConfig {
                default: Some(RoleBinding::Signer(0)),
                networks: Default::default(),
            },
            RoleName::from("owner") => RoleConfig {
                default: Some(RoleBinding::Alias("deployer".into())),
                networks: maplit::btreemap! {
                    "Camino".to_string() => RoleBinding::Address(
                        test_utils::address(0xca)
                    ),
                },
            },
            RoleName::from("loop_a") => RoleConfig {
                default: Some(RoleBinding::Alias("loop_b".into())),
                networks: Default::default(),
            },
            RoleName::from("loop_b") => RoleConfig {
                default: Some(RoleBinding::Alias("loop_a".into())),
                networks: Default::default(),
            },
        };

        AccountResolver::new(roles, test_utils::signers(1))
    }

    #[test]
    fn alias_follows_default_binding() -> eyre::Result<()> {
        let resolver = resolver();
        let profile = test_utils::profile("Columbus");

        let deployer = resolver.resolve_role(&"deployer".into(), &profile)?;
        let owner = resolver.resolve_role(&"owner".into(), &profile)?;

        assert_eq!(deployer, owner);
        assert_eq!(Some(deployer), test_utils::signers(1).address(0));

        Ok(())
    }

    #[test]
    fn network_override_wins() -> eyre::Result<()> {
        let resolver = resolver();
        let profile = test_utils::profile("Camino");

        let owner = resolver.resolve_role(&"owner".into(), &profile)?;
        assert_eq!(owner, test_utils::address(0xca));

        assert!(resolver.signer_for(&"owner".into(), &profile).is_err());
        assert!(resolver.signer_for(&"deployer".into(), &profile).is_ok());

        Ok(())
    }

    #[test]
    fn unresolved_roles() {
        let resolver = resolver();
        let profile = test_utils::profile("Columbus");

        for role in ["treasury", "loop_a"] {
            let err =
                resolver.resolve_role(&role.into(), &profile).unwrap_err();
            assert!(matches!(err, DeployError::UnresolvedAccount { .. }));
        }

        let no_keys = AccountResolver::new(
            maplit::btreemap! {
                RoleName::from("deployer") => RoleConfig {
                    default: Some(RoleBinding::Signer(3)),
                    networks: Default::default(),
                },
            },
            Signers::default(),
        );

        assert!(no_keys.resolve_role(&"deployer".into(), &profile).is_err());
    }
}
