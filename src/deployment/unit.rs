use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, I256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::accounts::AccountRole;
use crate::artifacts::ContractArtifact;
use crate::config::UnitConfig;
use crate::errors::DeployError;
use crate::types::{RoleName, UnitName};

/// Integer literal, written either as a yaml number or a decimal string for
/// values past 64 bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Unsigned(u64),
    Signed(i64),
    Text(String),
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(value) => value.fmt(f),
            Self::Signed(value) => value.fmt(f),
            Self::Text(value) => value.fmt(f),
        }
    }
}

/// Where a constructor argument comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgSource {
    /// Address of another unit on the same network
    Unit { unit: UnitName },
    /// Address a role resolves to
    Role { role: RoleName },
    Address { address: Address },
    Uint { uint: Numeric },
    Int { int: Numeric },
    Bool { bool: bool },
    String { string: String },
    Bytes { bytes: Bytes },
    Bytes32 { bytes32: H256 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SaltPolicy {
    /// Salt derived from deployer, unit name, bytecode and arguments
    #[default]
    Derived,
    Fixed(H256),
    /// Plain CREATE, address depends on the deployer nonce
    None,
}

impl FromStr for SaltPolicy {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "derived" => Ok(Self::Derived),
            "none" => Ok(Self::None),
            fixed => Ok(Self::Fixed(fixed.parse().map_err(|_| {
                eyre::eyre!("Salt must be derived, none or 32 hex bytes: {s}")
            })?)),
        }
    }
}

impl TryFrom<String> for SaltPolicy {
    type Error = eyre::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SaltPolicy> for String {
    fn from(value: SaltPolicy) -> Self {
        match value {
            SaltPolicy::Derived => "derived".to_string(),
            SaltPolicy::None => "none".to_string(),
            SaltPolicy::Fixed(salt) => format!("{salt:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployableUnit {
    pub name: UnitName,
    pub contract: String,
    pub bytecode: Bytes,
    pub runtime_bytecode: Option<Bytes>,
    pub args: Vec<ArgSource>,
    /// Explicit dependencies followed by the units referenced from `args`
    pub dependencies: Vec<UnitName>,
    pub salt: SaltPolicy,
    pub source: Option<PathBuf>,
    pub qualified_name: Option<String>,
    pub verify: bool,
}

impl DeployableUnit {
    pub fn new(config: &UnitConfig, artifact: ContractArtifact) -> Self {
        let mut dependencies = config.depends_on.clone();

        for arg in &config.args {
            if let ArgSource::Unit { unit } = arg {
                if !dependencies.contains(unit) {
                    dependencies.push(unit.clone());
                }
            }
        }

        Self {
            name: config.name.clone(),
            contract: config.contract_name().to_string(),
            bytecode: artifact.bytecode,
            runtime_bytecode: artifact.deployed_bytecode,
            args: config.args.clone(),
            dependencies,
            salt: config.salt,
            source: config.source.clone(),
            qualified_name: config.qualified_name.clone(),
            verify: config.verify,
        }
    }

    pub fn bytecode_hash(&self) -> H256 {
        H256(keccak256(&self.bytecode))
    }

    /// Hash of the code the chain should hold once deployed, when known.
    pub fn runtime_code_hash(&self) -> Option<H256> {
        self.runtime_bytecode
            .as_ref()
            .map(|code| H256(keccak256(code)))
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleName> {
        self.args.iter().filter_map(|arg| match arg {
            ArgSource::Role { role } => Some(role),
            _ => None,
        })
    }

    /// The CREATE2 salt for this unit, if it is deterministic.
    pub fn salt(&self, deployer: Address, args: &ResolvedArgs) -> Option<H256> {
        match self.salt {
            SaltPolicy::None => None,
            SaltPolicy::Fixed(salt) => Some(salt),
            SaltPolicy::Derived => {
                let mut preimage = Vec::with_capacity(20 + 32 * 2 + 32);
                preimage.extend_from_slice(deployer.as_bytes());
                preimage.extend_from_slice(self.name.as_bytes());
                preimage.extend_from_slice(self.bytecode_hash().as_bytes());
                preimage.extend_from_slice(args.hash().as_bytes());

                Some(H256(keccak256(preimage)))
            }
        }
    }

    /// Turns the declared argument sources into abi tokens.
    ///
    /// `addresses` must hold every unit this one depends on.
    pub fn bind_args(
        &self,
        addresses: &BTreeMap<UnitName, Address>,
        roles: &[AccountRole],
    ) -> Result<ResolvedArgs, DeployError> {
        let invalid = |reason: String| DeployError::InvalidArgument {
            unit: self.name.clone(),
            reason,
        };

        let mut tokens = Vec::with_capacity(self.args.len());

        for arg in &self.args {
            let token = match arg {
                ArgSource::Unit { unit } => {
                    let address = addresses.get(unit).ok_or_else(|| {
                        DeployError::UnknownDependency {
                            unit: self.name.clone(),
                            dependency: unit.clone(),
                        }
                    })?;

                    Token::Address(*address)
                }
                ArgSource::Role { role } => {
                    let account = roles
                        .iter()
                        .find(|account| &account.role == role)
                        .ok_or_else(|| {
                            invalid(format!("role {role} was not resolved"))
                        })?;

                    Token::Address(account.address)
                }
                ArgSource::Address { address } => Token::Address(*address),
                ArgSource::Uint { uint } => {
                    let value = match uint {
                        Numeric::Unsigned(value) => U256::from(*value),
                        Numeric::Signed(value) => {
                            let value = u64::try_from(*value).map_err(|_| {
                                invalid(format!("{value} is negative"))
                            })?;
                            U256::from(value)
                        }
                        Numeric::Text(text) => U256::from_dec_str(text)
                            .map_err(|err| invalid(format!("{text}: {err}")))?,
                    };

                    Token::Uint(value)
                }
                ArgSource::Int { int } => {
                    let value = I256::from_dec_str(&int.to_string())
                        .map_err(|err| invalid(format!("{int}: {err}")))?;

                    Token::Int(value.into_raw())
                }
                ArgSource::Bool { bool } => Token::Bool(*bool),
                ArgSource::String { string } => Token::String(string.clone()),
                ArgSource::Bytes { bytes } => Token::Bytes(bytes.to_vec()),
                ArgSource::Bytes32 { bytes32 } => {
                    Token::FixedBytes(bytes32.as_bytes().to_vec())
                }
            };

            tokens.push(token);
        }

        Ok(ResolvedArgs::new(tokens))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArgs {
    pub tokens: Vec<Token>,
    pub encoded: Bytes,
}

impl ResolvedArgs {
    pub fn new(tokens: Vec<Token>) -> Self {
        let encoded = Bytes::from(ethers::abi::encode(&tokens));

        Self { tokens, encoded }
    }

    pub fn hash(&self) -> H256 {
        H256(keccak256(&self.encoded))
    }

    /// Creation bytecode with the abi encoded arguments appended.
    pub fn init_code(&self, bytecode: &Bytes) -> Bytes {
        let mut init_code = bytecode.to_vec();
        init_code.extend_from_slice(&self.encoded);
        Bytes::from(init_code)
    }
}
