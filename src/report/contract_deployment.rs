use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};

use crate::ledger::DeploymentRecord;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ContractDeployment {
    pub address: Address,

    /// None when matching code was adopted without a transaction
    #[serde(default)]
    pub tx_hash: Option<H256>,

    #[serde(default)]
    pub deployer: Option<Address>,
}

impl ContractDeployment {
    pub fn from_record(record: &DeploymentRecord) -> Option<Self> {
        Some(Self {
            address: record.address?,
            tx_hash: record.tx_hash,
            deployer: record.deployer,
        })
    }
}
