//! The narrow interface the deployer uses to talk to a chain.

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H160, H256};
use ethers::utils::{get_create2_address_from_hash, keccak256};

use crate::errors::ChainError;
use crate::network::GasStrategy;

pub mod ethers_client;

#[cfg(test)]
pub mod mock;

pub use self::ethers_client::EthersChainClient;

/// The deterministic deployment proxy, present at the same address on most
/// EVM chains. Calldata is `salt ++ init_code`, the proxy CREATE2s it.
pub const CREATE2_FACTORY: Address =
    H160(hex_literal::hex!("4e59b44847b379578588920ca78fbf26c0b4956c"));

pub fn create2_address(salt: H256, init_code: &Bytes) -> Address {
    get_create2_address_from_hash(
        CREATE2_FACTORY,
        salt.as_bytes(),
        keccak256(init_code),
    )
}

/// Calldata for the factory.
pub fn create2_calldata(salt: H256, init_code: &Bytes) -> Bytes {
    let mut data = Vec::with_capacity(32 + init_code.len());
    data.extend_from_slice(salt.as_bytes());
    data.extend_from_slice(init_code);
    Bytes::from(data)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentTx {
    pub from: Address,
    /// The factory for CREATE2 deployments, none for a plain create
    pub to: Option<Address>,
    pub data: Bytes,
    pub gas: GasStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub success: bool,
    /// Set for plain creates only
    pub contract_address: Option<Address>,
    pub confirmations: usize,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Hash of the code at `address`, none if there is no code.
    async fn code_hash(&self, address: Address)
        -> Result<Option<H256>, ChainError>;

    /// Signs and broadcasts, returning the transaction hash.
    async fn submit(&self, tx: DeploymentTx) -> Result<H256, ChainError>;

    /// None while the transaction isn't mined.
    async fn receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TxReceipt>, ChainError>;
}
