use std::sync::Arc;

use async_trait::async_trait;
use ethers::prelude::{Http, LocalWallet, Provider, SignerMiddleware};
use ethers::providers::Middleware;
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, H256, U64};
use ethers::utils::keccak256;
use eyre::Context;
use tracing::{debug, instrument};

use super::{ChainClient, DeploymentTx, TxReceipt};
use crate::errors::ChainError;
use crate::network::NetworkProfile;

pub type RpcSigner = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Chain client signing locally with the deployer wallet and talking to
/// the network's rpc endpoint.
pub struct EthersChainClient {
    signer: Arc<RpcSigner>,
}

impl EthersChainClient {
    /// Connects and checks the endpoint serves the profile's chain.
    pub async fn connect(
        profile: &NetworkProfile,
        wallet: LocalWallet,
    ) -> eyre::Result<Self> {
        let provider = Provider::<Http>::try_from(profile.rpc_url.as_str())
            .with_context(|| format!("Invalid rpc url {}", profile.rpc_url))?;

        let chain_id = provider
            .get_chainid()
            .await
            .with_context(|| format!("Connecting to {}", profile.rpc_url))?;

        eyre::ensure!(
            chain_id.as_u64() == profile.chain_id,
            "{} serves chain {chain_id}, network {} expects {}",
            profile.rpc_url,
            profile.name,
            profile.chain_id
        );

        let wallet = wallet.with_chain_id(profile.chain_id);
        let signer = SignerMiddleware::new(provider, wallet);

        Ok(Self {
            signer: Arc::new(signer),
        })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }
}

fn rpc(err: impl ToString) -> ChainError {
    ChainError::Rpc(err.to_string())
}

/// Node errors that no amount of resending fixes
const PERMANENT_SUBMISSION_ERRORS: &[&str] = &[
    "insufficient funds",
    "execution reverted",
    "gas required exceeds",
    "intrinsic gas too low",
    "invalid sender",
    "exceeds block gas limit",
];

fn submission(err: impl ToString) -> ChainError {
    let message = err.to_string();
    let lowercase = message.to_lowercase();

    if PERMANENT_SUBMISSION_ERRORS
        .iter()
        .any(|permanent| lowercase.contains(permanent))
    {
        ChainError::Rpc(message)
    } else {
        ChainError::Submission(message)
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn code_hash(
        &self,
        address: Address,
    ) -> Result<Option<H256>, ChainError> {
        let code = self.signer.get_code(address, None).await.map_err(rpc)?;

        Ok((!code.is_empty()).then(|| H256(keccak256(&code))))
    }

    #[instrument(skip_all, fields(to = ?tx.to))]
    async fn submit(&self, tx: DeploymentTx) -> Result<H256, ChainError> {
        let suggested = self.signer.get_gas_price().await.map_err(submission)?;
        let gas_price = tx.gas.price(suggested);

        let mut request = TransactionRequest::new()
            .from(tx.from)
            .data(tx.data)
            .gas_price(gas_price);

        if let Some(to) = tx.to {
            request = request.to(to);
        }

        let mut typed = TypedTransaction::Legacy(request);

        self.signer
            .fill_transaction(&mut typed, None)
            .await
            .map_err(submission)?;

        let pending = self
            .signer
            .send_transaction(typed, None)
            .await
            .map_err(submission)?;

        let tx_hash = pending.tx_hash();
        debug!(?tx_hash, %gas_price, "Sent deployment transaction");

        Ok(tx_hash)
    }

    async fn receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TxReceipt>, ChainError> {
        let Some(receipt) = self
            .signer
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc)?
        else {
            return Ok(None);
        };

        let Some(block) = receipt.block_number else {
            return Ok(None);
        };

        let head = self.signer.get_block_number().await.map_err(rpc)?;
        let confirmations = head.saturating_sub(block) + U64::one();

        Ok(Some(TxReceipt {
            success: receipt.status == Some(U64::one()),
            contract_address: receipt.contract_address,
            confirmations: confirmations.as_usize(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_transactions_are_not_retried() {
        let permanent = [
            "(code: -32000, message: insufficient funds for gas * price + \
             value, data: None)",
            "Execution reverted: Ownable: caller is not the owner",
            "gas required exceeds allowance (30000000)",
        ];

        for message in permanent {
            assert!(!submission(message).is_transient(), "{message}");
        }

        let transient = [
            "nonce too low",
            "replacement transaction underpriced",
            "error sending request for url (http://127.0.0.1:8545/)",
        ];

        for message in transient {
            assert!(submission(message).is_transient(), "{message}");
        }
    }
}
