//! In-memory chain for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use ethers::utils::{get_contract_address, keccak256};

use super::{
    create2_address, ChainClient, DeploymentTx, TxReceipt, CREATE2_FACTORY,
};
use crate::deployment::unit::DeployableUnit;
use crate::errors::ChainError;

#[derive(Default)]
struct State {
    code: HashMap<Address, Bytes>,
    receipts: HashMap<H256, TxReceipt>,
    nonces: HashMap<Address, u64>,
    submitted: Vec<DeploymentTx>,
    /// Creation bytecode prefix to the runtime code it deploys
    runtimes: Vec<(Bytes, Bytes)>,
    failing_submissions: usize,
    reverting: bool,
    unmined: bool,
}

#[derive(Default)]
pub struct MockChain {
    state: Mutex<State>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain that installs each unit's runtime bytecode when it is
    /// created.
    pub fn knowing(units: &[DeployableUnit]) -> Self {
        let chain = Self::new();

        {
            let mut state = chain.state.lock().unwrap();
            for unit in units {
                if let Some(runtime) = &unit.runtime_bytecode {
                    state
                        .runtimes
                        .push((unit.bytecode.clone(), runtime.clone()));
                }
            }
        }

        chain
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.state.lock().unwrap().code.insert(address, code);
    }

    pub fn fail_next_submissions(&self, count: usize) {
        self.state.lock().unwrap().failing_submissions = count;
    }

    pub fn revert_transactions(&self, reverting: bool) {
        self.state.lock().unwrap().reverting = reverting;
    }

    /// Submissions are accepted but never mined.
    pub fn stop_mining(&self, unmined: bool) {
        self.state.lock().unwrap().unmined = unmined;
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }

    pub fn submitted(&self) -> Vec<DeploymentTx> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Records a mined transaction as if a previous process had sent it.
    pub fn insert_receipt(&self, tx_hash: H256, receipt: TxReceipt) {
        self.state.lock().unwrap().receipts.insert(tx_hash, receipt);
    }
}

impl State {
    fn runtime_for(&self, init_code: &[u8]) -> Bytes {
        self.runtimes
            .iter()
            .find(|(bytecode, _)| init_code.starts_with(bytecode))
            .map(|(_, runtime)| runtime.clone())
            .unwrap_or_else(|| Bytes::from(init_code.to_vec()))
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn code_hash(
        &self,
        address: Address,
    ) -> Result<Option<H256>, ChainError> {
        let state = self.state.lock().unwrap();

        Ok(state.code.get(&address).map(|code| H256(keccak256(code))))
    }

    async fn submit(&self, tx: DeploymentTx) -> Result<H256, ChainError> {
        let mut state = self.state.lock().unwrap();

        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(ChainError::Submission("nonce too low".to_string()));
        }

        let nonce = state.nonces.entry(tx.from).or_default();
        let current = *nonce;
        *nonce += 1;

        let tx_hash = H256(keccak256(
            [tx.from.as_bytes(), current.to_be_bytes().as_slice()].concat(),
        ));

        state.submitted.push(tx.clone());

        if state.unmined {
            return Ok(tx_hash);
        }

        if state.reverting {
            state.receipts.insert(
                tx_hash,
                TxReceipt {
                    success: false,
                    contract_address: None,
                    confirmations: 1,
                },
            );
            return Ok(tx_hash);
        }

        let (address, contract_address, init_code) = match tx.to {
            Some(factory) if factory == CREATE2_FACTORY => {
                let salt = H256::from_slice(&tx.data[..32]);
                let init_code = Bytes::from(tx.data[32..].to_vec());
                (create2_address(salt, &init_code), None, init_code)
            }
            Some(other) => {
                return Err(ChainError::Submission(format!(
                    "Unexpected call to {other:?}"
                )))
            }
            None => {
                let address = get_contract_address(tx.from, current);
                (address, Some(address), tx.data.clone())
            }
        };

        let success = !state.code.contains_key(&address);

        if success {
            let runtime = state.runtime_for(&init_code);
            state.code.insert(address, runtime);
        }

        state.receipts.insert(
            tx_hash,
            TxReceipt {
                success,
                contract_address: contract_address.filter(|_| success),
                confirmations: 1,
            },
        );

        Ok(tx_hash)
    }

    async fn receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).copied())
    }
}
