use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use chrono::Utc;
use ethers::types::{Address, Bytes, H256};
use strum::Display;
use tracing::{info, instrument, warn};

use super::unit::{DeployableUnit, ResolvedArgs};
use super::RunContext;
use crate::chain::{
    create2_address, create2_calldata, ChainClient, DeploymentTx, TxReceipt,
    CREATE2_FACTORY,
};
use crate::errors::{ChainError, DeployError};
use crate::ledger::{
    DeploymentRecord, PendingDeployment, RecordHandle, RecordStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeployAction {
    /// Confirmed by an earlier run, nothing sent
    AlreadyDeployed,
    /// Matching code was already at the deterministic address
    Adopted,
    /// A transaction from an interrupted run turned out to be mined
    Recovered,
    Deployed,
}

impl DeployAction {
    /// Whether the unit became confirmed during this run.
    pub fn is_new(&self) -> bool {
        !matches!(self, Self::AlreadyDeployed)
    }
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub record: DeploymentRecord,
    pub action: DeployAction,
}

pub struct Deployer {
    chain: Arc<dyn ChainClient>,
}

impl Deployer {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }

    /// Deploys `unit` with already bound arguments unless the ledger or
    /// the chain shows it is already there.
    ///
    /// Deterministic units go through the CREATE2 factory, so the address
    /// is known before anything is sent and a second run with the same
    /// inputs never sends a second transaction.
    ///
    /// Code already at that address is adopted when it hashes to the
    /// unit's runtime bytecode, or when the ledger holds a mined
    /// transaction of an earlier attempt targeting it. Runtime code with
    /// immutables only qualifies the second way, so without a ledger entry
    /// it is reported as a collision.
    #[instrument(
        name = "deploy",
        skip_all,
        fields(unit = %unit.name, network = %context.network())
    )]
    pub async fn deploy(
        &self,
        context: &RunContext,
        unit: &DeployableUnit,
        args: &ResolvedArgs,
    ) -> Result<DeployOutcome, DeployError> {
        let ledger = &context.ledger;
        let network = context.network();

        if let Some(record) = ledger.lookup(&unit.name, network).await? {
            if record.bytecode_hash == unit.bytecode_hash() {
                info!(address = ?record.address, "Already deployed");

                return Ok(DeployOutcome {
                    record,
                    action: DeployAction::AlreadyDeployed,
                });
            }
        }

        if let Some(record) = ledger.record(&unit.name, network).await? {
            let ours = record.run_id.as_deref() == Some(ledger.run_id());

            if record.status == RecordStatus::Pending
                && (!ours || record.tx_hash.is_some())
            {
                if let Some(outcome) =
                    self.reconcile(context, unit, record).await?
                {
                    return Ok(outcome);
                }
            }
        }

        let init_code = args.init_code(&unit.bytecode);
        let salt = unit.salt(context.deployer, args);
        let expected = salt.map(|salt| create2_address(salt, &init_code));

        let pending = PendingDeployment {
            bytecode_hash: unit.bytecode_hash(),
            args_hash: args.hash(),
            expected_address: expected,
            deployer: context.deployer,
            salt,
        };

        if let Some(address) = expected {
            if let Some(found) = self.code_hash(unit, address).await? {
                let tx_hash = if unit.runtime_code_hash() == Some(found) {
                    None
                } else {
                    // Code with immutables never matches the artifact's
                    // runtime code, only our own mined transaction proves it
                    let Some(tx_hash) =
                        self.mined_by_earlier_run(context, unit, address).await?
                    else {
                        return Err(DeployError::AddressCollision {
                            unit: unit.name.clone(),
                            address,
                            found,
                        });
                    };

                    Some(tx_hash)
                };

                info!(?address, ?tx_hash, "Code already deployed, adopting it");

                let handle =
                    ledger.begin_pending(&unit.name, network, pending).await?;
                let record = ledger.commit(&handle, address, tx_hash).await?;

                return Ok(DeployOutcome {
                    record,
                    action: DeployAction::Adopted,
                });
            }
        }

        let handle = ledger.begin_pending(&unit.name, network, pending).await?;

        let tx = DeploymentTx {
            from: context.deployer,
            to: expected.map(|_| CREATE2_FACTORY),
            data: match salt {
                Some(salt) => create2_calldata(salt, &init_code),
                None => init_code,
            },
            gas: context.profile.gas.clone(),
        };

        match self.execute(context, unit, &handle, tx, expected).await {
            Ok(record) => Ok(DeployOutcome {
                record,
                action: DeployAction::Deployed,
            }),
            Err(err @ DeployError::Timeout { .. }) => {
                // The transaction may still be mined, the next run
                // reconciles it from its receipt
                warn!(%err, "Leaving the deployment pending");

                Err(err)
            }
            Err(err) => {
                if let Err(ledger_err) =
                    ledger.fail(&handle, &err.to_string()).await
                {
                    warn!(%ledger_err, "Failed to record the failure");
                }

                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        context: &RunContext,
        unit: &DeployableUnit,
        handle: &RecordHandle,
        tx: DeploymentTx,
        expected: Option<Address>,
    ) -> Result<DeploymentRecord, DeployError> {
        let tx_hash = self.submit(context, unit, tx).await?;

        context.ledger.attach_transaction(handle, tx_hash).await?;
        info!(?tx_hash, "Submitted deployment");

        let receipt = self.await_receipt(context, unit, tx_hash).await?;

        if !receipt.success {
            return Err(DeployError::TransactionReverted {
                unit: unit.name.clone(),
                tx_hash,
            });
        }

        let address = expected.or(receipt.contract_address).ok_or_else(|| {
            DeployError::SubmissionFailed {
                unit: unit.name.clone(),
                reason: format!("Receipt of {tx_hash:?} has no address"),
            }
        })?;

        // The factory doesn't revert when the inner CREATE2 fails
        if expected.is_some() && self.code_hash(unit, address).await?.is_none()
        {
            return Err(DeployError::SubmissionFailed {
                unit: unit.name.clone(),
                reason: format!("No code at {address:?} after {tx_hash:?}"),
            });
        }

        let record = context
            .ledger
            .commit(handle, address, Some(tx_hash))
            .await?;

        info!(?address, "Deployed");

        Ok(record)
    }

    /// Sends the transaction, retrying transient failures with exponential
    /// backoff.
    async fn submit(
        &self,
        context: &RunContext,
        unit: &DeployableUnit,
        tx: DeploymentTx,
    ) -> Result<H256, DeployError> {
        (|| self.chain.submit(tx.clone()))
            .retry(context.settings.retry.backoff())
            .when(ChainError::is_transient)
            .notify(|err: &ChainError, delay: Duration| {
                warn!(%err, ?delay, "Retrying submission");
            })
            .await
            .map_err(|err| DeployError::SubmissionFailed {
                unit: unit.name.clone(),
                reason: err.to_string(),
            })
    }

    /// Waits for the configured confirmations. A timed out wait is retried
    /// with backoff, the transaction is never sent again.
    async fn await_receipt(
        &self,
        context: &RunContext,
        unit: &DeployableUnit,
        tx_hash: H256,
    ) -> Result<TxReceipt, DeployError> {
        let timeout = context.settings.confirmation_timeout();
        let confirmations = context.confirmations();
        let poll_interval = context.settings.poll_interval();

        let wait = move || async move {
            tokio::time::timeout(
                timeout,
                self.poll_receipt(tx_hash, confirmations, poll_interval),
            )
            .await
            .map_err(|_| ChainError::Timeout)
        };

        wait.retry(context.settings.retry.backoff())
            .when(|err: &ChainError| matches!(err, ChainError::Timeout))
            .notify(|_: &ChainError, delay: Duration| {
                warn!(?tx_hash, ?delay, "Still not confirmed, waiting again");
            })
            .await
            .map_err(|_| DeployError::Timeout {
                unit: unit.name.clone(),
                waited: timeout * context.settings.retry.max_attempts as u32,
            })
    }

    async fn poll_receipt(
        &self,
        tx_hash: H256,
        confirmations: usize,
        poll_interval: Duration,
    ) -> TxReceipt {
        loop {
            match self.chain.receipt(tx_hash).await {
                Ok(Some(receipt))
                    if !receipt.success
                        || receipt.confirmations >= confirmations =>
                {
                    return receipt;
                }
                Ok(_) => {}
                Err(err) => warn!(%err, ?tx_hash, "Polling receipt failed"),
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn code_hash(
        &self,
        unit: &DeployableUnit,
        address: Address,
    ) -> Result<Option<H256>, DeployError> {
        self.chain.code_hash(address).await.map_err(|err| {
            DeployError::SubmissionFailed {
                unit: unit.name.clone(),
                reason: format!("Reading code at {address:?}: {err}"),
            }
        })
    }

    async fn receipt(
        &self,
        unit: &DeployableUnit,
        tx_hash: H256,
    ) -> Result<Option<TxReceipt>, DeployError> {
        self.chain.receipt(tx_hash).await.map_err(|err| {
            DeployError::SubmissionFailed {
                unit: unit.name.clone(),
                reason: format!("Reading receipt of {tx_hash:?}: {err}"),
            }
        })
    }

    /// The transaction of an earlier attempt at this unit that was mined
    /// successfully and targeted `address`, if the ledger knows one.
    async fn mined_by_earlier_run(
        &self,
        context: &RunContext,
        unit: &DeployableUnit,
        address: Address,
    ) -> Result<Option<H256>, DeployError> {
        let Some(record) =
            context.ledger.record(&unit.name, context.network()).await?
        else {
            return Ok(None);
        };

        let candidate = match record.tx_hash {
            Some(tx_hash)
                if record.address == Some(address)
                    && record.bytecode_hash == unit.bytecode_hash() =>
            {
                tx_hash
            }
            _ => return Ok(None),
        };

        let mined = self
            .receipt(unit, candidate)
            .await?
            .is_some_and(|receipt| receipt.success);

        Ok(mined.then_some(candidate))
    }

    /// Resolves a pending record another run left behind, or one of this
    /// run whose confirmation timed out.
    ///
    /// Returns the outcome if the earlier transaction deployed this exact
    /// unit, none if the key is free to deploy again.
    async fn reconcile(
        &self,
        context: &RunContext,
        unit: &DeployableUnit,
        record: DeploymentRecord,
    ) -> Result<Option<DeployOutcome>, DeployError> {
        let ledger = &context.ledger;
        let network = context.network();

        let conflict = || DeployError::ConflictingPending {
            unit: unit.name.clone(),
            network: network.clone(),
        };

        let age = Utc::now()
            .signed_duration_since(record.timestamp)
            .to_std()
            .unwrap_or_default();
        let is_stale = age >= context.settings.stale_pending();

        let receipt = match record.tx_hash {
            Some(tx_hash) => self.receipt(unit, tx_hash).await?,
            None => None,
        };

        let reason = match (record.tx_hash, receipt) {
            (Some(tx_hash), Some(receipt))
                if receipt.success
                    && receipt.confirmations >= context.confirmations() =>
            {
                let address = record
                    .address
                    .or(receipt.contract_address)
                    .ok_or_else(conflict)?;

                // The factory doesn't revert when the inner CREATE2 fails
                if self.code_hash(unit, address).await?.is_some() {
                    let handle = ledger
                        .reclaim(&unit.name, network, record.run_id.clone())
                        .await?;
                    let confirmed =
                        ledger.commit(&handle, address, Some(tx_hash)).await?;

                    info!(
                        ?address,
                        ?tx_hash,
                        "Recovered interrupted deployment"
                    );

                    if confirmed.bytecode_hash != unit.bytecode_hash() {
                        return Ok(None);
                    }

                    return Ok(Some(DeployOutcome {
                        record: confirmed,
                        action: DeployAction::Recovered,
                    }));
                }

                "Transaction of an interrupted run left no code"
            }
            (Some(_), Some(receipt)) if !receipt.success => {
                "Transaction of an interrupted run reverted"
            }
            (Some(_), _) if is_stale => "Transaction was never confirmed",
            (None, _) if is_stale => "Abandoned before submission",
            _ => return Err(conflict()),
        };

        warn!(run_id = ?record.run_id, reason, "Failing pending record");

        let handle = ledger
            .reclaim(&unit.name, network, record.run_id.clone())
            .await?;
        ledger.fail(&handle, reason).await?;

        Ok(None)
    }
}
