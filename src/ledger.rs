//! Durable record of what has been deployed where.
//!
//! The ledger is the only source of truth for idempotence: a unit counts as
//! deployed on a network iff its record is confirmed with a matching
//! bytecode hash. Every mutation is a read-modify-write of the whole
//! document under an exclusive file lock, so two runs sharing a deployment
//! directory never both open a pending record for the same key.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, instrument};

use crate::errors::DeployError;
use crate::types::{NetworkName, UnitName};

pub const LEDGER_PATH: &str = "ledger.yml";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub unit: UnitName,
    pub network: NetworkName,
    pub status: RecordStatus,

    /// Known up front for deterministic units, from the receipt otherwise
    #[serde(default)]
    pub address: Option<Address>,

    pub bytecode_hash: H256,
    pub args_hash: H256,

    #[serde(default)]
    pub tx_hash: Option<H256>,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub deployer: Option<Address>,

    #[serde(default)]
    pub salt: Option<H256>,

    /// Run that owns a pending record
    #[serde(default)]
    pub run_id: Option<String>,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub error: Option<String>,

    /// Records this one superseded, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<DeploymentRecord>,
}

impl DeploymentRecord {
    pub fn is_confirmed(&self) -> bool {
        self.status == RecordStatus::Confirmed
    }
}

/// Inputs of a deployment about to be attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDeployment {
    pub bytecode_hash: H256,
    pub args_hash: H256,
    pub expected_address: Option<Address>,
    pub deployer: Address,
    pub salt: Option<H256>,
}

/// Proof of ownership of a pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    pub unit: UnitName,
    pub network: NetworkName,
    run_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default)]
    pub networks: BTreeMap<NetworkName, BTreeMap<UnitName, DeploymentRecord>>,
}

impl LedgerDocument {
    fn get(
        &self,
        unit: &UnitName,
        network: &NetworkName,
    ) -> Option<&DeploymentRecord> {
        self.networks.get(network).and_then(|units| units.get(unit))
    }

    fn get_mut(
        &mut self,
        unit: &UnitName,
        network: &NetworkName,
    ) -> Option<&mut DeploymentRecord> {
        self.networks
            .get_mut(network)
            .and_then(|units| units.get_mut(unit))
    }

    /// The record a handle points at, provided the handle still owns it.
    fn owned_mut(
        &mut self,
        handle: &RecordHandle,
    ) -> Result<&mut DeploymentRecord, DeployError> {
        let record = self
            .get_mut(&handle.unit, &handle.network)
            .ok_or_else(|| {
                DeployError::Ledger(format!(
                    "No record for {} on {}",
                    handle.unit, handle.network
                ))
            })?;

        if record.run_id.as_deref() != Some(handle.run_id.as_str()) {
            return Err(DeployError::ConflictingPending {
                unit: handle.unit.clone(),
                network: handle.network.clone(),
            });
        }

        Ok(record)
    }
}

#[derive(Debug, Clone)]
enum Storage {
    File { path: PathBuf },
    Memory(Arc<Mutex<LedgerDocument>>),
}

#[derive(Debug, Clone)]
pub struct Ledger {
    storage: Storage,
    run_id: String,
}

impl Ledger {
    /// Opens (or creates on first write) the ledger in `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, DeployError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        Ok(Self {
            storage: Storage::File {
                path: dir.join(LEDGER_PATH),
            },
            run_id: new_run_id(),
        })
    }

    /// A ledger that lives as long as the process, for networks that don't
    /// save deployments.
    pub fn in_memory() -> Self {
        Self {
            storage: Storage::Memory(Default::default()),
            run_id: new_run_id(),
        }
    }

    /// Another handle on the same storage acting as a separate run.
    #[cfg(test)]
    pub fn with_run_id(&self, run_id: impl ToString) -> Self {
        Self {
            storage: self.storage.clone(),
            run_id: run_id.to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::File { path } => Some(path),
            Storage::Memory(_) => None,
        }
    }

    async fn transact<R, F>(&self, f: F) -> Result<R, DeployError>
    where
        F: FnOnce(&mut LedgerDocument) -> Result<R, DeployError>
            + Send
            + 'static,
        R: Send + 'static,
    {
        match &self.storage {
            Storage::Memory(document) => {
                let mut document = document.lock().map_err(|_| {
                    DeployError::Ledger("Ledger lock poisoned".to_string())
                })?;

                f(&mut document)
            }
            Storage::File { path } => {
                let path = path.clone();

                tokio::task::spawn_blocking(move || transact_file(&path, f))
                    .await
                    .map_err(|err| DeployError::Ledger(err.to_string()))?
            }
        }
    }

    /// The confirmed record for a key, if any.
    pub async fn lookup(
        &self,
        unit: &UnitName,
        network: &NetworkName,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        Ok(self
            .record(unit, network)
            .await?
            .filter(DeploymentRecord::is_confirmed))
    }

    /// The record for a key whatever its status.
    pub async fn record(
        &self,
        unit: &UnitName,
        network: &NetworkName,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        let (unit, network) = (unit.clone(), network.clone());

        self.transact(move |document| {
            Ok(document.get(&unit, &network).cloned())
        })
        .await
    }

    pub async fn records(
        &self,
        network: &NetworkName,
    ) -> Result<Vec<DeploymentRecord>, DeployError> {
        let network = network.clone();

        self.transact(move |document| {
            Ok(document
                .networks
                .get(&network)
                .map(|units| units.values().cloned().collect())
                .unwrap_or_default())
        })
        .await
    }

    #[instrument(skip(self, pending), fields(run_id = %self.run_id))]
    pub async fn begin_pending(
        &self,
        unit: &UnitName,
        network: &NetworkName,
        pending: PendingDeployment,
    ) -> Result<RecordHandle, DeployError> {
        let handle = RecordHandle {
            unit: unit.clone(),
            network: network.clone(),
            run_id: self.run_id.clone(),
        };

        let key = handle.clone();

        self.transact(move |document| {
            let units =
                document.networks.entry(key.network.clone()).or_default();

            let mut attempts = 0;
            let mut history = vec![];

            if let Some(existing) = units.get_mut(&key.unit) {
                match existing.status {
                    RecordStatus::Pending
                        if existing.run_id.as_deref()
                            == Some(key.run_id.as_str()) =>
                    {
                        return Ok(());
                    }
                    RecordStatus::Pending => {
                        return Err(DeployError::ConflictingPending {
                            unit: key.unit.clone(),
                            network: key.network.clone(),
                        });
                    }
                    RecordStatus::Confirmed
                        if existing.bytecode_hash == pending.bytecode_hash =>
                    {
                        return Err(DeployError::Ledger(format!(
                            "{} is already confirmed on {}",
                            key.unit, key.network
                        )));
                    }
                    RecordStatus::Confirmed | RecordStatus::Failed => {
                        attempts = existing.attempts;
                        history = std::mem::take(&mut existing.history);
                        history.push(existing.clone());
                    }
                }
            }

            units.insert(
                key.unit.clone(),
                DeploymentRecord {
                    unit: key.unit.clone(),
                    network: key.network.clone(),
                    status: RecordStatus::Pending,
                    address: pending.expected_address,
                    bytecode_hash: pending.bytecode_hash,
                    args_hash: pending.args_hash,
                    tx_hash: None,
                    timestamp: Utc::now(),
                    deployer: Some(pending.deployer),
                    salt: pending.salt,
                    run_id: Some(key.run_id.clone()),
                    attempts: attempts + 1,
                    error: None,
                    history,
                },
            );

            Ok(())
        })
        .await?;

        debug!(%unit, %network, "Opened pending record");

        Ok(handle)
    }

    /// Takes over a pending record left behind by `previous_run`, so this
    /// run can resolve it.
    pub async fn reclaim(
        &self,
        unit: &UnitName,
        network: &NetworkName,
        previous_run: Option<String>,
    ) -> Result<RecordHandle, DeployError> {
        let handle = RecordHandle {
            unit: unit.clone(),
            network: network.clone(),
            run_id: self.run_id.clone(),
        };

        let key = handle.clone();

        self.transact(move |document| {
            let record =
                document.get_mut(&key.unit, &key.network).ok_or_else(|| {
                    DeployError::Ledger(format!(
                        "No record for {} on {}",
                        key.unit, key.network
                    ))
                })?;

            if record.status != RecordStatus::Pending
                || record.run_id != previous_run
            {
                return Err(DeployError::ConflictingPending {
                    unit: key.unit.clone(),
                    network: key.network.clone(),
                });
            }

            record.run_id = Some(key.run_id.clone());

            Ok(())
        })
        .await?;

        Ok(handle)
    }

    /// Remembers the transaction of a pending record so an interrupted run
    /// can be reconciled from chain state.
    pub async fn attach_transaction(
        &self,
        handle: &RecordHandle,
        tx_hash: H256,
    ) -> Result<(), DeployError> {
        let handle = handle.clone();

        self.transact(move |document| {
            let record = document.owned_mut(&handle)?;
            record.tx_hash = Some(tx_hash);
            record.timestamp = Utc::now();
            Ok(())
        })
        .await
    }

    /// Pending → confirmed. Committing the same address twice is a no-op.
    #[instrument(skip(self), fields(unit = %handle.unit))]
    pub async fn commit(
        &self,
        handle: &RecordHandle,
        address: Address,
        tx_hash: Option<H256>,
    ) -> Result<DeploymentRecord, DeployError> {
        let handle = handle.clone();

        self.transact(move |document| {
            if let Some(existing) = document.get(&handle.unit, &handle.network)
            {
                if existing.is_confirmed() {
                    return if existing.address == Some(address) {
                        Ok(existing.clone())
                    } else {
                        Err(DeployError::Ledger(format!(
                            "{} is confirmed at {:?}, refusing {:?}",
                            handle.unit, existing.address, address
                        )))
                    };
                }
            }

            let record = document.owned_mut(&handle)?;

            if record.status != RecordStatus::Pending {
                return Err(DeployError::Ledger(format!(
                    "Can't confirm {} from {}",
                    handle.unit, record.status
                )));
            }

            record.status = RecordStatus::Confirmed;
            record.address = Some(address);
            record.tx_hash = tx_hash.or(record.tx_hash);
            record.timestamp = Utc::now();
            record.run_id = None;
            record.error = None;

            Ok(record.clone())
        })
        .await
    }

    /// Pending → failed. The key can be retried by a later run.
    #[instrument(skip(self), fields(unit = %handle.unit))]
    pub async fn fail(
        &self,
        handle: &RecordHandle,
        reason: &str,
    ) -> Result<(), DeployError> {
        let handle = handle.clone();
        let reason = reason.to_string();

        self.transact(move |document| {
            if let Some(existing) = document.get(&handle.unit, &handle.network)
            {
                if existing.status == RecordStatus::Failed {
                    return Ok(());
                }
            }

            let record = document.owned_mut(&handle)?;

            if record.status != RecordStatus::Pending {
                return Err(DeployError::Ledger(format!(
                    "Can't fail {} from {}",
                    handle.unit, record.status
                )));
            }

            record.status = RecordStatus::Failed;
            record.timestamp = Utc::now();
            record.run_id = None;
            record.error = Some(reason);

            Ok(())
        })
        .await
    }
}

fn new_run_id() -> String {
    format!("{}-{}", std::process::id(), Utc::now().timestamp_micros())
}

fn transact_file<R>(
    path: &Path,
    f: impl FnOnce(&mut LedgerDocument) -> Result<R, DeployError>,
) -> Result<R, DeployError> {
    let lock_path = path.with_extension("yml.lock");
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;

    // Released when `lock` is dropped
    fs2::FileExt::lock_exclusive(&lock)?;

    let mut document = read_document(path)?;
    let before = document.clone();

    let result = f(&mut document)?;

    if document != before {
        write_document(path, &document)?;
    }

    Ok(result)
}

fn read_document(path: &Path) -> Result<LedgerDocument, DeployError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LedgerDocument::default());
        }
        Err(err) => return Err(err.into()),
    };

    serde_yaml::from_str(&content).map_err(|err| {
        DeployError::Ledger(format!("Parsing {}: {err}", path.display()))
    })
}

/// Writes next to the target and renames over it, so readers never see a
/// partial document.
fn write_document(
    path: &Path,
    document: &LedgerDocument,
) -> Result<(), DeployError> {
    let content = serde_yaml::to_string(document)
        .map_err(|err| DeployError::Ledger(err.to_string()))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;

    file.write_all(content.as_bytes())?;
    file.as_file().sync_all()?;

    file.persist(path).map_err(|err| DeployError::from(err.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    fn pending(bytecode: u64) -> PendingDeployment {
        PendingDeployment {
            bytecode_hash: H256::from_low_u64_be(bytecode),
            args_hash: H256::zero(),
            expected_address: Some(test_utils::address(0xaa)),
            deployer: test_utils::address(0xde),
            salt: Some(H256::from_low_u64_be(7)),
        }
    }

    fn key() -> (UnitName, NetworkName) {
        ("MockToken".into(), "TestNet".into())
    }

    #[tokio::test]
    async fn pending_commit_lookup() -> eyre::Result<()> {
        let ledger = Ledger::in_memory();
        let (unit, network) = key();

        assert!(ledger.lookup(&unit, &network).await?.is_none());

        let handle = ledger.begin_pending(&unit, &network, pending(1)).await?;
        assert!(ledger.lookup(&unit, &network).await?.is_none());
        assert_eq!(
            ledger.record(&unit, &network).await?.map(|r| r.status),
            Some(RecordStatus::Pending)
        );

        let tx = H256::from_low_u64_be(99);
        let address = test_utils::address(0xaa);
        let record = ledger.commit(&handle, address, Some(tx)).await?;

        assert_eq!(record.status, RecordStatus::Confirmed);
        assert_eq!(record.tx_hash, Some(tx));
        assert_eq!(record.run_id, None);
        assert_eq!(ledger.lookup(&unit, &network).await?, Some(record.clone()));

        // Idempotent for the same address, refused for another
        assert_eq!(ledger.commit(&handle, address, Some(tx)).await?, record);
        assert!(ledger
            .commit(&handle, test_utils::address(0xbb), Some(tx))
            .await
            .is_err());

        Ok(())
    }

    #[tokio::test]
    async fn concurrent_runs_conflict() -> eyre::Result<()> {
        let first = Ledger::in_memory();
        let second = first.with_run_id("other-run");
        let (unit, network) = key();

        let handle = first.begin_pending(&unit, &network, pending(1)).await?;

        let err = second
            .begin_pending(&unit, &network, pending(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ConflictingPending { .. }));

        // The same run may re-open its own record
        assert_eq!(
            first.begin_pending(&unit, &network, pending(1)).await?,
            handle
        );

        // Only the owner can resolve it
        assert!(second
            .commit(
                &RecordHandle {
                    run_id: "other-run".to_string(),
                    ..handle.clone()
                },
                test_utils::address(0xaa),
                None
            )
            .await
            .is_err());

        Ok(())
    }

    #[tokio::test]
    async fn failed_keys_can_be_retried() -> eyre::Result<()> {
        let ledger = Ledger::in_memory();
        let (unit, network) = key();

        let handle = ledger.begin_pending(&unit, &network, pending(1)).await?;
        ledger.fail(&handle, "out of gas").await?;
        ledger.fail(&handle, "out of gas").await?;

        let failed = ledger.record(&unit, &network).await?.unwrap();
        assert_eq!(failed.status, RecordStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("out of gas"));

        let retry = ledger
            .with_run_id("next-run")
            .begin_pending(&unit, &network, pending(1))
            .await?;
        assert_eq!(retry.run_id, "next-run");

        let record = ledger.record(&unit, &network).await?.unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].status, RecordStatus::Failed);

        Ok(())
    }

    #[tokio::test]
    async fn reclaim_stale_pending() -> eyre::Result<()> {
        let crashed = Ledger::in_memory().with_run_id("crashed");
        let (unit, network) = key();

        crashed.begin_pending(&unit, &network, pending(1)).await?;

        let next = crashed.with_run_id("next");
        assert!(next.reclaim(&unit, &network, None).await.is_err());

        let handle = next
            .reclaim(&unit, &network, Some("crashed".to_string()))
            .await?;
        next.fail(&handle, "abandoned").await?;

        assert_eq!(
            next.record(&unit, &network).await?.map(|r| r.status),
            Some(RecordStatus::Failed)
        );

        Ok(())
    }

    #[tokio::test]
    async fn survives_reopen() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let (unit, network) = key();

        {
            let ledger = Ledger::open(dir.path()).await?;
            let handle =
                ledger.begin_pending(&unit, &network, pending(1)).await?;
            ledger
                .attach_transaction(&handle, H256::from_low_u64_be(5))
                .await?;
            ledger
                .commit(&handle, test_utils::address(0xaa), None)
                .await?;
        }

        let reopened = Ledger::open(dir.path()).await?;
        let record = reopened.lookup(&unit, &network).await?.unwrap();

        assert_eq!(record.address, Some(test_utils::address(0xaa)));
        assert_eq!(record.tx_hash, Some(H256::from_low_u64_be(5)));
        assert_eq!(reopened.records(&network).await?.len(), 1);
        assert!(dir.path().join(LEDGER_PATH).exists());

        Ok(())
    }

    #[tokio::test]
    async fn file_ledger_guards_pending_across_handles() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let (unit, network) = key();

        let first = Ledger::open(dir.path()).await?;
        let second = Ledger::open(dir.path()).await?.with_run_id("second");

        first.begin_pending(&unit, &network, pending(1)).await?;

        let err = second
            .begin_pending(&unit, &network, pending(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ConflictingPending { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn changed_bytecode_supersedes_confirmed() -> eyre::Result<()> {
        let ledger = Ledger::in_memory();
        let (unit, network) = key();

        let handle = ledger.begin_pending(&unit, &network, pending(1)).await?;
        ledger
            .commit(&handle, test_utils::address(0xaa), None)
            .await?;

        assert!(ledger
            .begin_pending(&unit, &network, pending(1))
            .await
            .is_err());

        ledger.begin_pending(&unit, &network, pending(2)).await?;
        let record = ledger.record(&unit, &network).await?.unwrap();

        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.history[0].status, RecordStatus::Confirmed);

        Ok(())
    }
}
