use std::time::Duration;

use ethers::types::{Address, H256};
use thiserror::Error;

use crate::types::{NetworkName, RoleName, UnitName};

/// Errors raised by the deployment core.
///
/// Planning errors (`UnknownNetwork`, `UnresolvedAccount`,
/// `CyclicDependency`, `UnknownDependency`) abort a run before any
/// transaction is sent. Everything else is scoped to a single unit.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Unknown network {name}, configured networks are: {known}")]
    UnknownNetwork { name: NetworkName, known: String },

    #[error("Role {role} has no account on network {network}")]
    UnresolvedAccount { role: RoleName, network: NetworkName },

    #[error("Cyclic dependency between units: {}", join(.0))]
    CyclicDependency(Vec<UnitName>),

    #[error(
        "Unit {unit} depends on {dependency} which is neither requested nor deployed"
    )]
    UnknownDependency {
        unit: UnitName,
        dependency: UnitName,
    },

    #[error("Invalid constructor argument for {unit}: {reason}")]
    InvalidArgument { unit: UnitName, reason: String },

    #[error("Unit {unit} already has a pending deployment on {network}")]
    ConflictingPending { unit: UnitName, network: NetworkName },

    #[error(
        "Address {address:?} for unit {unit} already holds code with hash {found:?}"
    )]
    AddressCollision {
        unit: UnitName,
        address: Address,
        found: H256,
    },

    #[error("Deployment of {unit} failed: {reason}")]
    SubmissionFailed { unit: UnitName, reason: String },

    /// The transaction stays pending in the ledger until a later run
    /// finds its receipt or it goes stale
    #[error(
        "Timed out after {waited:?} waiting for {unit} to confirm, left pending"
    )]
    Timeout { unit: UnitName, waited: Duration },

    #[error("Deployment transaction {tx_hash:?} for {unit} reverted")]
    TransactionReverted { unit: UnitName, tx_hash: H256 },

    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl DeployError {
    /// Errors raised before the first transaction of a run.
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            Self::UnknownNetwork { .. }
                | Self::UnresolvedAccount { .. }
                | Self::CyclicDependency(_)
                | Self::UnknownDependency { .. }
                | Self::InvalidArgument { .. }
        )
    }
}

impl From<std::io::Error> for DeployError {
    fn from(err: std::io::Error) -> Self {
        Self::Ledger(err.to_string())
    }
}

/// Errors surfaced by the chain submission collaborator.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// Possibly transient, worth sending again
    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Timed out")]
    Timeout,

    #[error("Rpc error: {0}")]
    Rpc(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Submission(_) | Self::Timeout)
    }
}

/// Errors surfaced by explorer services. Never fatal to a run.
#[derive(Debug, Clone, Error)]
pub enum VerificationError {
    #[error("Rate limited")]
    RateLimited,

    #[error("Verification rejected: {0}")]
    Rejected(String),

    #[error("Explorer request failed: {0}")]
    Transport(String),
}

fn join(names: &[UnitName]) -> String {
    names
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
