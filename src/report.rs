use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::deployment::RunContext;
use crate::ledger::DeploymentRecord;
use crate::serde_utils;
use crate::types::{NetworkName, UnitName};
use crate::verification::{JobStatus, VerificationJob};

pub mod contract_deployment;

pub use self::contract_deployment::ContractDeployment;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum UnitOutcome {
    SkippedAlreadyDeployed,
    Deployed,
    Failed,
    /// The run stopped before reaching the unit
    NotAttempted,
    VerificationPending,
    Verified,
    VerificationFailed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitReport {
    pub unit: UnitName,
    pub outcome: UnitOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<ContractDeployment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationJob>,
}

/// What a single run did, unit by unit, in plan order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub network: NetworkName,
    pub chain_id: u64,
    pub run_id: String,
    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Interrupted before every unit was attempted
    #[serde(default)]
    pub cancelled: bool,

    #[serde(default)]
    pub units: Vec<UnitReport>,
}

impl RunReport {
    pub fn new(context: &RunContext) -> Self {
        Self {
            network: context.network().clone(),
            chain_id: context.profile.chain_id,
            run_id: context.ledger.run_id().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            cancelled: false,
            units: vec![],
        }
    }

    fn push(
        &mut self,
        unit: &UnitName,
        outcome: UnitOutcome,
        record: Option<&DeploymentRecord>,
        error: Option<String>,
    ) {
        self.units.push(UnitReport {
            unit: unit.clone(),
            outcome,
            deployment: record.and_then(ContractDeployment::from_record),
            error,
            verification: None,
        });
    }

    pub fn skipped(&mut self, record: &DeploymentRecord) {
        self.push(
            &record.unit,
            UnitOutcome::SkippedAlreadyDeployed,
            Some(record),
            None,
        );
    }

    pub fn deployed(&mut self, record: &DeploymentRecord) {
        self.push(&record.unit, UnitOutcome::Deployed, Some(record), None);
    }

    pub fn failed(&mut self, unit: &UnitName, error: impl ToString) {
        self.push(unit, UnitOutcome::Failed, None, Some(error.to_string()));
    }

    pub fn not_attempted(&mut self, unit: &UnitName) {
        self.push(unit, UnitOutcome::NotAttempted, None, None);
    }

    /// Replaces the `deployed` outcome of the job's unit with the
    /// verification result.
    pub fn verification(&mut self, job: VerificationJob) {
        let Some(report) = self.units.iter_mut().find(|r| r.unit == job.unit)
        else {
            return;
        };

        report.outcome = match job.status {
            JobStatus::Verified => UnitOutcome::Verified,
            JobStatus::Failed => UnitOutcome::VerificationFailed,
            JobStatus::Queued | JobStatus::Submitted => {
                UnitOutcome::VerificationPending
            }
        };
        report.verification = Some(job);
    }

    pub fn outcome(&self, unit: &UnitName) -> Option<UnitOutcome> {
        self.units
            .iter()
            .find(|report| &report.unit == unit)
            .map(|report| report.outcome)
    }

    pub fn has_deployment_failures(&self) -> bool {
        self.units
            .iter()
            .any(|report| report.outcome == UnitOutcome::Failed)
    }

    /// Whether the process should exit successfully.
    pub fn is_success(&self) -> bool {
        !self.has_deployment_failures() && !self.cancelled
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub async fn write(&self, path: impl AsRef<Path>) -> eyre::Result<()> {
        serde_utils::write_serialize(path, self).await
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run {} on {} (chain {})",
            self.run_id, self.network, self.chain_id
        )?;

        let width = self
            .units
            .iter()
            .map(|report| report.unit.len())
            .max()
            .unwrap_or_default();

        for report in &self.units {
            write!(
                f,
                "  {:width$}  {:24}",
                report.unit.as_str(),
                report.outcome.to_string()
            )?;

            if let Some(deployment) = &report.deployment {
                write!(f, "  {:?}", deployment.address)?;
            }

            if let Some(error) = &report.error {
                write!(f, "  {error}")?;
            }

            writeln!(f)?;
        }

        if self.cancelled {
            writeln!(f, "Interrupted, remaining units were not attempted")?;
        }

        Ok(())
    }
}
