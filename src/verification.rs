//! Source verification against block explorers.
//!
//! Verification runs after deployment and can't fail a run: every outcome,
//! including explorer errors, ends up in the returned jobs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use ethers::types::{Address, Bytes};
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{info, instrument, warn};

use crate::config::{CompilerSettings, VerificationSettings};
use crate::deployment::unit::{DeployableUnit, ResolvedArgs};
use crate::deployment::RunContext;
use crate::errors::VerificationError;
use crate::ledger::DeploymentRecord;
use crate::network::{ExplorerKind, NetworkProfile};
use crate::types::{NetworkName, UnitName};

pub mod etherscan;
pub mod sourcify;

pub use self::etherscan::Etherscan;
pub use self::sourcify::Sourcify;

/// What an explorer said about a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplorerResponse {
    Verified,
    AlreadyVerified,
    /// Accepted for asynchronous processing, poll with the receipt
    Pending(String),
    RateLimited,
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub chain_id: u64,
    pub address: Address,
    /// Fully qualified when configured, the artifact name otherwise
    pub contract_name: String,
    /// Standard json input
    pub source: Option<String>,
    pub constructor_args: Bytes,
    pub compiler: CompilerSettings,
}

#[async_trait]
pub trait Explorer: Send + Sync {
    fn name(&self) -> String;

    async fn submit(
        &self,
        request: &VerificationRequest,
    ) -> Result<ExplorerResponse, VerificationError>;

    /// Status of an earlier `Pending` submission.
    async fn check(
        &self,
        receipt: &str,
    ) -> Result<ExplorerResponse, VerificationError> {
        Ok(ExplorerResponse::Rejected(format!(
            "{} can't look up submission {receipt}",
            self.name()
        )))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    /// Accepted but not confirmed verified yet
    Submitted,
    Verified,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerResult {
    pub explorer: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExplorerResult {
    fn new(explorer: &dyn Explorer, status: JobStatus) -> Self {
        Self {
            explorer: explorer.name(),
            status,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl ToString) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationJob {
    pub unit: UnitName,
    pub network: NetworkName,
    pub address: Option<Address>,
    #[serde(default)]
    pub source: Option<PathBuf>,
    pub constructor_args: Bytes,
    pub attempts: u32,
    pub status: JobStatus,
    #[serde(default)]
    pub explorers: Vec<ExplorerResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationJob {
    fn new(
        unit: &DeployableUnit,
        record: &DeploymentRecord,
        args: &ResolvedArgs,
    ) -> Self {
        Self {
            unit: unit.name.clone(),
            network: record.network.clone(),
            address: record.address,
            source: unit.source.clone(),
            constructor_args: args.encoded.clone(),
            attempts: 0,
            status: JobStatus::Queued,
            explorers: vec![],
            error: None,
        }
    }

    fn failed(mut self, error: impl ToString) -> Self {
        self.status = JobStatus::Failed;
        self.error = Some(error.to_string());
        self
    }

    /// Failed if any explorer failed, submitted if any is still working
    /// on it.
    fn settle(&mut self) {
        let any = |status: JobStatus| {
            self.explorers.iter().any(|result| result.status == status)
        };

        self.status = if any(JobStatus::Failed) {
            JobStatus::Failed
        } else if any(JobStatus::Submitted) || any(JobStatus::Queued) {
            JobStatus::Submitted
        } else {
            JobStatus::Verified
        };
    }
}

pub struct VerificationSubmitter {
    explorers: Vec<Arc<dyn Explorer>>,
    settings: VerificationSettings,
    compiler: CompilerSettings,
}

impl VerificationSubmitter {
    pub fn new(
        explorers: Vec<Arc<dyn Explorer>>,
        settings: VerificationSettings,
        compiler: CompilerSettings,
    ) -> Self {
        Self {
            explorers,
            settings,
            compiler,
        }
    }

    /// One explorer client per endpoint configured for the network.
    pub fn for_network(
        profile: &NetworkProfile,
        settings: VerificationSettings,
        compiler: CompilerSettings,
        client: reqwest::Client,
    ) -> Self {
        let explorers = profile
            .explorers
            .iter()
            .map(|endpoint| -> Arc<dyn Explorer> {
                match endpoint.kind {
                    ExplorerKind::Etherscan => Arc::new(Etherscan::new(
                        client.clone(),
                        endpoint.api_url.clone(),
                        endpoint.resolve_api_key(),
                        profile.chain_id,
                    )),
                    ExplorerKind::Sourcify => Arc::new(Sourcify::new(
                        client.clone(),
                        endpoint.api_url.clone(),
                    )),
                }
            })
            .collect();

        Self::new(explorers, settings, compiler)
    }

    pub fn has_explorers(&self) -> bool {
        !self.explorers.is_empty()
    }

    /// Verifies every unit deployed in this run, concurrently.
    pub async fn submit_all(
        &self,
        context: &RunContext,
        deployed: &[(DeployableUnit, DeploymentRecord, ResolvedArgs)],
    ) -> Vec<VerificationJob> {
        let jobs = deployed
            .iter()
            .map(|(unit, record, args)| {
                self.submit(context, unit, record, args)
            });

        futures::future::join_all(jobs).await
    }

    #[instrument(name = "verify", skip_all, fields(unit = %unit.name))]
    pub async fn submit(
        &self,
        context: &RunContext,
        unit: &DeployableUnit,
        record: &DeploymentRecord,
        args: &ResolvedArgs,
    ) -> VerificationJob {
        let mut job = VerificationJob::new(unit, record, args);

        let Some(address) = record.address else {
            return job.failed("Deployment record has no address");
        };

        let source = match &unit.source {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(source) => Some(source),
                Err(err) => {
                    return job.failed(format!(
                        "Reading {}: {err}",
                        path.display()
                    ))
                }
            },
            None => None,
        };

        let request = VerificationRequest {
            chain_id: context.profile.chain_id,
            address,
            contract_name: unit
                .qualified_name
                .clone()
                .unwrap_or_else(|| unit.contract.clone()),
            source,
            constructor_args: args.encoded.clone(),
            compiler: self.compiler.clone(),
        };

        for explorer in &self.explorers {
            let (result, attempts) =
                self.verify_with(explorer.as_ref(), &request).await;

            job.attempts += attempts;
            job.explorers.push(result);
        }

        job.settle();

        match job.status {
            JobStatus::Verified => info!(?address, "Verified"),
            JobStatus::Failed => {
                warn!(?address, results = ?job.explorers, "Verification failed")
            }
            _ => info!(?address, "Verification pending"),
        }

        job
    }

    async fn verify_with(
        &self,
        explorer: &dyn Explorer,
        request: &VerificationRequest,
    ) -> (ExplorerResult, u32) {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let submit = move || {
            counter.fetch_add(1, Ordering::Relaxed);

            async move {
                match explorer.submit(request).await {
                    Ok(ExplorerResponse::RateLimited) => {
                        Err(VerificationError::RateLimited)
                    }
                    other => other,
                }
            }
        };

        let response = submit
            .retry(self.settings.retry.backoff())
            .when(|err: &VerificationError| {
                matches!(
                    err,
                    VerificationError::RateLimited
                        | VerificationError::Transport(_)
                )
            })
            .notify(|err: &VerificationError, delay: Duration| {
                warn!(explorer = %explorer.name(), %err, ?delay, "Retrying");
            })
            .await;

        let attempts = attempts.load(Ordering::Relaxed);

        let result = match response {
            Ok(ExplorerResponse::Verified) => {
                ExplorerResult::new(explorer, JobStatus::Verified)
            }
            Ok(ExplorerResponse::AlreadyVerified) => {
                ExplorerResult::new(explorer, JobStatus::Verified)
                    .with_detail("Already verified")
            }
            Ok(ExplorerResponse::Pending(receipt)) => {
                self.poll_status(explorer, &receipt).await
            }
            Ok(ExplorerResponse::Rejected(reason))
            | Err(VerificationError::Rejected(reason)) => {
                ExplorerResult::new(explorer, JobStatus::Failed)
                    .with_detail(reason)
            }
            Ok(ExplorerResponse::RateLimited)
            | Err(VerificationError::RateLimited) => {
                ExplorerResult::new(explorer, JobStatus::Failed).with_detail(
                    format!("Still rate limited after {attempts} attempts"),
                )
            }
            Err(VerificationError::Transport(err)) => {
                ExplorerResult::new(explorer, JobStatus::Failed)
                    .with_detail(err)
            }
        };

        (result, attempts)
    }

    async fn poll_status(
        &self,
        explorer: &dyn Explorer,
        receipt: &str,
    ) -> ExplorerResult {
        for _ in 0..self.settings.status_polls {
            tokio::time::sleep(self.settings.status_poll_interval()).await;

            match explorer.check(receipt).await {
                Ok(ExplorerResponse::Verified)
                | Ok(ExplorerResponse::AlreadyVerified) => {
                    return ExplorerResult::new(explorer, JobStatus::Verified);
                }
                Ok(ExplorerResponse::Rejected(reason))
                | Err(VerificationError::Rejected(reason)) => {
                    return ExplorerResult::new(explorer, JobStatus::Failed)
                        .with_detail(reason);
                }
                Ok(_) | Err(_) => {}
            }
        }

        ExplorerResult::new(explorer, JobStatus::Submitted)
            .with_detail(format!("Submission {receipt} still pending"))
    }
}

#[cfg(test)]
pub mod mock {
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    use super::*;

    /// Answers by contract name: rate limited forever, a scripted sequence
    /// of responses, or verified.
    #[derive(Default)]
    pub struct MockExplorer {
        pub rate_limited: HashSet<String>,
        pub scripted: Mutex<HashMap<String, VecDeque<ExplorerResponse>>>,
        pub statuses: Mutex<VecDeque<ExplorerResponse>>,
        pub calls: Mutex<HashMap<String, u32>>,
    }

    impl MockExplorer {
        pub fn calls(&self, contract: &str) -> u32 {
            self.calls
                .lock()
                .unwrap()
                .get(contract)
                .copied()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Explorer for MockExplorer {
        fn name(&self) -> String {
            "mock".to_string()
        }

        async fn submit(
            &self,
            request: &VerificationRequest,
        ) -> Result<ExplorerResponse, VerificationError> {
            let name = request.contract_name.clone();
            *self.calls.lock().unwrap().entry(name.clone()).or_default() += 1;

            if self.rate_limited.contains(&name) {
                return Ok(ExplorerResponse::RateLimited);
            }

            let scripted = self
                .scripted
                .lock()
                .unwrap()
                .get_mut(&name)
                .and_then(VecDeque::pop_front);

            Ok(scripted.unwrap_or(ExplorerResponse::Verified))
        }

        async fn check(
            &self,
            _receipt: &str,
        ) -> Result<ExplorerResponse, VerificationError> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ExplorerResponse::Pending(String::new())))
        }
    }
}
