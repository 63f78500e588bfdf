use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use backon::ExponentialBuilder;
use clap::ValueEnum;
use eyre::ensure;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::accounts::RoleConfig;
use crate::artifacts::ArtifactsConfig;
use crate::deployment::unit::{ArgSource, SaltPolicy};
use crate::network::NetworkProfile;
use crate::serde_utils;
use crate::types::{NetworkName, RoleName, UnitName};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub networks: BTreeMap<NetworkName, NetworkProfile>,

    #[serde(default)]
    pub roles: BTreeMap<RoleName, RoleConfig>,

    /// Units in declaration order
    pub units: Vec<UnitConfig>,

    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    #[serde(default)]
    pub compiler: CompilerSettings,

    #[serde(default)]
    pub deployment: DeploymentSettings,

    #[serde(default)]
    pub verification: VerificationSettings,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let config: Self = serde_utils::read_deserialize(path).await?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        let mut seen = HashSet::new();

        for unit in &self.units {
            ensure!(
                seen.insert(&unit.name),
                "Unit {} is declared more than once",
                unit.name
            );
        }

        ensure!(
            self.deployment.retry.max_attempts > 0,
            "deployment.retry.max_attempts must be at least 1"
        );
        ensure!(
            self.verification.retry.max_attempts > 0,
            "verification.retry.max_attempts must be at least 1"
        );

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    pub name: UnitName,

    /// Artifact name, defaults to the unit name
    #[serde(default)]
    pub contract: Option<String>,

    #[serde(default)]
    pub args: Vec<ArgSource>,

    /// Dependencies beyond the ones referenced from `args`
    #[serde(default)]
    pub depends_on: Vec<UnitName>,

    #[serde(default)]
    pub salt: SaltPolicy,

    /// Standard json input used for source verification
    #[serde(default)]
    pub source: Option<PathBuf>,

    /// Fully qualified name, e.g. `contracts/Booking.sol:Booking`
    #[serde(default)]
    pub qualified_name: Option<String>,

    #[serde(default = "default_true")]
    pub verify: bool,
}

impl UnitConfig {
    pub fn contract_name(&self) -> &str {
        self.contract.as_deref().unwrap_or(self.name.as_str())
    }
}

fn default_true() -> bool {
    true
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    ValueEnum,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop at the first failed unit
    #[default]
    Halt,
    /// Keep deploying units that don't depend on a failed one
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts, including the first one
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_factor(self.factor)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSettings {
    pub deployer_role: RoleName,
    pub confirmations: usize,
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub retry: RetrySettings,
    /// Pending records without a transaction older than this are
    /// considered abandoned
    pub stale_pending_secs: u64,
    pub failure_policy: FailurePolicy,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            deployer_role: RoleName::from("deployer"),
            confirmations: 1,
            confirmation_timeout_secs: 120,
            poll_interval_ms: 2_000,
            retry: RetrySettings::default(),
            stale_pending_secs: 600,
            failure_policy: FailurePolicy::Halt,
        }
    }
}

impl DeploymentSettings {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_pending(&self) -> Duration {
        Duration::from_secs(self.stale_pending_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub enabled: bool,
    /// Applies to rate limited submissions
    pub retry: RetrySettings,
    /// How often to ask an explorer whether a submission went through
    pub status_polls: usize,
    pub status_poll_interval_ms: u64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retry: RetrySettings::default(),
            status_polls: 10,
            status_poll_interval_ms: 5_000,
        }
    }
}

impl VerificationSettings {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// Full solc version as explorers expect it
    pub version: String,
    pub optimizer: bool,
    pub optimizer_runs: u32,
    pub via_ir: bool,
    /// SPDX license index as used by etherscan (3 = MIT)
    pub license_type: u8,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            version: "v0.8.24+commit.e11b9ed9".to_string(),
            optimizer: true,
            optimizer_runs: 200,
            via_ir: true,
            license_type: 3,
        }
    }
}
