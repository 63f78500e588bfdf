use std::path::PathBuf;

use ethers::types::Address;

use crate::accounts::AccountRole;
use crate::config::DeploymentSettings;
use crate::ledger::Ledger;
use crate::network::NetworkProfile;
use crate::types::NetworkName;

pub const REPORT_PATH: &str = "report.yml";

/// Everything a run knows about its target, passed explicitly into each
/// component instead of living in globals.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub profile: NetworkProfile,
    /// Roles resolved once at the start of the run
    pub accounts: Vec<AccountRole>,
    /// Address deployment transactions are sent from
    pub deployer: Address,
    pub ledger: Ledger,
    pub settings: DeploymentSettings,
    pub deployment_dir: PathBuf,
}

impl RunContext {
    pub fn network(&self) -> &NetworkName {
        &self.profile.name
    }

    /// Confirmations to wait for, the network's override first.
    pub fn confirmations(&self) -> usize {
        self.profile
            .confirmations
            .unwrap_or(self.settings.confirmations)
            .max(1)
    }

    pub fn report_path(&self) -> PathBuf {
        self.deployment_dir
            .join(self.network().as_str())
            .join(REPORT_PATH)
    }
}
