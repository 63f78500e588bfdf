use std::path::PathBuf;

use clap::Parser;

pub mod private_key;

pub use private_key::PrivateKey;

use crate::config::FailurePolicy;
use crate::types::{NetworkName, UnitName};

#[derive(Debug, Clone, Parser)]
#[clap(rename_all = "kebab-case", version, about)]
pub struct Args {
    /// Path to the deployment configuration file (yaml or toml)
    #[clap(short, long, env, default_value = "deploy.yml")]
    pub config: PathBuf,

    /// The network to deploy to
    #[clap(short, long, env)]
    pub network: NetworkName,

    /// Directory holding the deployment ledger and run reports
    #[clap(short, long, env, default_value = "deployments")]
    pub deployment_dir: PathBuf,

    /// Private key replacing the network's first account
    #[clap(short, long, env)]
    pub private_key: Option<PrivateKey>,

    /// What to do with independent units once a unit fails
    #[clap(long, env)]
    pub failure_policy: Option<FailurePolicy>,

    /// Only deploy these units (and whatever they depend on)
    #[clap(short, long, value_delimiter = ',')]
    pub units: Vec<UnitName>,

    /// Skip explorer verification
    #[clap(long, env)]
    pub no_verify: bool,

    /// Print the plan and exit without sending transactions
    #[clap(long)]
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_unit_filter() {
        let args = Args::parse_from([
            "deploy-orchestrator",
            "--network",
            "Columbus",
            "--units",
            "MockToken,HotelBooking",
            "--failure-policy",
            "continue",
        ]);

        assert_eq!(args.network, NetworkName::from("Columbus"));
        assert_eq!(
            args.units,
            vec![UnitName::from("MockToken"), UnitName::from("HotelBooking")]
        );
        assert_eq!(args.failure_policy, Some(FailurePolicy::Continue));
        assert!(!args.dry_run);
    }
}
