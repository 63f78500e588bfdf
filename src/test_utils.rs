//! Fixtures shared by the unit tests.

use std::path::PathBuf;

use ethers::prelude::k256::SecretKey;
use ethers::types::{Address, Bytes};

use crate::accounts::{AccountRole, Signers};
use crate::artifacts::ContractArtifact;
use crate::cli::PrivateKey;
use crate::config::{DeploymentSettings, RetrySettings, UnitConfig};
use crate::deployment::unit::{ArgSource, DeployableUnit, SaltPolicy};
use crate::deployment::RunContext;
use crate::deployment::unit::ResolvedArgs;
use crate::ledger::{DeploymentRecord, Ledger, PendingDeployment};
use crate::network::{GasStrategy, NetworkProfile};
use crate::types::UnitName;

pub fn address(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn signers(count: u8) -> Signers {
    let keys: Vec<PrivateKey> = (1..=count)
        .map(|byte| PrivateKey {
            key: SecretKey::from_slice(&[byte; 32]).unwrap(),
        })
        .collect();

    Signers::new(&keys, 31337)
}

pub fn profile(name: &str) -> NetworkProfile {
    NetworkProfile {
        name: name.into(),
        chain_id: 31337,
        rpc_url: "http://127.0.0.1:8545".to_string(),
        gas: GasStrategy::default(),
        explorers: vec![],
        accounts: vec![],
        live: false,
        save_deployments: true,
        confirmations: None,
    }
}

pub fn unit(name: &str, deps: &[&str]) -> DeployableUnit {
    unit_with(name, vec![], deps)
}

/// A unit with creation and runtime bytecode unique to its name.
pub fn unit_with(
    name: &str,
    args: Vec<ArgSource>,
    deps: &[&str],
) -> DeployableUnit {
    let config = UnitConfig {
        name: name.into(),
        contract: None,
        args,
        depends_on: deps.iter().map(|dep| UnitName::from(*dep)).collect(),
        salt: SaltPolicy::Derived,
        source: None,
        qualified_name: None,
        verify: true,
    };

    let artifact = ContractArtifact {
        bytecode: Bytes::from(
            [&[0x60u8, 0x80][..], name.as_bytes()].concat(),
        ),
        deployed_bytecode: Some(Bytes::from(
            [&[0x60u8, 0x01][..], name.as_bytes()].concat(),
        )),
    };

    DeployableUnit::new(&config, artifact)
}

/// Settings that keep retries and confirmation waits in milliseconds.
pub fn fast_settings() -> DeploymentSettings {
    DeploymentSettings {
        confirmation_timeout_secs: 1,
        poll_interval_ms: 5,
        retry: RetrySettings {
            max_attempts: 3,
            min_delay_ms: 1,
            max_delay_ms: 5,
            factor: 2.0,
        },
        ..Default::default()
    }
}

pub fn context(network: &str, ledger: Ledger) -> RunContext {
    let deployer = address(0xde);

    RunContext {
        profile: profile(network),
        accounts: vec![
            AccountRole {
                role: "deployer".into(),
                address: deployer,
            },
            AccountRole {
                role: "owner".into(),
                address: address(0x0e),
            },
        ],
        deployer,
        ledger,
        settings: fast_settings(),
        deployment_dir: PathBuf::from("deployments"),
    }
}

/// Puts a confirmed record for `unit` in the context's ledger, as if an
/// earlier run had deployed it.
pub async fn confirm(
    context: &RunContext,
    unit: &DeployableUnit,
    address: Address,
) -> eyre::Result<DeploymentRecord> {
    let ledger = &context.ledger;

    let handle = ledger
        .begin_pending(
            &unit.name,
            context.network(),
            PendingDeployment {
                bytecode_hash: unit.bytecode_hash(),
                args_hash: ResolvedArgs::new(vec![]).hash(),
                expected_address: Some(address),
                deployer: context.deployer,
                salt: None,
            },
        )
        .await?;

    Ok(ledger.commit(&handle, address, None).await?)
}
