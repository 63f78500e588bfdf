use std::collections::HashSet;
use std::iter;
use std::sync::Arc;

use ethers::signers::Signer;
use eyre::bail;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::style::ProgressStyle;

use crate::accounts::{AccountResolver, Signers};
use crate::artifacts::Artifacts;
use crate::chain::{ChainClient, EthersChainClient};
use crate::cli::Args;
use crate::config::{
    Config, FailurePolicy, UnitConfig, VerificationSettings,
};
use crate::errors::DeployError;
use crate::ledger::Ledger;
use crate::network::{NetworkProfile, NetworkRegistry};
use crate::report::{RunReport, UnitOutcome};
use crate::types::UnitName;
use crate::verification::VerificationSubmitter;

pub mod deployer;
pub mod planner;
pub mod run_context;
pub mod unit;

use self::deployer::Deployer;
pub use self::run_context::RunContext;
use self::unit::{ArgSource, DeployableUnit};

/// Narrows the configured units to the requested ones and everything they
/// depend on. No request means every unit. Declaration order is kept.
pub fn select_units<'a>(
    configs: &'a [UnitConfig],
    requested: &[UnitName],
) -> eyre::Result<Vec<&'a UnitConfig>> {
    if requested.is_empty() {
        return Ok(configs.iter().collect());
    }

    let find = |name: &UnitName| configs.iter().find(|c| &c.name == name);

    let mut selected: HashSet<&UnitName> = HashSet::new();
    let mut stack: Vec<&UnitName> = vec![];

    for name in requested {
        if find(name).is_none() {
            bail!("Unknown unit {name}");
        }
        stack.push(name);
    }

    while let Some(name) = stack.pop() {
        if !selected.insert(name) {
            continue;
        }

        // Dependencies that aren't configured are looked up in the ledger
        // while planning
        let Some(config) = find(name) else {
            continue;
        };

        stack.extend(&config.depends_on);
        stack.extend(config.args.iter().filter_map(|arg| match arg {
            ArgSource::Unit { unit } => Some(unit),
            _ => None,
        }));
    }

    Ok(configs
        .iter()
        .filter(|config| selected.contains(&config.name))
        .collect())
}

/// Deploys `units` in dependency order and submits whatever this run
/// deployed for verification.
///
/// Only planning errors are returned, a unit that fails to deploy is
/// recorded in the report. With [`FailurePolicy::Halt`] or on an address
/// collision the remaining units are reported as not attempted, with
/// [`FailurePolicy::Continue`] only units depending on a failed one are
/// skipped. Once `cancelled` flips the unit in flight is finished and
/// nothing after it is started.
#[instrument(
    name = "run",
    skip_all,
    fields(network = %context.network(), run_id = %context.ledger.run_id())
)]
pub async fn execute(
    context: &RunContext,
    units: &[DeployableUnit],
    deployer: &Deployer,
    submitter: Option<&VerificationSubmitter>,
    cancelled: watch::Receiver<bool>,
) -> Result<RunReport, DeployError> {
    let plan = planner::plan(units, context).await?;

    let mut report = RunReport::new(context);
    let mut addresses = plan.addresses();

    for (_, record) in &plan.satisfied {
        report.skipped(record);
    }

    let span = Span::current();
    span.pb_set_style(&ProgressStyle::default_bar());
    span.pb_set_length(plan.to_deploy.len() as u64);

    let mut halted = false;
    let mut deployed = vec![];

    for unit in &plan.to_deploy {
        if *cancelled.borrow() && !report.cancelled {
            warn!("Interrupted, remaining units won't be deployed");
            report.cancelled = true;
        }

        if halted || report.cancelled {
            report.not_attempted(&unit.name);
            span.pb_inc(1);
            continue;
        }

        if let Some(blocker) = unit
            .dependencies
            .iter()
            .find(|dep| report.outcome(dep) == Some(UnitOutcome::Failed))
        {
            warn!(unit = %unit.name, %blocker, "Dependency failed, skipping");
            report.failed(&unit.name, format!("Blocked by {blocker}"));
            span.pb_inc(1);
            continue;
        }

        let result = match unit.bind_args(&addresses, &context.accounts) {
            Ok(args) => deployer
                .deploy(context, unit, &args)
                .await
                .map(|outcome| (outcome, args)),
            Err(err) => Err(err),
        };

        match result {
            Ok((outcome, args)) => {
                if let Some(address) = outcome.record.address {
                    addresses.insert(unit.name.clone(), address);
                }

                if outcome.action.is_new() {
                    report.deployed(&outcome.record);
                } else {
                    report.skipped(&outcome.record);
                }

                if unit.verify && outcome.action.is_new() {
                    deployed.push((unit.clone(), outcome.record, args));
                }
            }
            Err(err) => {
                error!(unit = %unit.name, %err, "Deployment failed");

                let collision =
                    matches!(err, DeployError::AddressCollision { .. });

                report.failed(&unit.name, err);

                if collision
                    || context.settings.failure_policy == FailurePolicy::Halt
                {
                    halted = true;
                }
            }
        }

        span.pb_inc(1);
    }

    match submitter {
        Some(submitter) if !deployed.is_empty() => {
            for job in submitter.submit_all(context, &deployed).await {
                report.verification(job);
            }
        }
        _ => {}
    }

    report.finish();

    Ok(report)
}

/// Resolves everything a run needs from the command line and the config
/// file, then deploys and writes the report next to the ledger.
pub async fn run_deployment(args: Args) -> eyre::Result<RunReport> {
    let config = Config::load(&args.config).await?;

    let registry = NetworkRegistry::new(config.networks.clone())?;
    let profile = registry.resolve(&args.network)?;

    info!(
        network = %profile.name,
        chain_id = profile.chain_id,
        "Deploying to network"
    );

    let signers = Signers::from_env(&profile, args.private_key.as_ref())?;
    let resolver = AccountResolver::new(config.roles.clone(), signers);

    let mut settings = config.deployment.clone();
    if let Some(policy) = args.failure_policy {
        settings.failure_policy = policy;
    }

    let artifacts = Artifacts::new(config.artifacts.clone());
    let mut units = vec![];
    for unit_config in select_units(&config.units, &args.units)? {
        let artifact = artifacts.load(unit_config.contract_name()).await?;
        units.push(DeployableUnit::new(unit_config, artifact));
    }

    let wallet = resolver.signer_for(&settings.deployer_role, &profile)?;
    let roles = iter::once(&settings.deployer_role)
        .chain(units.iter().flat_map(DeployableUnit::roles));
    let accounts = resolver.resolve_roles(roles, &profile)?;

    let ledger = if profile.save_deployments {
        Ledger::open(&args.deployment_dir).await?
    } else {
        Ledger::in_memory()
    };

    if let Some(path) = ledger.path() {
        info!(path = %path.display(), "Using deployment ledger");
    }

    let context = RunContext {
        deployer: wallet.address(),
        profile,
        accounts,
        ledger,
        settings,
        deployment_dir: args.deployment_dir.clone(),
    };

    if args.dry_run {
        return dry_run(&context, &units).await;
    }

    let chain = EthersChainClient::connect(&context.profile, wallet).await?;
    info!(deployer = ?chain.address(), "Connected");
    let chain: Arc<dyn ChainClient> = Arc::new(chain);
    let deployer = Deployer::new(chain);

    let submitter = wants_verification(
        &config.verification,
        &context.profile,
        args.no_verify,
    )
    .then(|| {
        VerificationSubmitter::for_network(
            &context.profile,
            config.verification.clone(),
            config.compiler.clone(),
            reqwest::Client::new(),
        )
    })
    .filter(VerificationSubmitter::has_explorers);

    let (cancel, cancelled) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received interrupt, finishing the current unit");
            cancel.send(true).ok();
        }
    });

    let report =
        execute(&context, &units, &deployer, submitter.as_ref(), cancelled)
            .await
            .map_err(|err| {
                if err.is_planning() {
                    error!("Planning failed, no transaction was sent");
                }
                err
            })?;

    let report_path = context.report_path();
    report.write(&report_path).await?;
    info!(path = %report_path.display(), "Wrote report");

    Ok(report)
}

fn wants_verification(
    settings: &VerificationSettings,
    profile: &NetworkProfile,
    no_verify: bool,
) -> bool {
    if !settings.enabled || no_verify {
        return false;
    }

    if !profile.live {
        info!(network = %profile.name, "Not live, skipping verification");
    }

    profile.live
}

/// Plans without connecting to the network. Everything that would be
/// deployed is reported as not attempted.
async fn dry_run(
    context: &RunContext,
    units: &[DeployableUnit],
) -> eyre::Result<RunReport> {
    let plan = planner::plan(units, context).await?;
    let mut report = RunReport::new(context);

    let known = context.ledger.records(context.network()).await?;
    info!(records = known.len(), "Planned against the ledger");

    for (_, record) in &plan.satisfied {
        report.skipped(record);
    }

    for unit in &plan.to_deploy {
        info!(unit = %unit.name, "Would deploy");
        report.not_attempted(&unit.name);
    }

    report.finish();

    Ok(report)
}
