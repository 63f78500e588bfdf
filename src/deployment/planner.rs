use std::collections::{BTreeMap, HashMap};

use ethers::types::Address;
use tracing::{debug, info, instrument};

use super::unit::DeployableUnit;
use super::RunContext;
use crate::errors::DeployError;
use crate::ledger::DeploymentRecord;
use crate::types::UnitName;

#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Units to deploy, every unit after its dependencies
    pub to_deploy: Vec<DeployableUnit>,

    /// Requested units already confirmed with the same bytecode
    pub satisfied: Vec<(DeployableUnit, DeploymentRecord)>,

    /// Confirmed dependencies that weren't requested
    pub external: Vec<DeploymentRecord>,
}

impl Plan {
    /// Addresses known before anything is deployed.
    pub fn addresses(&self) -> BTreeMap<UnitName, Address> {
        self.satisfied
            .iter()
            .map(|(_, record)| record)
            .chain(&self.external)
            .filter_map(|record| {
                record.address.map(|address| (record.unit.clone(), address))
            })
            .collect()
    }
}

/// Orders the requested units, dependencies first, and drops the ones the
/// ledger already has.
///
/// Fails before any transaction if the dependency graph has a cycle or a
/// dependency is neither requested nor deployed on the network.
#[instrument(skip_all, fields(network = %context.network()))]
pub async fn plan(
    units: &[DeployableUnit],
    context: &RunContext,
) -> Result<Plan, DeployError> {
    let network = context.network();
    let mut plan = Plan::default();

    for unit in units {
        for dependency in &unit.dependencies {
            if units.iter().any(|other| &other.name == dependency)
                || plan.external.iter().any(|r| &r.unit == dependency)
            {
                continue;
            }

            let record = context
                .ledger
                .lookup(dependency, network)
                .await?
                .ok_or_else(|| DeployError::UnknownDependency {
                    unit: unit.name.clone(),
                    dependency: dependency.clone(),
                })?;

            debug!(
                unit = %dependency,
                address = ?record.address,
                "Using deployed dependency"
            );
            plan.external.push(record);
        }
    }

    for index in topological_order(units)? {
        let unit = &units[index];

        match context.ledger.lookup(&unit.name, network).await? {
            Some(record) if record.bytecode_hash == unit.bytecode_hash() => {
                info!(
                    unit = %unit.name,
                    address = ?record.address,
                    "Already deployed"
                );
                plan.satisfied.push((unit.clone(), record));
            }
            _ => plan.to_deploy.push(unit.clone()),
        }
    }

    Ok(plan)
}

/// Indices of `units` in dependency order. Among units that are ready at
/// the same time the one declared first goes first. Dependencies outside
/// `units` are ignored.
pub fn topological_order(
    units: &[DeployableUnit],
) -> Result<Vec<usize>, DeployError> {
    let index: HashMap<&UnitName, usize> = units
        .iter()
        .enumerate()
        .map(|(i, unit)| (&unit.name, i))
        .collect();

    let mut emitted = vec![false; units.len()];
    let mut order = Vec::with_capacity(units.len());

    let is_ready = |i: usize, emitted: &[bool]| {
        units[i]
            .dependencies
            .iter()
            .all(|dep| index.get(dep).map_or(true, |&j| emitted[j]))
    };

    while order.len() < units.len() {
        let next = (0..units.len())
            .find(|&i| !emitted[i] && is_ready(i, &emitted));

        match next {
            Some(i) => {
                emitted[i] = true;
                order.push(i);
            }
            None => {
                return Err(DeployError::CyclicDependency(find_cycle(
                    units, &index, &emitted,
                )))
            }
        }
    }

    Ok(order)
}

/// Every unit left over once no unit is ready has a left over dependency,
/// so walking those from any of them has to come back around.
fn find_cycle(
    units: &[DeployableUnit],
    index: &HashMap<&UnitName, usize>,
    emitted: &[bool],
) -> Vec<UnitName> {
    let Some(start) = emitted.iter().position(|done| !done) else {
        return vec![];
    };

    let mut path: Vec<usize> = vec![];
    let mut current = start;

    loop {
        if let Some(position) = path.iter().position(|&i| i == current) {
            let mut cycle: Vec<UnitName> = path[position..]
                .iter()
                .map(|&i| units[i].name.clone())
                .collect();
            cycle.push(units[current].name.clone());
            return cycle;
        }

        path.push(current);

        let next = units[current]
            .dependencies
            .iter()
            .filter_map(|dep| index.get(dep).copied())
            .find(|&j| !emitted[j]);

        match next {
            Some(next) => current = next,
            None => {
                return path.iter().map(|&i| units[i].name.clone()).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::test_utils;

    fn names(units: &[DeployableUnit]) -> Vec<&str> {
        units.iter().map(|unit| unit.name.as_str()).collect()
    }

    #[tokio::test]
    async fn dependencies_go_first() -> eyre::Result<()> {
        let context = test_utils::context("TestNet", Ledger::in_memory());

        let units = vec![
            test_utils::unit("B", &["A"]),
            test_utils::unit("A", &[]),
        ];

        let plan = plan(&units, &context).await?;
        assert_eq!(names(&plan.to_deploy), vec!["A", "B"]);

        Ok(())
    }

    #[test]
    fn ties_keep_declared_order() -> eyre::Result<()> {
        let units = vec![
            test_utils::unit("C", &[]),
            test_utils::unit("Booking", &["MockToken"]),
            test_utils::unit("A", &[]),
            test_utils::unit("MockToken", &[]),
        ];

        let order: Vec<&str> = topological_order(&units)?
            .into_iter()
            .map(|i| units[i].name.as_str())
            .collect();

        assert_eq!(order, vec!["C", "A", "MockToken", "Booking"]);

        Ok(())
    }

    #[tokio::test]
    async fn cycles_are_rejected() {
        let context = test_utils::context("TestNet", Ledger::in_memory());

        let units = vec![
            test_utils::unit("Free", &[]),
            test_utils::unit("A", &["B"]),
            test_utils::unit("B", &["A"]),
        ];

        let err = plan(&units, &context).await.unwrap_err();

        match err {
            DeployError::CyclicDependency(cycle) => {
                assert_eq!(
                    cycle,
                    vec![
                        UnitName::from("A"),
                        UnitName::from("B"),
                        UnitName::from("A")
                    ]
                );
            }
            other => panic!("Expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let units = vec![test_utils::unit("A", &["A"])];

        assert!(matches!(
            topological_order(&units),
            Err(DeployError::CyclicDependency(cycle)) if cycle.len() == 2
        ));
    }

    #[tokio::test]
    async fn missing_dependency_is_rejected() {
        let context = test_utils::context("TestNet", Ledger::in_memory());
        let units = vec![test_utils::unit("Booking", &["MockToken"])];

        let err = plan(&units, &context).await.unwrap_err();

        assert!(matches!(
            err,
            DeployError::UnknownDependency { ref dependency, .. }
                if dependency.as_str() == "MockToken"
        ));
        assert!(err.is_planning());
    }

    #[tokio::test]
    async fn deployed_units_are_filtered() -> eyre::Result<()> {
        let context = test_utils::context("TestNet", Ledger::in_memory());

        let token = test_utils::unit("MockToken", &[]);
        let address = test_utils::address(0x70);
        test_utils::confirm(&context, &token, address).await?;

        // A dependency that is only in the ledger
        let units = vec![test_utils::unit("Booking", &["MockToken"])];
        let only_booking = plan(&units, &context).await?;

        assert_eq!(names(&only_booking.to_deploy), vec!["Booking"]);
        assert_eq!(
            only_booking.addresses(),
            maplit::btreemap! { UnitName::from("MockToken") => address }
        );

        // And one that is requested again
        let units = vec![token.clone(), units[0].clone()];
        let both = plan(&units, &context).await?;

        assert_eq!(names(&both.to_deploy), vec!["Booking"]);
        assert_eq!(both.satisfied[0].0.name, token.name);
        assert!(both.external.is_empty());

        // New bytecode means deploying again
        let mut changed = token;
        changed.bytecode = vec![0x60, 0x00].into();

        let redeploy = plan(&[changed], &context).await?;
        assert_eq!(names(&redeploy.to_deploy), vec!["MockToken"]);

        Ok(())
    }
}
