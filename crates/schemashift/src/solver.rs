//! Change solver - orders change units so every statement finds the objects
//! it needs.
//!
//! ## Ordering rules
//!
//! ```text
//! create/alter of X      before   create/alter of anything whose target references X
//! drop of V              before   drop of anything V depends on in the catalog
//! drop of V              before   alter of a table V depends on in the catalog
//! drop of X              before   create of X
//! ```
//!
//! Ties are broken by object name, then drop < alter < create, so the same
//! input always yields the same order. A set of units that cannot be ordered
//! is a dependency cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::change::{ChangeUnit, Changeset, Phase};
use crate::error::Error;

/// A change unit together with the dependencies that constrain its position.
#[derive(Debug, Clone)]
pub struct PlannedUnit {
    pub unit: ChangeUnit,
    /// References of the target object, for creates and alters.
    pub target_dependencies: Vec<String>,
    /// Catalog dependencies of the object being dropped.
    pub catalog_dependencies: Vec<String>,
}

impl PlannedUnit {
    fn phase(&self) -> Phase {
        self.unit.operation.phase()
    }
}

/// Order planned units into a changeset.
pub fn order_units(planned: Vec<PlannedUnit>) -> Result<Changeset, Error> {
    // At most one drop and one create-or-alter per object name.
    let mut drops: HashMap<&str, usize> = HashMap::new();
    let mut builds: HashMap<&str, usize> = HashMap::new();
    let mut alters: HashMap<&str, usize> = HashMap::new();
    for (i, p) in planned.iter().enumerate() {
        let name = p.unit.object.as_str();
        match p.phase() {
            Phase::Drop => {
                drops.insert(name, i);
            }
            Phase::Alter => {
                builds.insert(name, i);
                alters.insert(name, i);
            }
            Phase::Create => {
                builds.insert(name, i);
            }
        }
    }

    // edges[a] contains b when a must run before b
    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); planned.len()];
    for (i, p) in planned.iter().enumerate() {
        let name = p.unit.object.as_str();
        match p.phase() {
            Phase::Alter | Phase::Create => {
                for dependency in &p.target_dependencies {
                    if let Some(&j) = builds.get(dependency.as_str())
                        && j != i
                    {
                        edges[j].insert(i);
                    }
                }
                if let Some(&j) = drops.get(name) {
                    edges[j].insert(i);
                }
            }
            Phase::Drop => {
                for dependency in &p.catalog_dependencies {
                    if let Some(&j) = drops.get(dependency.as_str())
                        && j != i
                    {
                        edges[i].insert(j);
                    }
                    if let Some(&j) = alters.get(dependency.as_str()) {
                        edges[i].insert(j);
                    }
                }
            }
        }
    }

    let mut in_degree = vec![0usize; planned.len()];
    for targets in &edges {
        for &t in targets {
            in_degree[t] += 1;
        }
    }

    // Ready set keyed by (name, phase, index) so the smallest key runs first.
    let key = |i: usize| (planned[i].unit.object.clone(), planned[i].phase(), i);
    let mut ready: BTreeSet<(String, Phase, usize)> = (0..planned.len())
        .filter(|&i| in_degree[i] == 0)
        .map(key)
        .collect();

    let mut order = Vec::with_capacity(planned.len());
    while let Some((_, _, i)) = ready.pop_first() {
        order.push(i);
        for &t in &edges[i] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                ready.insert(key(t));
            }
        }
    }

    if order.len() < planned.len() {
        let stuck: BTreeSet<String> = (0..planned.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| planned[i].unit.object.clone())
            .collect();
        return Err(Error::DependencyCycle {
            objects: stuck.into_iter().collect(),
        });
    }

    let mut slots: BTreeMap<usize, ChangeUnit> = planned
        .into_iter()
        .enumerate()
        .map(|(i, p)| (i, p.unit))
        .collect();
    let units = order
        .into_iter()
        .filter_map(|i| slots.remove(&i))
        .collect();
    Ok(Changeset::from_ordered(units))
}
