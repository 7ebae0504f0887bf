use std::collections::BTreeMap;
use std::sync::Arc;

use crate::scenario::{MnodeRestartScenario, MnodeStopScenario, Scenario};

/// The set of scenarios a run can select from, keyed by [`Scenario::name`].
///
/// Built once by the caller and passed to whatever runs scenarios; nothing registers itself.
#[derive(Default, Clone)]
pub struct ScenarioRegistry {
    scenarios: BTreeMap<&'static str, Arc<dyn Scenario>>,
}

impl ScenarioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the scenarios shipped with this crate, with their default topologies.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(MnodeRestartScenario::default());
        registry.register(MnodeStopScenario::default());
        registry
    }

    /// Adds `scenario`, returning the one it replaced if the name was taken.
    pub fn register<S>(&mut self, scenario: S) -> Option<Arc<dyn Scenario>>
    where
        S: Scenario + 'static,
    {
        self.scenarios.insert(scenario.name(), Arc::new(scenario))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scenario>> {
        self.scenarios.get(name).cloned()
    }

    /// Scenarios in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Scenario>> {
        self.scenarios.values()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.scenarios.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}
