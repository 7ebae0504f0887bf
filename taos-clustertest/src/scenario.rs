//! Scenarios: scripted sequences of deployment, membership changes, perturbation and
//! verification, driven by a [`ScenarioRunner`].
//!
//! A scenario moves through a fixed set of phases:
//!
//! ```text
//! Building -> Converging(pre) -> Verified(pre) -> Perturbing -> Converging(post) -> Verified(post) -> Done
//! ```
//!
//! Errors while building or verifying end the scenario. Stop and start errors while perturbing are
//! recorded as faults in the [`ScenarioReport`]; the convergence wait after the perturbation decides
//! whether the cluster recovered from them.

use std::fmt;

use async_trait::async_trait;
use clap::ValueEnum;
use tracing::{error, info, warn};

use crate::client::Connector;
use crate::error::ClusterTestError;
use crate::observation::{ConvergenceTarget, ExpectedState, Role, RoleObservation};
use crate::server::NodeController;
use crate::{ClusterBuilder, ClusterHandle, NodeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pre,
    Post,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pre => f.write_str("pre"),
            Stage::Post => f.write_str("post"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Building,
    Converging(Stage),
    Verified(Stage),
    Perturbing,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Building => f.write_str("building"),
            Phase::Converging(stage) => write!(f, "converging ({stage})"),
            Phase::Verified(stage) => write!(f, "verifying ({stage})"),
            Phase::Perturbing => f.write_str("perturbing"),
            Phase::Done => f.write_str("done"),
        }
    }
}

/// What to do when a convergence wait runs out of attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum TimeoutPolicy {
    /// Fail the scenario with [`ClusterTestError::ConvergenceTimeout`].
    #[default]
    Fail,
    /// Log the timeout and let the strict verification that follows decide.
    Verify,
}

/// Everything a scenario needs to deploy its own cluster.
pub struct ScenarioContext {
    pub builder: ClusterBuilder,
    pub controller: Box<dyn NodeController>,
    pub connector: Box<dyn Connector>,
    pub policy: TimeoutPolicy,
}

/// A stop or start that failed while perturbing the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub round: usize,
    pub node: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub scenario: String,
    /// Every phase entered, in order.
    pub phases: Vec<Phase>,
    pub faults: Vec<Fault>,
    /// Convergence waits that ran out of attempts under [`TimeoutPolicy::Verify`].
    pub tolerated_timeouts: usize,
    pub final_observation: Option<RoleObservation>,
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scenario {} passed: {} faults, {} tolerated timeouts",
            self.scenario,
            self.faults.len(),
            self.tolerated_timeouts
        )?;
        for fault in &self.faults {
            write!(
                f,
                "\n  round {} dnode {}: {}",
                fault.round, fault.node, fault.error
            )?;
        }
        if let Some(observation) = &self.final_observation {
            write!(f, "\n{observation}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScenarioFailure {
    pub scenario: String,
    pub phase: Phase,
    pub error: ClusterTestError,
    pub last_observation: Option<RoleObservation>,
}

impl fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scenario {} failed while {}: {}",
            self.scenario, self.phase, self.error
        )?;
        match &self.last_observation {
            Some(observation) => write!(f, "\nlast observation:\n{observation}"),
            None => f.write_str("\nno mnode observation was made"),
        }
    }
}

impl std::error::Error for ScenarioFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[async_trait]
pub trait Scenario: Send + Sync {
    /// Unique name the scenario is registered and selected by.
    fn name(&self) -> &'static str;

    fn description(&self) -> String;

    /// Deploys a cluster with `ctx`, runs the scenario against it and tears it down.
    async fn run(&self, ctx: ScenarioContext) -> Result<ScenarioReport, ScenarioFailure>;
}

/// Drives one scenario against one cluster, tracking its phase, the last mnode observation and any
/// faults.
pub struct ScenarioRunner {
    scenario: String,
    handle: ClusterHandle,
    policy: TimeoutPolicy,
    phase: Phase,
    phases: Vec<Phase>,
    faults: Vec<Fault>,
    tolerated_timeouts: usize,
    last: Option<RoleObservation>,
}

impl ScenarioRunner {
    /// Deploys `dnodes` dnodes, promotes dnodes 2..=`mnodes` to mnodes and checks the freshly
    /// built cluster strictly: every dnode ready, and a single leader on the bootstrap endpoint
    /// before promotion.
    pub async fn build(
        scenario: &str,
        ctx: ScenarioContext,
        dnodes: usize,
        mnodes: usize,
    ) -> Result<Self, ScenarioFailure> {
        let building_failure = |error| ScenarioFailure {
            scenario: scenario.to_owned(),
            phase: Phase::Building,
            error,
            last_observation: None,
        };
        if mnodes == 0 || mnodes > dnodes {
            return Err(building_failure(ClusterTestError::AssertionMismatch {
                step: "checking topology".into(),
                detail: format!("cannot place {mnodes} mnodes on {dnodes} dnodes"),
                observation: None,
            }));
        }

        info!(scenario, dnodes, mnodes, "Building cluster");
        let handle = ctx
            .builder
            .dnodes(dnodes)
            .start(ctx.controller, ctx.connector)
            .await
            .map_err(building_failure)?;

        let mut runner = Self {
            scenario: scenario.to_owned(),
            handle,
            policy: ctx.policy,
            phase: Phase::Building,
            phases: vec![Phase::Building],
            faults: vec![],
            tolerated_timeouts: 0,
            last: None,
        };

        if let Err(error) = runner.check_built(mnodes).await {
            let failure = runner.fail(error);
            runner.handle.teardown().await;
            return Err(failure);
        }
        Ok(runner)
    }

    async fn check_built(&mut self, mnodes: usize) -> Result<(), ClusterTestError> {
        let endpoints = self.handle.cluster().endpoints();
        let dnodes = self.handle.observe_dnodes().await?;
        let observed: Vec<&str> = dnodes.rows.iter().map(|r| r.endpoint.as_str()).collect();
        if observed != endpoints || !dnodes.all_ready(endpoints.len()) {
            return Err(ClusterTestError::AssertionMismatch {
                step: "checking dnodes".into(),
                detail: format!("expected {endpoints:?} all ready, got {:?}", dnodes.rows),
                observation: None,
            });
        }

        let bootstrap = endpoints.first().cloned().unwrap_or_default();
        let single = ConvergenceTarget::leader_with_followers(1);
        self.wait(&single).await?;
        let expected = ExpectedState::ready([bootstrap.clone()]).with_role(&bootstrap, Role::Leader);
        self.check(Phase::Building, &expected, &single).await?;

        for dnode_id in 2..=mnodes {
            self.handle.promote_mnode(dnode_id as u32).await?;
        }
        Ok(())
    }

    pub fn handle(&mut self) -> &mut ClusterHandle {
        &mut self.handle
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        info!(scenario = %self.scenario, from = %self.phase, to = %phase, "Phase transition");
        self.phase = phase;
        self.phases.push(phase);
    }

    /// Wraps `error` into a failure of the current phase.
    pub fn fail(&self, error: ClusterTestError) -> ScenarioFailure {
        let last_observation = error.observation().cloned().or_else(|| self.last.clone());
        error!(scenario = %self.scenario, phase = %self.phase, %error, "Scenario failed");
        ScenarioFailure {
            scenario: self.scenario.clone(),
            phase: self.phase,
            error,
            last_observation,
        }
    }

    /// Waits for `target`, applying the timeout policy to an exhausted wait.
    async fn wait(&mut self, target: &ConvergenceTarget) -> Result<(), ClusterTestError> {
        let outcome = self.handle.await_convergence(target).await;
        if outcome.last.is_some() {
            self.last = outcome.last.clone();
        }
        if outcome.converged {
            return Ok(());
        }
        match self.policy {
            TimeoutPolicy::Fail => outcome.into_result(target).map(|_| ()),
            TimeoutPolicy::Verify => {
                warn!(
                    scenario = %self.scenario,
                    attempts = outcome.attempts,
                    "Cluster did not converge to {target}, continuing"
                );
                self.tolerated_timeouts += 1;
                Ok(())
            }
        }
    }

    /// One-shot `SHOW MNODES` that must match `expected` row by row and satisfy `target`.
    async fn check(
        &mut self,
        step: Phase,
        expected: &ExpectedState,
        target: &ConvergenceTarget,
    ) -> Result<RoleObservation, ClusterTestError> {
        let observation = self.handle.observe_mnodes().await?;
        self.last = Some(observation.clone());

        let mut problems = vec![];
        if let Err(detail) = expected.verify(&observation) {
            problems.push(detail);
        }
        if !target.is_satisfied_by(&observation) {
            problems.push(format!("roles do not match {target}"));
        }
        if !problems.is_empty() {
            return Err(ClusterTestError::AssertionMismatch {
                step: format!("{step} mnodes"),
                detail: problems.join("; "),
                observation: Some(observation),
            });
        }
        Ok(observation)
    }

    /// Enters `Converging(stage)` and waits for `target`.
    pub async fn converge(
        &mut self,
        stage: Stage,
        target: &ConvergenceTarget,
    ) -> Result<(), ScenarioFailure> {
        self.enter(Phase::Converging(stage));
        self.wait(target).await.map_err(|e| self.fail(e))
    }

    /// Waits for `target` without leaving the current phase.
    pub async fn await_target(&mut self, target: &ConvergenceTarget) -> Result<(), ScenarioFailure> {
        self.wait(target).await.map_err(|e| self.fail(e))
    }

    /// Enters `Verified(stage)` and checks the mnodes strictly.
    pub async fn verify(
        &mut self,
        stage: Stage,
        expected: &ExpectedState,
        target: &ConvergenceTarget,
    ) -> Result<RoleObservation, ScenarioFailure> {
        self.enter(Phase::Verified(stage));
        self.check(Phase::Verified(stage), expected, target)
            .await
            .map_err(|e| self.fail(e))
    }

    /// Strict re-check within the current phase.
    pub async fn recheck(
        &mut self,
        expected: &ExpectedState,
        target: &ConvergenceTarget,
    ) -> Result<RoleObservation, ScenarioFailure> {
        let phase = self.phase;
        self.check(phase, expected, target)
            .await
            .map_err(|e| self.fail(e))
    }

    pub fn begin_perturbation(&mut self) {
        self.enter(Phase::Perturbing);
    }

    fn record_fault(&mut self, round: usize, node: usize, error: ClusterTestError) {
        warn!(scenario = %self.scenario, round, node, %error, "Fault while perturbing");
        self.faults.push(Fault {
            round,
            node,
            error: error.to_string(),
        });
    }

    /// Stops dnode `index`, recording a fault on failure.
    pub async fn stop(&mut self, round: usize, index: usize) -> bool {
        match self.handle.stop_node(index).await {
            Ok(()) => true,
            Err(e) => {
                self.record_fault(round, index, e);
                false
            }
        }
    }

    /// Starts dnode `index`, recording a fault on failure.
    pub async fn start(&mut self, round: usize, index: usize) -> bool {
        match self.handle.start_node(index).await {
            Ok(()) => true,
            Err(e) => {
                self.record_fault(round, index, e);
                false
            }
        }
    }

    /// Starts every dnode that is not running, e.g. after a failed start in an earlier round.
    pub async fn recover(&mut self, round: usize) {
        let down: Vec<usize> = self
            .handle
            .cluster()
            .nodes()
            .iter()
            .filter(|n| n.state != NodeState::Running)
            .map(|n| n.index)
            .collect();
        for index in down {
            info!(scenario = %self.scenario, round, node = index, "Restarting dnode left down");
            self.start(round, index).await;
        }
    }

    /// Stops and starts every dnode in order, `rounds` times.
    pub async fn restart_rounds(&mut self, rounds: usize) {
        let nodes: Vec<usize> = (1..=self.handle.cluster().len()).collect();
        for round in 1..=rounds {
            self.recover(round).await;
            for &index in &nodes {
                if self.stop(round, index).await {
                    self.start(round, index).await;
                }
            }
            info!(scenario = %self.scenario, round, "Restart round complete");
        }
        self.recover(rounds + 1).await;
    }

    /// Tears the cluster down and, if the scenario succeeded, reports on it.
    pub async fn finish(
        mut self,
        outcome: Result<(), ScenarioFailure>,
    ) -> Result<ScenarioReport, ScenarioFailure> {
        self.handle.teardown().await;
        outcome?;
        self.enter(Phase::Done);
        Ok(ScenarioReport {
            scenario: self.scenario,
            phases: self.phases,
            faults: self.faults,
            tolerated_timeouts: self.tolerated_timeouts,
            final_observation: self.last,
        })
    }
}

fn mnode_endpoints(handle: &ClusterHandle, mnodes: usize) -> Vec<String> {
    handle
        .cluster()
        .endpoints()
        .into_iter()
        .take(mnodes)
        .collect()
}

/// Deploys `dnodes` dnodes, places mnodes on the first `mnodes` of them, checks that a second
/// `CREATE MNODE` on dnode 2 is rejected, then stops and starts every dnode `rounds` times.
#[derive(Debug, Clone)]
pub struct MnodeRestartScenario {
    pub dnodes: usize,
    pub mnodes: usize,
    pub rounds: usize,
}

impl Default for MnodeRestartScenario {
    fn default() -> Self {
        Self {
            dnodes: 5,
            mnodes: 3,
            rounds: 3,
        }
    }
}

impl MnodeRestartScenario {
    async fn drive(&self, runner: &mut ScenarioRunner) -> Result<(), ScenarioFailure> {
        let target = ConvergenceTarget::leader_with_followers(self.mnodes);
        let expected = ExpectedState::ready(mnode_endpoints(runner.handle(), self.mnodes));

        runner.converge(Stage::Pre, &target).await?;
        runner.verify(Stage::Pre, &expected, &target).await?;

        if self.mnodes >= 2 {
            match runner.handle().promote_mnode(2).await {
                Err(e) if e.is_already_member() => info!("Duplicate mnode rejected: {e}"),
                Ok(()) => {
                    return Err(runner.fail(ClusterTestError::AssertionMismatch {
                        step: "duplicate mnode".into(),
                        detail: "CREATE MNODE ON DNODE 2 succeeded on an existing mnode".into(),
                        observation: None,
                    }))
                }
                Err(e) => return Err(runner.fail(e.into())),
            }
            runner.recheck(&expected, &target).await?;
        }

        runner.begin_perturbation();
        runner.restart_rounds(self.rounds).await;

        runner.converge(Stage::Post, &target).await?;
        runner.verify(Stage::Post, &expected, &target).await?;
        Ok(())
    }
}

#[async_trait]
impl Scenario for MnodeRestartScenario {
    fn name(&self) -> &'static str {
        "mnode_restart_cycle"
    }

    fn description(&self) -> String {
        format!(
            "{} dnodes, {} mnodes: reject a duplicate mnode, then restart every dnode {} times",
            self.dnodes, self.mnodes, self.rounds
        )
    }

    async fn run(&self, ctx: ScenarioContext) -> Result<ScenarioReport, ScenarioFailure> {
        let mut runner = ScenarioRunner::build(self.name(), ctx, self.dnodes, self.mnodes).await?;
        let outcome = self.drive(&mut runner).await;
        runner.finish(outcome).await
    }
}

/// Stops each mnode host in turn and checks that the remaining mnodes elect a leader while the
/// stopped one reports `offline`, then restarts it and waits for full convergence.
#[derive(Debug, Clone)]
pub struct MnodeStopScenario {
    pub dnodes: usize,
    pub mnodes: usize,
}

impl Default for MnodeStopScenario {
    fn default() -> Self {
        Self {
            dnodes: 5,
            mnodes: 3,
        }
    }
}

impl MnodeStopScenario {
    async fn drive(&self, runner: &mut ScenarioRunner) -> Result<(), ScenarioFailure> {
        let target = ConvergenceTarget::leader_with_followers(self.mnodes);
        let endpoints = mnode_endpoints(runner.handle(), self.mnodes);
        let expected = ExpectedState::ready(endpoints.clone());

        runner.converge(Stage::Pre, &target).await?;
        runner.verify(Stage::Pre, &expected, &target).await?;

        runner.begin_perturbation();
        for (i, endpoint) in endpoints.iter().enumerate() {
            let index = i + 1;
            if runner.stop(index, index).await {
                let degraded = ConvergenceTarget::new(self.mnodes)
                    .with_role(Role::Leader, 1)
                    .with_role(Role::Follower, self.mnodes - 2)
                    .with_role(Role::Offline, 1)
                    .pin(endpoint.clone(), Role::Offline);
                runner.await_target(&degraded).await?;
            }
            runner.start(index, index).await;
            runner.await_target(&target).await?;
        }
        runner.recover(self.mnodes + 1).await;

        runner.converge(Stage::Post, &target).await?;
        runner.verify(Stage::Post, &expected, &target).await?;
        Ok(())
    }
}

#[async_trait]
impl Scenario for MnodeStopScenario {
    fn name(&self) -> &'static str {
        "mnode_stop_each"
    }

    fn description(&self) -> String {
        format!(
            "{} dnodes, {} mnodes: stop each mnode host and check the others keep a leader",
            self.dnodes, self.mnodes
        )
    }

    async fn run(&self, ctx: ScenarioContext) -> Result<ScenarioReport, ScenarioFailure> {
        // Losing one of two mnodes loses the quorum.
        if self.mnodes < 3 {
            return Err(ScenarioFailure {
                scenario: self.name().to_owned(),
                phase: Phase::Building,
                error: ClusterTestError::AssertionMismatch {
                    step: "checking topology".into(),
                    detail: format!("stopping an mnode needs at least 3 mnodes, got {}", self.mnodes),
                    observation: None,
                },
                last_observation: None,
            });
        }
        let mut runner = ScenarioRunner::build(self.name(), ctx, self.dnodes, self.mnodes).await?;
        let outcome = self.drive(&mut runner).await;
        runner.finish(outcome).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sim::SimCluster;

    fn all_phases() -> Vec<Phase> {
        vec![
            Phase::Building,
            Phase::Converging(Stage::Pre),
            Phase::Verified(Stage::Pre),
            Phase::Perturbing,
            Phase::Converging(Stage::Post),
            Phase::Verified(Stage::Post),
            Phase::Done,
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cycle_converges_to_one_leader_and_two_followers() {
        let sim = SimCluster::new();
        let report = MnodeRestartScenario::default()
            .run(sim.context(TimeoutPolicy::Fail))
            .await
            .unwrap();

        assert_eq!(report.phases, all_phases());
        assert!(report.faults.is_empty());
        assert_eq!(report.tolerated_timeouts, 0);

        let observation = report.final_observation.unwrap();
        assert_eq!(
            observation
                .rows
                .iter()
                .map(|r| r.endpoint.as_str())
                .collect::<Vec<_>>(),
            vec!["sim:6030", "sim:6130", "sim:6230"]
        );
        assert_eq!(observation.role_counts().get(&Role::Leader), Some(&1));
        assert_eq!(observation.role_counts().get(&Role::Follower), Some(&2));

        let events = sim.events();
        // Three rounds over five dnodes, then teardown.
        assert_eq!(events.iter().filter(|e| e.starts_with("stop ")).count(), 20);
        assert_eq!(
            events
                .iter()
                .filter(|e| *e == "sql CREATE MNODE ON DNODE 2")
                .count(),
            2
        );
        assert_eq!(sim.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_leader_for_any_mnode_count() {
        for (dnodes, mnodes) in [(1, 1), (3, 1), (3, 2), (3, 3), (4, 4)] {
            let sim = SimCluster::new();
            let scenario = MnodeRestartScenario {
                dnodes,
                mnodes,
                rounds: 1,
            };
            let report = scenario
                .run(sim.context(TimeoutPolicy::Fail))
                .await
                .unwrap_or_else(|f| panic!("{dnodes} dnodes, {mnodes} mnodes: {f}"));

            let observation = report.final_observation.unwrap();
            let counts = observation.role_counts();
            assert_eq!(observation.len(), mnodes);
            assert_eq!(counts.get(&Role::Leader), Some(&1));
            assert_eq!(
                counts.get(&Role::Follower).copied().unwrap_or(0),
                mnodes - 1
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_each_pins_the_stopped_mnode_offline() {
        let sim = SimCluster::new();
        let report = MnodeStopScenario::default()
            .run(sim.context(TimeoutPolicy::Fail))
            .await
            .unwrap();

        assert_eq!(report.phases, all_phases());
        assert!(report.faults.is_empty());
        assert!(report.final_observation.unwrap().leader().is_some());

        let stops: Vec<String> = sim
            .events()
            .into_iter()
            .filter(|e| e.starts_with("stop "))
            .take(3)
            .collect();
        assert_eq!(stops, vec!["stop 1", "stop 2", "stop 3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restart_is_a_fault_not_a_failure() {
        let sim = SimCluster::new();
        sim.state().fail_restart.insert(4, 1);

        let report = MnodeRestartScenario::default()
            .run(sim.context(TimeoutPolicy::Fail))
            .await
            .unwrap();

        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].round, 1);
        assert_eq!(report.faults[0].node, 4);
        assert!(report.faults[0].error.contains("exited during startup"));
        assert_eq!(report.phases.last(), Some(&Phase::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_scenario_under_fail_policy() {
        let sim = SimCluster::new();
        sim.state().election_delay = 100;

        let failure = MnodeRestartScenario::default()
            .run(sim.context(TimeoutPolicy::Fail))
            .await
            .unwrap_err();

        assert_eq!(failure.phase, Phase::Converging(Stage::Post));
        assert!(matches!(
            failure.error,
            ClusterTestError::ConvergenceTimeout { attempts: 10, .. }
        ));
        let last = failure.last_observation.as_ref().unwrap();
        assert_eq!(last.role_counts().get(&Role::Candidate), Some(&3));

        let rendered = failure.to_string();
        assert!(
            rendered.starts_with("scenario mnode_restart_cycle failed while converging (post)"),
            "{rendered}"
        );
        assert!(rendered.contains("candidate"), "{rendered}");
        assert_eq!(sim.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_defers_to_strict_check_under_verify_policy() {
        let sim = SimCluster::new();
        sim.state().election_delay = 100;

        let failure = MnodeRestartScenario::default()
            .run(sim.context(TimeoutPolicy::Verify))
            .await
            .unwrap_err();

        assert_eq!(failure.phase, Phase::Verified(Stage::Post));
        match &failure.error {
            ClusterTestError::AssertionMismatch { detail, observation, .. } => {
                assert!(detail.contains("roles do not match"), "{detail}");
                assert!(observation.is_some());
            }
            e => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_duplicate_mnode_fails_verification() {
        let sim = SimCluster::new();
        sim.state().duplicate_promote_succeeds = true;

        let failure = MnodeRestartScenario::default()
            .run(sim.context(TimeoutPolicy::Fail))
            .await
            .unwrap_err();

        assert_eq!(failure.phase, Phase::Verified(Stage::Pre));
        assert!(matches!(
            &failure.error,
            ClusterTestError::AssertionMismatch { step, .. } if step == "duplicate mnode"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deployment_failure_ends_scenario_while_building() {
        let sim = SimCluster::new();
        sim.state().fail_start.insert(3, 1);

        let failure = MnodeRestartScenario::default()
            .run(sim.context(TimeoutPolicy::Fail))
            .await
            .unwrap_err();

        assert_eq!(failure.phase, Phase::Building);
        assert!(matches!(
            failure.error,
            ClusterTestError::Deployment { node: 3, .. }
        ));
        assert!(failure.last_observation.is_none());
    }

    #[tokio::test]
    async fn stop_each_needs_three_mnodes() {
        let sim = SimCluster::new();
        let failure = MnodeStopScenario {
            dnodes: 5,
            mnodes: 2,
        }
        .run(sim.context(TimeoutPolicy::Fail))
        .await
        .unwrap_err();

        assert_eq!(failure.phase, Phase::Building);
        assert!(sim.events().is_empty());
    }
}
