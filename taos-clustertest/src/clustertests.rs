//! Scenarios against real `taosd` processes. Skipped unless `RUN_CLUSTER_TESTS` is set; see the
//! crate documentation for the environment they read.

use taos_clustertest_macros::clustertest;

use crate::scenario::{MnodeRestartScenario, MnodeStopScenario, Scenario, ScenarioContext};
use crate::*;

fn context(name: &str) -> ScenarioContext {
    let env = Env::from_env().unwrap();
    ScenarioContext {
        builder: ClusterBuilder::new(name, &env).extra_cfg("monitorFqdn", &env.fqdn),
        controller: env.controller(),
        connector: env.connector(),
        policy: TimeoutPolicy::Fail,
    }
}

#[clustertest]
async fn five_dnodes_three_mnodes_restart_cycle() {
    let scenario = MnodeRestartScenario::default();
    match scenario.run(context("ct_restart_cycle")).await {
        Ok(report) => println!("{report}"),
        Err(failure) => panic!("{failure}"),
    }
}

#[clustertest]
async fn stop_each_mnode_host() {
    let scenario = MnodeStopScenario::default();
    match scenario.run(context("ct_stop_each")).await {
        Ok(report) => println!("{report}"),
        Err(failure) => panic!("{failure}"),
    }
}

#[clustertest]
async fn joining_twice_is_already_member() {
    let env = Env::from_env().unwrap();
    let mut cluster = ClusterBuilder::new("ct_join_twice", &env)
        .dnodes(2)
        .start(env.controller(), env.connector())
        .await
        .unwrap();

    let err = cluster.join_node(2).await.unwrap_err();
    assert!(
        matches!(err, ClusterTestError::Join(JoinError::AlreadyMember(_))),
        "{err}"
    );

    cluster.promote_mnode(2).await.unwrap();
    assert!(cluster.promote_mnode(2).await.unwrap_err().is_already_member());

    cluster.teardown().await;
}
