//! A local multi-process cluster test framework for taosd. It deploys a number of dnodes on one
//! host, joins them into a cluster, promotes some of them to mnodes and then perturbs the cluster
//! (stopping and restarting dnodes) while checking that mnode leadership converges again.
//!
//! The framework talks to the cluster through two narrow interfaces:
//!   * [`NodeController`] deploys, starts and stops a dnode. [`TaosdController`] runs each dnode as
//!     a local `taosd` child process.
//!   * [`SqlClient`] executes a statement and returns its rows. [`ShellClient`] drives the `taos`
//!     shell, [`RestClient`] the REST endpoint of a `taosadapter`.
//!
//! # Preparing to run clustertests
//!
//! Clustertests need `taosd` and `taos` binaries. Every setting is read from the environment,
//! see [`Env`]:
//!
//! * `BINARY_PATH`: directory containing `taosd` and `taos`, defaults to `/usr/bin`.
//!
//! * `SIM_DIR`: directory under which each deployment writes its dnode config, data and logs,
//!   defaults to `$TMPDIR/taos-clustertest`.
//!
//! * `FQDN`: the fqdn every dnode is configured with, defaults to the host name.
//!
//! * `BASE_PORT`: `serverPort` of the first dnode, defaults to `6030`. Dnode `i` listens on
//!   `BASE_PORT + (i - 1) * 100`.
//!
//! * `CLIENT`: `shell` (default) or `rest`.
//!
//! * `REST_PORT`, `TAOS_USER`, `TAOS_PASSWORD`: REST client settings.
//!
//! * `RUN_CLUSTER_TESTS`: the `#[clustertest]` tests in this crate are skipped unless set.
//!
//! ```bash
//! BINARY_PATH=~/TDengine/debug/build/bin RUN_CLUSTER_TESTS=1 cargo test -p taos-clustertest
//! LOG_LEVEL=debug taos-clustertest run 5dnode3mnode_restart
//! ```
//!
//! # Anatomy of a clustertest
//!
//! ```no_run
//! use taos_clustertest::*;
//!
//! async fn five_dnodes_three_mnodes() -> Result<(), ClusterTestError> {
//!     let env = Env::from_env().unwrap();
//!     let mut cluster = ClusterBuilder::new("ct_example", &env)
//!         .dnodes(5)
//!         .start(env.controller(), env.connector())
//!         .await?;
//!
//!     cluster.promote_mnode(2).await?;
//!     cluster.promote_mnode(3).await?;
//!     let target = ConvergenceTarget::leader_with_followers(3);
//!     cluster.await_convergence(&target).await.into_result(&target)?;
//!
//!     cluster.restart_node(2).await?;
//!     cluster.await_convergence(&target).await.into_result(&target)?;
//!
//!     cluster.teardown().await;
//!     Ok(())
//! }
//! ```

// Lets `#[clustertest]` expansions name this crate from its own tests.
extern crate self as taos_clustertest;

pub mod client;
pub mod cluster;
pub mod error;
pub mod logging;
pub mod observation;
pub mod poller;
pub mod registry;
pub mod scenario;
pub mod server;

#[cfg(test)]
mod clustertests;
#[cfg(test)]
mod sim;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub use crate::client::{
    Connector, RestClient, RestConnector, ResultSet, ShellClient, ShellConnector, SqlClient,
};
pub use crate::cluster::{Cluster, Node, NodeState};
pub use crate::error::{ClusterTestError, JoinError, Membership, ProcessError, QueryError};
pub use crate::observation::{
    ConvergenceTarget, DnodeObservation, ExpectedState, NodeStatus, Role, RoleObservation,
};
pub use crate::poller::{Convergence, PollOptions};
pub use crate::registry::ScenarioRegistry;
pub use crate::scenario::{Scenario, ScenarioContext, ScenarioFailure, ScenarioReport, TimeoutPolicy};
pub use crate::server::{NodeController, TaosdController};

/// Which [`SqlClient`] implementation to drive the cluster with.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    #[default]
    Shell,
    Rest,
}

/// The set of environment variables that configure a deployment. Each variable is the upper case
/// of its respective struct field, i.e. BINARY_PATH.
#[derive(Deserialize, Debug, Clone)]
pub struct Env {
    #[serde(default = "default_binary_path")]
    pub binary_path: PathBuf,
    #[serde(default = "default_sim_dir")]
    pub sim_dir: PathBuf,
    #[serde(default = "default_fqdn")]
    pub fqdn: String,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default)]
    pub client: ClientKind,
    #[serde(default = "default_rest_port")]
    pub rest_port: u16,
    #[serde(default = "default_taos_user")]
    pub taos_user: String,
    #[serde(default = "default_taos_password")]
    pub taos_password: String,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

fn default_binary_path() -> PathBuf {
    "/usr/bin".into()
}

fn default_sim_dir() -> PathBuf {
    std::env::temp_dir().join("taos-clustertest")
}

fn default_fqdn() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_base_port() -> u16 {
    6030
}

fn default_rest_port() -> u16 {
    6041
}

fn default_taos_user() -> String {
    "root".to_string()
}

fn default_taos_password() -> String {
    "taosdata".to_string()
}

fn default_start_timeout_secs() -> u64 {
    30
}

impl Env {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env::<Env>()
    }

    pub fn taosd_path(&self) -> PathBuf {
        self.binary_path.join("taosd")
    }

    pub fn taos_path(&self) -> PathBuf {
        self.binary_path.join("taos")
    }

    pub fn controller(&self) -> Box<dyn NodeController> {
        Box::new(TaosdController::new(
            self.taosd_path(),
            Duration::from_secs(self.start_timeout_secs),
        ))
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        match self.client {
            ClientKind::Shell => Box::new(ShellConnector {
                binary: self.taos_path(),
            }),
            ClientKind::Rest => Box::new(RestConnector {
                port: self.rest_port,
                user: self.taos_user.clone(),
                password: self.taos_password.clone(),
            }),
        }
    }
}

/// Bounded retries for membership commands that fail to reach the bootstrap endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRetry {
    pub attempts: usize,
    pub interval: Duration,
}

impl Default for JoinRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(1),
        }
    }
}

/// Set of parameters defining a cluster's topology.
#[must_use]
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    /// Name of the deployment; its files live in `<sim_dir>/<name><random suffix>`.
    name: String,
    dnodes: usize,
    base_port: u16,
    fqdn: String,
    sim_dir: PathBuf,
    extra_cfg: BTreeMap<String, String>,
    poll: PollOptions,
    join_retry: JoinRetry,
    keep_files: bool,
}

impl ClusterBuilder {
    pub fn new(name: &str, env: &Env) -> Self {
        // Append the deployment name with a random number to prevent state collisions
        // on test repeats with failed teardowns.
        let mut rng = rand::thread_rng();
        let name = name.to_string() + &rng.gen::<u32>().to_string();

        Self {
            sim_dir: env.sim_dir.join(&name),
            name,
            dnodes: 1,
            base_port: env.base_port,
            fqdn: env.fqdn.clone(),
            extra_cfg: BTreeMap::new(),
            poll: PollOptions::default(),
            join_retry: JoinRetry::default(),
            keep_files: false,
        }
    }

    /// The number of dnodes to deploy. The first one is the bootstrap endpoint.
    pub fn dnodes(mut self, dnodes: usize) -> Self {
        self.dnodes = dnodes;
        self
    }

    pub fn base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    pub fn fqdn(mut self, fqdn: &str) -> Self {
        self.fqdn = fqdn.to_string();
        self
    }

    /// Adds `key value` to the `taos.cfg` of every dnode.
    pub fn extra_cfg(mut self, key: &str, value: &str) -> Self {
        self.extra_cfg.insert(key.to_string(), value.to_string());
        self
    }

    /// How often and how long to poll while waiting for the cluster to converge.
    pub fn poll_options(mut self, poll: PollOptions) -> Self {
        self.poll = poll;
        self
    }

    pub fn join_retry(mut self, join_retry: JoinRetry) -> Self {
        self.join_retry = join_retry;
        self
    }

    /// Keep the deployment's config, data and log files after teardown.
    pub fn keep_files(mut self, keep_files: bool) -> Self {
        self.keep_files = keep_files;
        self
    }

    pub fn dnode_count(&self) -> usize {
        self.dnodes
    }

    /// Lays out the cluster without touching the filesystem or starting anything.
    pub fn allocate(&self) -> Result<Cluster, ClusterTestError> {
        let mut cluster = Cluster::allocate(self.dnodes, self.base_port, &self.fqdn, &self.sim_dir)?;
        for (key, value) in &self.extra_cfg {
            cluster.set_extra_cfg(key, value);
        }
        Ok(cluster)
    }

    /// Deploys and starts every dnode, joins dnodes 2..=n through the bootstrap endpoint and
    /// waits for all of them to report `ready`.
    pub async fn start(
        self,
        mut controller: Box<dyn NodeController>,
        connector: Box<dyn Connector>,
    ) -> Result<ClusterHandle, ClusterTestError> {
        let mut cluster = self.allocate()?;
        info!(name = %self.name, dnodes = cluster.len(), "Starting cluster");

        deploy_all(&mut cluster, controller.as_mut()).await?;

        let bootstrap = cluster
            .bootstrap()
            .ok_or_else(|| ClusterTestError::PortRange {
                nodes: 0,
                base_port: self.base_port,
            })?
            .clone();
        let mut client = connector.connect(&bootstrap).await?;

        for node in cluster.nodes().iter().skip(1) {
            match join_node(client.as_mut(), node, self.join_retry).await {
                Ok(()) => {}
                // A retried join whose first attempt went through.
                Err(e) if e.is_already_member() => debug!(node = node.index, "{e}"),
                Err(e) => return Err(e.into()),
            }
        }

        let mut handle = ClusterHandle {
            name: self.name,
            cluster,
            controller,
            connector,
            client,
            client_node: bootstrap.index,
            poll: self.poll,
            join_retry: self.join_retry,
            sim_dir: self.sim_dir,
            keep_files: self.keep_files,
            shutdown: false,
        };

        let dnodes = handle.await_dnodes_ready().await;
        if !dnodes.converged {
            return Err(ClusterTestError::AssertionMismatch {
                step: "waiting for dnodes".into(),
                detail: format!(
                    "{} dnodes not ready after {} attempts, last: {:?}",
                    handle.cluster.len(),
                    dnodes.attempts,
                    dnodes.last
                ),
                observation: None,
            });
        }
        info!(name = %handle.name, "Cluster with {} dnodes ready", handle.cluster.len());
        Ok(handle)
    }
}

/// Deploys and starts every node in order. The first failure aborts; nothing is joined until
/// every node is up.
pub async fn deploy_all(
    cluster: &mut Cluster,
    controller: &mut dyn NodeController,
) -> Result<(), ClusterTestError> {
    for idx in 1..=cluster.len() {
        let Some(node) = cluster.node_mut(idx) else {
            continue;
        };
        controller
            .deploy(node)
            .await
            .map_err(|source| ClusterTestError::Deployment { node: idx, source })?;
        node.state = NodeState::Deployed;
    }
    for idx in 1..=cluster.len() {
        let Some(node) = cluster.node_mut(idx) else {
            continue;
        };
        controller
            .start(node)
            .await
            .map_err(|source| ClusterTestError::Deployment { node: idx, source })?;
        node.state = NodeState::Running;
    }
    Ok(())
}

/// Runs a membership statement, retrying while the endpoint is unreachable.
async fn add_member(
    client: &mut dyn SqlClient,
    sql: &str,
    target: Membership,
    retry: JoinRetry,
) -> Result<(), JoinError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.query(sql).await {
            Ok(_) => {
                info!(%target, "Added to cluster");
                return Ok(());
            }
            Err(e) if e.is_already_exists() => return Err(JoinError::AlreadyMember(target)),
            Err(e) if e.is_connection() => {
                if attempt >= retry.attempts {
                    return Err(JoinError::Unreachable {
                        target,
                        attempts: attempt,
                        source: e,
                    });
                }
                warn!(%target, attempt, error = %e, "Retrying membership command");
                sleep(retry.interval).await;
            }
            Err(source) => return Err(JoinError::Rejected { target, source }),
        }
    }
}

/// Issues `CREATE DNODE "<fqdn>:<port>"` for `node` through `client`.
pub async fn join_node(
    client: &mut dyn SqlClient,
    node: &Node,
    retry: JoinRetry,
) -> Result<(), JoinError> {
    let endpoint = node.endpoint();
    let sql = format!("CREATE DNODE \"{endpoint}\"");
    add_member(client, &sql, Membership::Dnode(endpoint), retry).await
}

/// A handle to a running cluster created with [`ClusterBuilder::start`].
///
/// Dropping the handle kills every dnode process; [`ClusterHandle::teardown`] additionally removes
/// the deployment's files.
pub struct ClusterHandle {
    name: String,
    cluster: Cluster,
    controller: Box<dyn NodeController>,
    connector: Box<dyn Connector>,
    /// Connection used for every statement, attached to `client_node`.
    client: Box<dyn SqlClient>,
    client_node: usize,
    poll: PollOptions,
    join_retry: JoinRetry,
    sim_dir: PathBuf,
    keep_files: bool,
    /// True if this cluster has already been torn down.
    shutdown: bool,
}

impl ClusterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn poll_options(&self) -> PollOptions {
        self.poll
    }

    /// The index of the dnode the client is currently attached to.
    pub fn client_node(&self) -> usize {
        self.client_node
    }

    pub fn client(&mut self) -> &mut dyn SqlClient {
        self.client.as_mut()
    }

    fn node(&self, index: usize) -> Result<Node, ClusterTestError> {
        self.cluster
            .node(index)
            .cloned()
            .ok_or(ClusterTestError::ProcessControl {
                node: index,
                source: ProcessError::NotDeployed(index),
            })
    }

    /// Runs a membership statement on the bootstrap dnode, connecting to it separately when the
    /// client has moved elsewhere.
    async fn add_via_bootstrap(&mut self, sql: &str, target: Membership) -> Result<(), JoinError> {
        let bootstrap = match self.cluster.bootstrap() {
            Some(node) if node.index != self.client_node => node.clone(),
            _ => return add_member(self.client.as_mut(), sql, target, self.join_retry).await,
        };
        debug!(bootstrap = %bootstrap.endpoint(), %target, "Connecting to bootstrap dnode");
        let mut client = match self.connector.connect(&bootstrap).await {
            Ok(client) => client,
            Err(source) => {
                return Err(JoinError::Unreachable {
                    target,
                    attempts: 1,
                    source,
                })
            }
        };
        add_member(client.as_mut(), sql, target, self.join_retry).await
    }

    /// Issues `CREATE DNODE` for an allocated node through the bootstrap dnode. Fails with
    /// [`JoinError::AlreadyMember`] if the node has already joined.
    pub async fn join_node(&mut self, index: usize) -> Result<(), ClusterTestError> {
        let node = self.node(index)?;
        let endpoint = node.endpoint();
        let sql = format!("CREATE DNODE \"{endpoint}\"");
        self.add_via_bootstrap(&sql, Membership::Dnode(endpoint)).await?;
        Ok(())
    }

    /// Issues `CREATE MNODE ON DNODE <dnode_id>` through the bootstrap dnode. Fails with
    /// [`JoinError::AlreadyMember`] if the dnode already hosts an mnode.
    pub async fn promote_mnode(&mut self, dnode_id: u32) -> Result<(), JoinError> {
        let sql = format!("CREATE MNODE ON DNODE {dnode_id}");
        self.add_via_bootstrap(&sql, Membership::Mnode(dnode_id)).await
    }

    /// Moves the client to the first running dnode other than `avoid`.
    async fn reattach_client(&mut self, avoid: usize) -> Result<(), ClusterTestError> {
        let mut last_err = None;
        let candidates: Vec<Node> = self
            .cluster
            .nodes()
            .iter()
            .filter(|n| n.index != avoid && n.state == NodeState::Running)
            .cloned()
            .collect();
        for node in candidates {
            match self.connector.connect(&node).await {
                Ok(client) => {
                    debug!(from = self.client_node, to = node.index, "Reattached client");
                    self.client = client;
                    self.client_node = node.index;
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            // No other dnode is running; keep the current client.
            None => Ok(()),
        }
    }

    /// Stops a dnode. If the client is attached to it, the client moves to another running dnode
    /// first.
    pub async fn stop_node(&mut self, index: usize) -> Result<(), ClusterTestError> {
        let node = self.node(index)?;
        if self.client_node == index {
            if let Err(e) = self.reattach_client(index).await {
                warn!(node = index, error = %e, "Could not move client off stopping dnode");
            }
        }
        self.controller
            .stop(&node)
            .await
            .map_err(|source| ClusterTestError::ProcessControl {
                node: index,
                source,
            })?;
        if let Some(n) = self.cluster.node_mut(index) {
            n.state = NodeState::Stopped;
        }
        Ok(())
    }

    pub async fn start_node(&mut self, index: usize) -> Result<(), ClusterTestError> {
        let node = self.node(index)?;
        self.controller
            .start(&node)
            .await
            .map_err(|source| ClusterTestError::ProcessControl {
                node: index,
                source,
            })?;
        if let Some(n) = self.cluster.node_mut(index) {
            n.state = NodeState::Running;
        }
        Ok(())
    }

    /// Stops and then starts a dnode. The stop completes before the start is issued.
    pub async fn restart_node(&mut self, index: usize) -> Result<(), ClusterTestError> {
        self.stop_node(index).await?;
        self.start_node(index).await
    }

    pub async fn observe_mnodes(&mut self) -> Result<RoleObservation, QueryError> {
        poller::observe_mnodes(self.client.as_mut()).await
    }

    pub async fn observe_dnodes(&mut self) -> Result<DnodeObservation, QueryError> {
        poller::observe_dnodes(self.client.as_mut()).await
    }

    pub async fn await_convergence(
        &mut self,
        target: &ConvergenceTarget,
    ) -> Convergence<RoleObservation> {
        poller::await_convergence(self.client.as_mut(), target, self.poll).await
    }

    /// Waits until every dnode of the cluster is registered and `ready`.
    pub async fn await_dnodes_ready(&mut self) -> Convergence<DnodeObservation> {
        let expected = self.cluster.len();
        poller::await_dnodes_ready(self.client.as_mut(), expected, self.poll).await
    }

    /// Tears down any resources associated with the cluster.
    pub async fn teardown(&mut self) {
        if self.shutdown {
            return;
        }

        // Drop any errors on failure to stop so we complete cleanup.
        for idx in 1..=self.cluster.len() {
            let Some(node) = self.cluster.node(idx).cloned() else {
                continue;
            };
            if node.state != NodeState::Running {
                continue;
            }
            if let Err(e) = self.controller.stop(&node).await {
                warn!(node = idx, error = %e, "Failed to stop dnode during teardown");
            }
            if let Some(n) = self.cluster.node_mut(idx) {
                n.state = NodeState::Stopped;
            }
        }

        if !self.keep_files {
            if let Err(e) = tokio::fs::remove_dir_all(&self.sim_dir).await {
                debug!(dir = %self.sim_dir.display(), error = %e, "Could not remove deployment files");
            }
        }

        self.shutdown = true;
        info!(name = %self.name, "Cluster torn down");
    }
}

impl Drop for ClusterHandle {
    fn drop(&mut self) {
        if self.shutdown {
            return;
        }
        // Every dnode process is killed when the controller drops.
        warn!(name = %self.name, "Cluster dropped without teardown");
        if !self.keep_files {
            let _ = std::fs::remove_dir_all(&self.sim_dir);
        }
    }
}
