//! An in-memory stand-in for a taosd cluster, implementing [`NodeController`] and [`Connector`] so
//! the builder, poller and scenarios can be exercised without binaries.
//!
//! Elections are driven by `SHOW MNODES`: every such statement advances the simulation by one
//! tick. A stopped leader leaves the cluster leaderless for `election_delay` ticks, after which the
//! highest-id running mnode takes over, provided a majority of mnodes is running. A freshly
//! created or restarted mnode reports `candidate` for `sync_delay` ticks.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::client::{Connector, ResultSet, SqlClient};
use crate::cluster::Node;
use crate::error::{ProcessError, QueryError};
use crate::scenario::{ScenarioContext, TimeoutPolicy};
use crate::{ClusterBuilder, ClientKind, Env, PollOptions};

#[derive(Debug)]
struct SimMnode {
    dnode_id: u32,
    syncing: usize,
}

#[derive(Debug, Default)]
pub struct SimState {
    deployed: BTreeSet<String>,
    running: BTreeSet<String>,
    started: BTreeSet<String>,
    /// Joined endpoints; dnode id is position + 1.
    dnodes: Vec<String>,
    mnodes: Vec<SimMnode>,
    leader: Option<u32>,
    election_ticks: usize,

    pub election_delay: usize,
    pub sync_delay: usize,
    /// Injected start failures per node index.
    pub fail_start: HashMap<usize, usize>,
    /// Like `fail_start`, but only for nodes that have been started before.
    pub fail_restart: HashMap<usize, usize>,
    /// Number of upcoming statements that fail with a connection error.
    pub refuse_statements: usize,
    /// Accept `CREATE MNODE` on a dnode that already hosts one.
    pub duplicate_promote_succeeds: bool,
    /// Lifecycle operations and statements, in order.
    pub events: Vec<String>,
    /// Every statement with the endpoint it was sent to.
    pub statements: Vec<(String, String)>,
}

impl SimState {
    fn dnode_id(&self, endpoint: &str) -> Option<u32> {
        self.dnodes
            .iter()
            .position(|ep| ep == endpoint)
            .map(|i| i as u32 + 1)
    }

    fn endpoint_of(&self, dnode_id: u32) -> Option<&str> {
        self.dnodes
            .get((dnode_id as usize).checked_sub(1)?)
            .map(String::as_str)
    }

    fn is_running(&self, dnode_id: u32) -> bool {
        self.endpoint_of(dnode_id)
            .map(|ep| self.running.contains(ep))
            .unwrap_or(false)
    }

    fn tick(&mut self) {
        let running: Vec<bool> = self
            .mnodes
            .iter()
            .map(|m| self.is_running(m.dnode_id))
            .collect();
        for (mnode, up) in self.mnodes.iter_mut().zip(&running) {
            if *up && mnode.syncing > 0 {
                mnode.syncing -= 1;
            }
        }

        if self.leader.is_some() {
            return;
        }
        let alive = running.iter().filter(|up| **up).count();
        if alive * 2 <= self.mnodes.len() {
            return;
        }
        if self.election_ticks > 0 {
            self.election_ticks -= 1;
            return;
        }
        self.leader = self
            .mnodes
            .iter()
            .zip(&running)
            .filter(|(_, up)| **up)
            .map(|(m, _)| m.dnode_id)
            .max();
    }

    fn role(&self, mnode: &SimMnode) -> &'static str {
        if !self.is_running(mnode.dnode_id) {
            "offline"
        } else if self.leader == Some(mnode.dnode_id) {
            "leader"
        } else if self.leader.is_none() || mnode.syncing > 0 {
            "candidate"
        } else {
            "follower"
        }
    }

    fn status(&self, dnode_id: u32) -> &'static str {
        if self.is_running(dnode_id) {
            "ready"
        } else {
            "offline"
        }
    }

    fn show_mnodes(&mut self) -> ResultSet {
        self.tick();
        ResultSet {
            columns: ["id", "endpoint", "role", "status", "create_time"]
                .map(String::from)
                .to_vec(),
            rows: self
                .mnodes
                .iter()
                .map(|m| {
                    vec![
                        m.dnode_id.to_string(),
                        self.endpoint_of(m.dnode_id).unwrap_or_default().to_owned(),
                        self.role(m).to_owned(),
                        self.status(m.dnode_id).to_owned(),
                        "2022-06-01 00:00:00.000".to_owned(),
                    ]
                })
                .collect(),
        }
    }

    fn show_dnodes(&self) -> ResultSet {
        ResultSet {
            columns: ["id", "endpoint", "vnodes", "support_vnodes", "status"]
                .map(String::from)
                .to_vec(),
            rows: self
                .dnodes
                .iter()
                .enumerate()
                .map(|(i, ep)| {
                    vec![
                        (i + 1).to_string(),
                        ep.clone(),
                        "0".to_owned(),
                        "1024".to_owned(),
                        self.status(i as u32 + 1).to_owned(),
                    ]
                })
                .collect(),
        }
    }

    fn server_error(message: &str) -> QueryError {
        QueryError::Server {
            code: None,
            message: message.to_owned(),
        }
    }

    fn execute(&mut self, endpoint: &str, sql: &str) -> Result<ResultSet, QueryError> {
        let sql = sql.trim().trim_end_matches(';').trim();
        self.events.push(format!("sql {sql}"));
        self.statements.push((endpoint.to_owned(), sql.to_owned()));
        if !self.running.contains(endpoint) {
            return Err(QueryError::Connection {
                endpoint: endpoint.to_owned(),
                message: "Unable to establish connection".into(),
            });
        }
        if self.refuse_statements > 0 {
            self.refuse_statements -= 1;
            return Err(QueryError::Connection {
                endpoint: endpoint.to_owned(),
                message: "Unable to establish connection".into(),
            });
        }

        let upper = sql.to_ascii_uppercase();
        if upper == "SELECT SERVER_STATUS()" {
            Ok(ResultSet {
                columns: vec!["server_status()".into()],
                rows: vec![vec!["1".into()]],
            })
        } else if upper == "SHOW MNODES" {
            Ok(self.show_mnodes())
        } else if upper == "SHOW DNODES" {
            Ok(self.show_dnodes())
        } else if let Some(rest) = upper.strip_prefix("CREATE DNODE ") {
            let new = rest.trim().trim_matches('"').to_ascii_lowercase();
            if self.dnode_id(&new).is_some() {
                return Err(Self::server_error("Dnode already exists"));
            }
            self.dnodes.push(new);
            Ok(ResultSet::default())
        } else if let Some(rest) = upper.strip_prefix("CREATE MNODE ON DNODE ") {
            let dnode_id: u32 = rest
                .trim()
                .parse()
                .map_err(|_| Self::server_error("syntax error"))?;
            if self.endpoint_of(dnode_id).is_none() {
                return Err(Self::server_error("Dnode does not exist"));
            }
            if self.mnodes.iter().any(|m| m.dnode_id == dnode_id) {
                return if self.duplicate_promote_succeeds {
                    Ok(ResultSet::default())
                } else {
                    Err(QueryError::Server {
                        code: Some(0x80000350),
                        message: "Mnode already exists".into(),
                    })
                };
            }
            if !self.is_running(dnode_id) {
                return Err(Self::server_error("Dnode is offline"));
            }
            self.mnodes.push(SimMnode {
                dnode_id,
                syncing: self.sync_delay,
            });
            Ok(ResultSet::default())
        } else {
            Err(Self::server_error(&format!("syntax error near '{sql}'")))
        }
    }
}

/// Shared handle to a simulated cluster.
#[derive(Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                election_delay: 2,
                sync_delay: 1,
                ..SimState::default()
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn controller(&self) -> SimController {
        SimController {
            state: self.state.clone(),
        }
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            state: self.state.clone(),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn running(&self) -> usize {
        self.state().running.len()
    }

    pub fn env() -> Env {
        Env {
            binary_path: "/nonexistent".into(),
            sim_dir: std::env::temp_dir().join("taos-clustertest-sim"),
            fqdn: "sim".into(),
            base_port: 6030,
            client: ClientKind::Shell,
            rest_port: 6041,
            taos_user: "root".into(),
            taos_password: "taosdata".into(),
            start_timeout_secs: 1,
        }
    }

    pub fn builder(&self) -> ClusterBuilder {
        ClusterBuilder::new("sim", &Self::env()).poll_options(PollOptions::default())
    }

    pub fn context(&self, policy: TimeoutPolicy) -> ScenarioContext {
        ScenarioContext {
            builder: self.builder(),
            controller: Box::new(self.controller()),
            connector: Box::new(self.connector()),
            policy,
        }
    }
}

pub struct SimController {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl crate::server::NodeController for SimController {
    async fn deploy(&mut self, node: &Node) -> Result<(), ProcessError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.events.push(format!("deploy {}", node.index));
        state.deployed.insert(node.endpoint());
        Ok(())
    }

    async fn start(&mut self, node: &Node) -> Result<(), ProcessError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.events.push(format!("start {}", node.index));
        let endpoint = node.endpoint();
        if !state.deployed.contains(&endpoint) {
            return Err(ProcessError::NotDeployed(node.index));
        }
        let injected = if state.started.contains(&endpoint) {
            &mut state.fail_restart
        } else {
            &mut state.fail_start
        };
        if let Some(failures) = injected.get_mut(&node.index) {
            if *failures > 0 {
                *failures -= 1;
                return Err(ProcessError::ExitedEarly {
                    node: node.index,
                    status: "exit status: 1".into(),
                });
            }
        }
        state.started.insert(endpoint.clone());
        state.running.insert(endpoint.clone());

        if node.is_bootstrap() && state.dnodes.is_empty() {
            state.dnodes.push(endpoint.clone());
            state.mnodes.push(SimMnode {
                dnode_id: 1,
                syncing: 0,
            });
            state.leader = Some(1);
        }
        let sync_delay = state.sync_delay;
        let leader = state.leader;
        if let Some(id) = state.dnode_id(&endpoint) {
            if let Some(mnode) = state.mnodes.iter_mut().find(|m| m.dnode_id == id) {
                if leader != Some(id) {
                    mnode.syncing = sync_delay;
                }
            }
        }
        Ok(())
    }

    async fn stop(&mut self, node: &Node) -> Result<(), ProcessError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.events.push(format!("stop {}", node.index));
        let endpoint = node.endpoint();
        if !state.deployed.contains(&endpoint) {
            return Err(ProcessError::NotDeployed(node.index));
        }
        state.running.remove(&endpoint);
        if state.leader.is_some() && state.leader == state.dnode_id(&endpoint) {
            state.leader = None;
            state.election_ticks = state.election_delay;
        }
        Ok(())
    }
}

pub struct SimConnector {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn SqlClient>, QueryError> {
        let mut client = SimClient {
            state: self.state.clone(),
            endpoint: node.endpoint(),
        };
        client.query("SELECT SERVER_STATUS()").await?;
        Ok(Box::new(client))
    }
}

pub struct SimClient {
    state: Arc<Mutex<SimState>>,
    endpoint: String,
}

#[async_trait]
impl SqlClient for SimClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(&mut self, sql: &str) -> Result<ResultSet, QueryError> {
        self.state.lock().unwrap().execute(&self.endpoint, sql)
    }
}
