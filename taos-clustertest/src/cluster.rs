use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ClusterTestError, Result};

/// Spacing between the `serverPort` of consecutive dnodes. Each taosd binds a small range above
/// its server port, so neighbours must not overlap.
pub const PORT_STRIDE: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NotDeployed,
    Deployed,
    Running,
    Stopped,
}

/// A single dnode of the cluster and everything needed to deploy, start and reach it.
#[derive(Debug, Clone)]
pub struct Node {
    /// 1-based index; also the dnode id the cluster assigns when joins happen in order.
    pub index: usize,
    pub fqdn: String,
    pub server_port: u16,
    /// The bootstrap endpoint every node is configured with.
    pub first_ep: String,
    /// Root of this node's files: `cfg/`, `data/` and `log/` live beneath it.
    pub root: PathBuf,
    /// Extra `taos.cfg` entries, applied after the generated ones.
    pub extra_cfg: BTreeMap<String, String>,
    pub state: NodeState,
}

impl Node {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.fqdn, self.server_port)
    }

    pub fn cfg_dir(&self) -> PathBuf {
        self.root.join("cfg")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn is_bootstrap(&self) -> bool {
        self.endpoint() == self.first_ep
    }

    /// The `taos.cfg` entries for this node, in the order they are written.
    pub fn config_entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = vec![
            ("firstEp".into(), self.first_ep.clone()),
            ("fqdn".into(), self.fqdn.clone()),
            ("serverPort".into(), self.server_port.to_string()),
            ("dataDir".into(), self.data_dir().display().to_string()),
            ("logDir".into(), self.log_dir().display().to_string()),
            ("supportVnodes".into(), "1024".into()),
            ("debugFlag".into(), "131".into()),
            ("asyncLog".into(), "0".into()),
        ];
        for (key, value) in &self.extra_cfg {
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value.clone(),
                None => entries.push((key.clone(), value.clone())),
            }
        }
        entries
    }

    /// Renders [`Self::config_entries`] in `taos.cfg` syntax.
    pub fn render_config(&self) -> String {
        self.config_entries()
            .into_iter()
            .map(|(k, v)| format!("{k:<20} {v}\n"))
            .collect()
    }
}

/// An ordered set of dnodes sharing one bootstrap endpoint, the first node's address.
#[derive(Debug, Clone)]
pub struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    /// Lays out `n` nodes on `fqdn`, node `i` (0-based) listening on `base_port + i * 100`.
    /// Performs no I/O.
    pub fn allocate(n: usize, base_port: u16, fqdn: &str, sim_dir: &Path) -> Result<Self> {
        let first_ep = format!("{fqdn}:{base_port}");
        let nodes = (0..n)
            .map(|i| {
                let offset = u16::try_from(i)
                    .ok()
                    .and_then(|i| i.checked_mul(PORT_STRIDE))
                    .and_then(|o| base_port.checked_add(o))
                    .ok_or(ClusterTestError::PortRange {
                        nodes: n,
                        base_port,
                    })?;
                Ok(Node {
                    index: i + 1,
                    fqdn: fqdn.to_owned(),
                    server_port: offset,
                    first_ep: first_ep.clone(),
                    root: sim_dir.join(format!("dnode{}", i + 1)),
                    extra_cfg: BTreeMap::new(),
                    state: NodeState::NotDeployed,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Looks up a node by its 1-based index.
    pub fn node(&self, index: usize) -> Option<&Node> {
        index.checked_sub(1).and_then(|i| self.nodes.get(i))
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        index.checked_sub(1).and_then(|i| self.nodes.get_mut(i))
    }

    /// The node every other node is configured to join through.
    pub fn bootstrap(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.nodes.iter().map(Node::endpoint).collect()
    }

    /// Adds `key value` to the config of every node.
    pub fn set_extra_cfg(&mut self, key: &str, value: &str) {
        for node in &mut self.nodes {
            node.extra_cfg.insert(key.to_owned(), value.to_owned());
        }
    }
}
