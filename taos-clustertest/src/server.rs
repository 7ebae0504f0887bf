use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cluster::Node;
use crate::error::ProcessError;

/// Lifecycle operations on the dnodes of a cluster.
///
/// Implementations must not return from [`start`](NodeController::start) before the node accepts
/// connections, and must not return from [`stop`](NodeController::stop) before the process is
/// gone, so that callers can sequence joins and restarts on these calls alone.
#[async_trait]
pub trait NodeController: Send {
    /// Writes the node's configuration and creates its directories.
    async fn deploy(&mut self, node: &Node) -> Result<(), ProcessError>;

    async fn start(&mut self, node: &Node) -> Result<(), ProcessError>;

    async fn stop(&mut self, node: &Node) -> Result<(), ProcessError>;
}

/// Wrapper for a single process.
pub struct ProcessHandle {
    /// Child process handle running the command. None if not currently running
    process: Option<Child>,
    /// The name of the process
    name: String,
}

impl ProcessHandle {
    fn start_process(binary: &Path, args: &[String], name: String) -> Result<Self, ProcessError> {
        let process = Command::new(binary)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                name: name.clone(),
                binary: binary.to_owned(),
                source,
            })?;

        Ok(Self {
            process: Some(process),
            name,
        })
    }

    pub async fn kill(&mut self) -> std::io::Result<()> {
        if let Some(mut process) = self.process.take() {
            process.kill().await?;
        } else {
            debug!(name = %self.name, "Tried to kill process that is not alive");
        }
        Ok(())
    }

    /// Returns the exit status if the process has exited since it was started. A reaped child is
    /// dropped from the handle, so a later [`kill`](Self::kill) is a no-op.
    pub fn exit_status(&mut self) -> Option<String> {
        let status = match self.process.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => status.to_string(),
            Some(Err(e)) => e.to_string(),
            Some(Ok(None)) => return None,
            None => return Some("not running".to_owned()),
        };
        self.process = None;
        Some(status)
    }

    pub fn check_alive(&mut self) -> bool {
        self.exit_status().is_none()
    }
}

/// Manages running a taosd binary with the correct arguments.
pub struct TaosdBuilder {
    /// Path to the taosd binary.
    binary: PathBuf,

    /// The arguments to pass to the taosd process on startup.
    args: Vec<String>,
}

impl TaosdBuilder {
    pub fn new(binary: &Path) -> Self {
        Self {
            binary: binary.to_owned(),
            args: vec![],
        }
    }

    pub fn start(&self, name: String) -> Result<ProcessHandle, ProcessError> {
        ProcessHandle::start_process(&self.binary, &self.args, name)
    }

    fn push_arg_kv(mut self, arg_name: &str, arg_value: &str) -> Self {
        self.args.push(arg_name.to_string());
        self.args.push(arg_value.to_string());
        self
    }

    pub fn config_dir(self, dir: &Path) -> Self {
        self.push_arg_kv("-c", &dir.display().to_string())
    }
}

/// Runs every dnode as a local `taosd` child process.
pub struct TaosdController {
    binary: PathBuf,
    start_timeout: Duration,
    poll_interval: Duration,
    processes: HashMap<usize, ProcessHandle>,
}

impl TaosdController {
    pub fn new(binary: PathBuf, start_timeout: Duration) -> Self {
        Self {
            binary,
            start_timeout,
            poll_interval: Duration::from_millis(200),
            processes: HashMap::new(),
        }
    }

    /// Waits for `node` to accept TCP connections on its server port, failing early if the
    /// process exits.
    async fn wait_for_port(&mut self, node: &Node) -> Result<(), ProcessError> {
        let addr = (node.fqdn.clone(), node.server_port);
        let poll_interval = self.poll_interval;
        let start_timeout = self.start_timeout;
        let Some(handle) = self.processes.get_mut(&node.index) else {
            return Err(ProcessError::NotDeployed(node.index));
        };

        let port_poller = async {
            loop {
                if let Some(status) = handle.exit_status() {
                    return Err(ProcessError::ExitedEarly {
                        node: node.index,
                        status,
                    });
                }
                if TcpStream::connect(addr.clone()).await.is_ok() {
                    return Ok(());
                }
                debug!(
                    node = node.index,
                    "dnode not accepting connections. Sleeping for {poll_interval:?}"
                );
                sleep(poll_interval).await;
            }
        };

        tokio::time::timeout(start_timeout, port_poller)
            .await
            .map_err(|_| ProcessError::StartTimeout {
                node: node.index,
                port: node.server_port,
                timeout_ms: start_timeout.as_millis(),
            })?
    }
}

#[async_trait]
impl NodeController for TaosdController {
    async fn deploy(&mut self, node: &Node) -> Result<(), ProcessError> {
        let config_err = |path: &Path| {
            let path = path.to_owned();
            move |source| ProcessError::Config {
                node: node.index,
                path,
                source,
            }
        };

        for dir in [node.cfg_dir(), node.data_dir(), node.log_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(config_err(dir.as_path()))?;
        }
        let cfg_file = node.cfg_dir().join("taos.cfg");
        tokio::fs::write(&cfg_file, node.render_config())
            .await
            .map_err(config_err(cfg_file.as_path()))?;

        debug!(node = node.index, cfg = %cfg_file.display(), "Deployed dnode");
        Ok(())
    }

    async fn start(&mut self, node: &Node) -> Result<(), ProcessError> {
        let running = self
            .processes
            .get_mut(&node.index)
            .is_some_and(ProcessHandle::check_alive);
        if running {
            warn!(node = node.index, "dnode already running, waiting for it to accept connections");
        } else {
            let handle = TaosdBuilder::new(&self.binary)
                .config_dir(&node.cfg_dir())
                .start(format!("taosd-dnode{}", node.index))?;
            self.processes.insert(node.index, handle);
        }

        // A dnode that never came up is killed, so the next start spawns it afresh.
        if let Err(e) = self.wait_for_port(node).await {
            if let Some(handle) = self.processes.get_mut(&node.index) {
                if let Err(error) = handle.kill().await {
                    warn!(node = node.index, %error, "Failed to kill dnode after failed start");
                }
            }
            return Err(e);
        }
        info!(node = node.index, endpoint = %node.endpoint(), "dnode started");
        Ok(())
    }

    async fn stop(&mut self, node: &Node) -> Result<(), ProcessError> {
        match self.processes.get_mut(&node.index) {
            Some(handle) => handle.kill().await.map_err(|source| ProcessError::Kill {
                node: node.index,
                source,
            })?,
            None => return Err(ProcessError::NotDeployed(node.index)),
        }
        info!(node = node.index, endpoint = %node.endpoint(), "dnode stopped");
        Ok(())
    }
}
