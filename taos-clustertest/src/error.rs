use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::observation::RoleObservation;

/// Failures of the node process lifecycle: writing a node's config, spawning `taosd`, waiting
/// for it to accept connections, and killing it again.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to write config for dnode {node} at `{}`: {source}", .path.display())]
    Config {
        node: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start {name}. Does it exist at `{}`? Err: {source}", .binary.display())]
    Spawn {
        name: String,
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dnode {node} did not accept connections on port {port} within {timeout_ms}ms")]
    StartTimeout {
        node: usize,
        port: u16,
        timeout_ms: u128,
    },
    #[error("dnode {node} exited during startup with {status}")]
    ExitedEarly { node: usize, status: String },
    #[error("failed to stop dnode {node}: {source}")]
    Kill {
        node: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("dnode {0} has not been deployed")]
    NotDeployed(usize),
}

/// An error returned by a [`SqlClient`](crate::client::SqlClient).
///
/// `Connection` covers driver level failures (the endpoint could not be reached or the client
/// binary could not be run), which are distinct from the server rejecting a statement.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },
    #[error("server error{}: {message}", .code.map(|c| format!(" {c:#x}")).unwrap_or_default())]
    Server { code: Option<i64>, message: String },
    #[error("failed to parse result of `{sql}`: {message}")]
    Parse { sql: String, message: String },
}

impl QueryError {
    /// Returns true if the server rejected the statement because the object it creates already
    /// exists, e.g. `Dnode already exists` or `Mnode already exists`.
    pub fn is_already_exists(&self) -> bool {
        match self {
            QueryError::Server { message, .. } => {
                message.to_ascii_lowercase().contains("already exist")
            }
            _ => false,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, QueryError::Connection { .. })
    }
}

/// What a membership command was trying to add to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// `CREATE DNODE "<endpoint>"`
    Dnode(String),
    /// `CREATE MNODE ON DNODE <id>`
    Mnode(u32),
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Membership::Dnode(ep) => write!(f, "dnode {ep}"),
            Membership::Mnode(id) => write!(f, "mnode on dnode {id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    /// The target is already a member. Expected when a join is retried.
    #[error("{0} is already a member of the cluster")]
    AlreadyMember(Membership),
    #[error("cluster rejected {target}: {source}")]
    Rejected {
        target: Membership,
        #[source]
        source: QueryError,
    },
    #[error("bootstrap endpoint unreachable while adding {target} after {attempts} attempts: {source}")]
    Unreachable {
        target: Membership,
        attempts: usize,
        #[source]
        source: QueryError,
    },
}

impl JoinError {
    pub fn is_already_member(&self) -> bool {
        matches!(self, JoinError::AlreadyMember(_))
    }
}

#[derive(Debug, Error)]
pub enum ClusterTestError {
    #[error("cannot allocate {nodes} dnodes 100 ports apart starting at port {base_port}")]
    PortRange { nodes: usize, base_port: u16 },
    #[error("deployment of dnode {node} failed: {source}")]
    Deployment {
        node: usize,
        #[source]
        source: ProcessError,
    },
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error("cluster did not converge to {target} after {attempts} attempts")]
    ConvergenceTimeout {
        target: String,
        attempts: usize,
        last: Option<RoleObservation>,
    },
    #[error("{step}: {detail}")]
    AssertionMismatch {
        step: String,
        detail: String,
        observation: Option<RoleObservation>,
    },
    #[error("process control of dnode {node} failed: {source}")]
    ProcessControl {
        node: usize,
        #[source]
        source: ProcessError,
    },
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ClusterTestError {
    /// The observation attached to this error, if any.
    pub fn observation(&self) -> Option<&RoleObservation> {
        match self {
            ClusterTestError::ConvergenceTimeout { last, .. } => last.as_ref(),
            ClusterTestError::AssertionMismatch { observation, .. } => observation.as_ref(),
            _ => None,
        }
    }
}

pub type Result<T, E = ClusterTestError> = std::result::Result<T, E>;
