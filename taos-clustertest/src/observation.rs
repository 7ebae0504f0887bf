//! Typed snapshots of `SHOW MNODES` and `SHOW DNODES`, and the predicates evaluated against them.
//!
//! Columns are consumed positionally:
//!   * `SHOW MNODES` -> `(id, endpoint, role, status, ...)`
//!   * `SHOW DNODES` -> `(id, endpoint, vnodes, support_vnodes, status, ...)`

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::client::ResultSet;
use crate::error::QueryError;

/// A member's consensus status as reported in the `role` column of `SHOW MNODES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Leader,
    Follower,
    Offline,
    Candidate,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leader" => Ok(Role::Leader),
            "follower" => Ok(Role::Follower),
            "offline" => Ok(Role::Offline),
            "candidate" => Ok(Role::Candidate),
            other => Err(format!("unknown mnode role '{other}'")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
            Role::Offline => "offline",
            Role::Candidate => "candidate",
        })
    }
}

/// The `status` column of `SHOW MNODES` / `SHOW DNODES`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Ready,
    Offline,
    Other(String),
}

impl From<&str> for NodeStatus {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ready" => NodeStatus::Ready,
            "offline" => NodeStatus::Offline,
            _ => NodeStatus::Other(s.trim().to_owned()),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Ready => f.write_str("ready"),
            NodeStatus::Offline => f.write_str("offline"),
            NodeStatus::Other(s) => f.write_str(s),
        }
    }
}

fn column<'a>(sql: &str, row: &'a [String], idx: usize) -> Result<&'a str, QueryError> {
    row.get(idx).map(String::as_str).ok_or_else(|| QueryError::Parse {
        sql: sql.to_owned(),
        message: format!("row has {} columns, expected at least {}", row.len(), idx + 1),
    })
}

fn parse_id(sql: &str, value: &str) -> Result<u32, QueryError> {
    value.trim().parse().map_err(|e| QueryError::Parse {
        sql: sql.to_owned(),
        message: format!("invalid id '{value}': {e}"),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MnodeRow {
    pub id: u32,
    pub endpoint: String,
    pub role: Role,
    pub status: NodeStatus,
}

/// One `SHOW MNODES` snapshot, in the order the server returned the rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleObservation {
    pub rows: Vec<MnodeRow>,
}

impl RoleObservation {
    pub const QUERY: &'static str = "SHOW MNODES";

    pub fn from_result_set(rs: &ResultSet) -> Result<Self, QueryError> {
        let sql = Self::QUERY;
        let rows = rs
            .rows
            .iter()
            .map(|row| {
                Ok(MnodeRow {
                    id: parse_id(sql, column(sql, row, 0)?)?,
                    endpoint: column(sql, row, 1)?.trim().to_owned(),
                    role: column(sql, row, 2)?
                        .parse()
                        .map_err(|message| QueryError::Parse {
                            sql: sql.to_owned(),
                            message,
                        })?,
                    status: column(sql, row, 3)?.into(),
                })
            })
            .collect::<Result<_, QueryError>>()?;
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The multiset of roles in this observation.
    pub fn role_counts(&self) -> BTreeMap<Role, usize> {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.role).or_insert(0) += 1;
        }
        counts
    }

    pub fn row_for(&self, endpoint: &str) -> Option<&MnodeRow> {
        self.rows.iter().find(|r| r.endpoint == endpoint)
    }

    /// The endpoint of the single leader, if there is exactly one.
    pub fn leader(&self) -> Option<&str> {
        let mut leaders = self.rows.iter().filter(|r| r.role == Role::Leader);
        match (leaders.next(), leaders.next()) {
            (Some(l), None) => Some(l.endpoint.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for RoleObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rows.is_empty() {
            return f.write_str("(no rows)");
        }
        writeln!(f, "{:>4} | {:<28} | {:<10} | status", "id", "endpoint", "role")?;
        for row in &self.rows {
            writeln!(
                f,
                "{:>4} | {:<28} | {:<10} | {}",
                row.id,
                row.endpoint,
                row.role.to_string(),
                row.status
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnodeRow {
    pub id: u32,
    pub endpoint: String,
    pub status: NodeStatus,
}

/// One `SHOW DNODES` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnodeObservation {
    pub rows: Vec<DnodeRow>,
}

impl DnodeObservation {
    pub const QUERY: &'static str = "SHOW DNODES";
    const STATUS_COLUMN: usize = 4;

    pub fn from_result_set(rs: &ResultSet) -> Result<Self, QueryError> {
        let sql = Self::QUERY;
        let rows = rs
            .rows
            .iter()
            .map(|row| {
                Ok(DnodeRow {
                    id: parse_id(sql, column(sql, row, 0)?)?,
                    endpoint: column(sql, row, 1)?.trim().to_owned(),
                    status: column(sql, row, Self::STATUS_COLUMN)?.into(),
                })
            })
            .collect::<Result<_, QueryError>>()?;
        Ok(Self { rows })
    }

    /// True if exactly `expected` dnodes are registered and all of them are ready.
    pub fn all_ready(&self, expected: usize) -> bool {
        self.rows.len() == expected && self.rows.iter().all(|r| r.status == NodeStatus::Ready)
    }

    pub fn status_of(&self, endpoint: &str) -> Option<&NodeStatus> {
        self.rows
            .iter()
            .find(|r| r.endpoint == endpoint)
            .map(|r| &r.status)
    }
}

/// A predicate over a [`RoleObservation`]: an exact row count, an exact role multiset, and
/// optionally a set of endpoints pinned to specific roles.
///
/// Without pins the check is permutation tolerant: any assignment of the expected roles to the
/// observed endpoints satisfies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceTarget {
    rows: usize,
    roles: BTreeMap<Role, usize>,
    pinned: Vec<(String, Role)>,
}

impl ConvergenceTarget {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            roles: BTreeMap::new(),
            pinned: Vec::new(),
        }
    }

    /// One leader and `members - 1` followers among `members` mnodes.
    pub fn leader_with_followers(members: usize) -> Self {
        Self::new(members)
            .with_role(Role::Leader, 1)
            .with_role(Role::Follower, members.saturating_sub(1))
    }

    pub fn with_role(mut self, role: Role, count: usize) -> Self {
        if count == 0 {
            self.roles.remove(&role);
        } else {
            self.roles.insert(role, count);
        }
        self
    }

    /// Require `endpoint` to hold `role`, in addition to the multiset check.
    pub fn pin(mut self, endpoint: impl Into<String>, role: Role) -> Self {
        self.pinned.push((endpoint.into(), role));
        self
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_satisfied_by(&self, observation: &RoleObservation) -> bool {
        // Nodes that have not registered yet show up as missing rows.
        if observation.len() != self.rows {
            return false;
        }
        if observation.role_counts() != self.roles {
            return false;
        }
        self.pinned.iter().all(|(endpoint, role)| {
            observation
                .row_for(endpoint)
                .is_some_and(|row| row.role == *role)
        })
    }
}

impl fmt::Display for ConvergenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mnodes {{", self.rows)?;
        for (i, (role, count)) in self.roles.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{role}: {count}")?;
        }
        f.write_str("}")?;
        for (endpoint, role) in &self.pinned {
            write!(f, " with {endpoint} {role}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedRow {
    pub endpoint: String,
    /// `None` leaves the role unconstrained.
    pub role: Option<Role>,
    pub status: NodeStatus,
}

/// A fully specified `SHOW MNODES` result, checked row by row in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedState {
    pub rows: Vec<ExpectedRow>,
}

impl ExpectedState {
    /// Every endpoint `ready`, roles unconstrained.
    pub fn ready(endpoints: impl IntoIterator<Item = String>) -> Self {
        Self {
            rows: endpoints
                .into_iter()
                .map(|endpoint| ExpectedRow {
                    endpoint,
                    role: None,
                    status: NodeStatus::Ready,
                })
                .collect(),
        }
    }

    pub fn with_role(mut self, endpoint: &str, role: Role) -> Self {
        if let Some(row) = self.rows.iter_mut().find(|r| r.endpoint == endpoint) {
            row.role = Some(role);
        }
        self
    }

    /// Returns a description of every mismatch, or `Ok` if `observation` matches exactly.
    pub fn verify(&self, observation: &RoleObservation) -> Result<(), String> {
        let mut mismatches = Vec::new();
        if observation.len() != self.rows.len() {
            mismatches.push(format!(
                "expected {} rows, got {}",
                self.rows.len(),
                observation.len()
            ));
        }
        for (idx, (expected, actual)) in self.rows.iter().zip(&observation.rows).enumerate() {
            if expected.endpoint != actual.endpoint {
                mismatches.push(format!(
                    "row {idx}: endpoint {} != {}",
                    actual.endpoint, expected.endpoint
                ));
            }
            if let Some(role) = expected.role {
                if role != actual.role {
                    mismatches.push(format!("row {idx}: role {} != {role}", actual.role));
                }
            }
            if expected.status != actual.status {
                mismatches.push(format!(
                    "row {idx}: status {} != {}",
                    actual.status, expected.status
                ));
            }
        }
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(mismatches.join("; "))
        }
    }
}
