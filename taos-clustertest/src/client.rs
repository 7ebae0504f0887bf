//! SQL clients used to drive a cluster under test.
//!
//! Two transports are provided: [`ShellClient`] runs the `taos` command line shell once per
//! statement and parses its tabular output, [`RestClient`] posts statements to the REST endpoint
//! of a `taosadapter`. Both return every value as its textual rendering; callers consume columns
//! positionally.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::cluster::Node;
use crate::error::QueryError;

/// Rows returned by a statement. Statements that return no table yield an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A connection to one endpoint of the cluster. Not safe for concurrent use; callers hold it
/// behind `&mut`.
#[async_trait]
pub trait SqlClient: Send {
    /// The `host:port` this client talks to.
    fn endpoint(&self) -> &str;

    async fn query(&mut self, sql: &str) -> Result<ResultSet, QueryError>;
}

/// Creates a [`SqlClient`] for a node of the cluster.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &Node) -> Result<Box<dyn SqlClient>, QueryError>;
}

/// Statement used to check that a freshly created client can reach its endpoint.
const PROBE: &str = "SELECT SERVER_STATUS()";

/// Runs `taos -c <cfg> -h <host> -P <port> -s "<sql>"` for each statement.
pub struct ShellClient {
    binary: PathBuf,
    cfg_dir: PathBuf,
    host: String,
    port: u16,
    endpoint: String,
}

impl ShellClient {
    pub async fn connect(
        binary: PathBuf,
        host: &str,
        port: u16,
        cfg_dir: PathBuf,
    ) -> Result<Self, QueryError> {
        let mut client = Self {
            binary,
            cfg_dir,
            host: host.to_owned(),
            port,
            endpoint: format!("{host}:{port}"),
        };
        client.query(PROBE).await?;
        Ok(client)
    }

    fn connection_error(&self, message: impl Into<String>) -> QueryError {
        QueryError::Connection {
            endpoint: self.endpoint.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl SqlClient for ShellClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(&mut self, sql: &str) -> Result<ResultSet, QueryError> {
        let statement = if sql.trim_end().ends_with(';') {
            sql.to_owned()
        } else {
            format!("{sql};")
        };
        debug!(endpoint = %self.endpoint, %statement, "Executing via taos shell");
        let output = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.cfg_dir)
            .arg("-h")
            .arg(&self.host)
            .arg("-P")
            .arg(self.port.to_string())
            .arg("-s")
            .arg(&statement)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                self.connection_error(format!(
                    "failed to run `{}`: {e}",
                    self.binary.display()
                ))
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        trace!(%text, "taos shell output");
        parse_shell_output(sql, &self.endpoint, &text)
    }
}

fn is_separator(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && line.chars().all(|c| c == '=')
}

fn split_cells(line: &str) -> Vec<String> {
    let mut cells: Vec<String> = line.split('|').map(|c| c.trim().to_owned()).collect();
    // Rows are terminated with a trailing `|`.
    if cells.last().is_some_and(String::is_empty) {
        cells.pop();
    }
    cells
}

/// Low 16 bits of the rpc error codes that mean the endpoint could not be reached, as opposed
/// to the server rejecting the statement.
const TRANSPORT_ERRORS: [i64; 5] = [
    0x000B, // network unavailable
    0x0018, // broken link
    0x0019, // request timed out
    0x0020, // some nodes not connected
    0x0021, // some nodes broken link
];

/// Classifies an error reported by the server or the client library.
fn server_error(endpoint: &str, code: Option<i64>, message: &str) -> QueryError {
    let transport = code.is_some_and(|code| TRANSPORT_ERRORS.contains(&(code & 0xFFFF)))
        || message
            .to_ascii_lowercase()
            .contains("unable to establish connection");
    if transport {
        QueryError::Connection {
            endpoint: endpoint.to_owned(),
            message: message.to_owned(),
        }
    } else {
        QueryError::Server {
            code,
            message: message.to_owned(),
        }
    }
}

/// Parses `DB error: <message> [0x80000350] (0.001s)` into its message and optional code.
fn parse_db_error(endpoint: &str, rest: &str) -> QueryError {
    let mut message = rest.trim();
    if let Some(idx) = message.rfind(" (") {
        if message.ends_with("s)") {
            message = message[..idx].trim_end();
        }
    }
    let mut code = None;
    if let (Some(open), true) = (message.rfind("[0x"), message.ends_with(']')) {
        code = i64::from_str_radix(&message[open + 3..message.len() - 1], 16).ok();
        message = message[..open].trim_end();
    }
    server_error(endpoint, code, message)
}

/// Parses the output of the `taos` shell for a single statement.
pub(crate) fn parse_shell_output(
    sql: &str,
    endpoint: &str,
    output: &str,
) -> Result<ResultSet, QueryError> {
    let lines: Vec<&str> = output.lines().collect();

    for line in &lines {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("DB error:") {
            return Err(parse_db_error(endpoint, rest));
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("failed to connect") || lower.contains("unable to establish connection")
        {
            return Err(QueryError::Connection {
                endpoint: endpoint.to_owned(),
                message: trimmed.to_owned(),
            });
        }
    }

    let Some(sep) = lines.iter().position(|l| is_separator(l)) else {
        if lines.iter().any(|l| l.contains(" OK")) {
            return Ok(ResultSet::default());
        }
        return Err(QueryError::Parse {
            sql: sql.to_owned(),
            message: format!("no result table or status line in output: {output:?}"),
        });
    };

    let columns = match sep.checked_sub(1).and_then(|i| lines.get(i)) {
        Some(header) if header.contains('|') => split_cells(header),
        _ => {
            return Err(QueryError::Parse {
                sql: sql.to_owned(),
                message: "result table has no header".into(),
            })
        }
    };

    let rows = lines[sep + 1..]
        .iter()
        .take_while(|l| l.contains('|'))
        .map(|l| split_cells(l))
        .collect();

    Ok(ResultSet { columns, rows })
}

/// Creates a [`ShellClient`] against the node's `fqdn:serverPort`, using the node's config dir.
pub struct ShellConnector {
    pub binary: PathBuf,
}

#[async_trait]
impl Connector for ShellConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn SqlClient>, QueryError> {
        let client = ShellClient::connect(
            self.binary.clone(),
            &node.fqdn,
            node.server_port,
            node.cfg_dir(),
        )
        .await?;
        Ok(Box::new(client))
    }
}

#[derive(Debug, Deserialize)]
struct RestResponse {
    code: i64,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    column_meta: Vec<(String, String, i64)>,
    #[serde(default)]
    data: Vec<Vec<serde_json::Value>>,
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_owned(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn rest_result(endpoint: &str, body: RestResponse) -> Result<ResultSet, QueryError> {
    if body.code != 0 {
        return Err(server_error(
            endpoint,
            Some(body.code),
            body.desc.as_deref().unwrap_or_default(),
        ));
    }

    Ok(ResultSet {
        columns: body.column_meta.into_iter().map(|(name, ..)| name).collect(),
        rows: body
            .data
            .iter()
            .map(|row| row.iter().map(render_value).collect())
            .collect(),
    })
}

/// Posts each statement to `http://<host>:<port>/rest/sql`.
pub struct RestClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    endpoint: String,
}

impl RestClient {
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<Self, QueryError> {
        let endpoint = format!("{host}:{port}");
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| QueryError::Connection {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            })?;
        let mut client = Self {
            http,
            url: format!("http://{endpoint}/rest/sql"),
            user: user.to_owned(),
            password: password.to_owned(),
            endpoint,
        };
        client.query(PROBE).await?;
        Ok(client)
    }
}

#[async_trait]
impl SqlClient for RestClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(&mut self, sql: &str) -> Result<ResultSet, QueryError> {
        debug!(endpoint = %self.endpoint, %sql, "Executing via REST");
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .body(sql.to_owned())
            .send()
            .await
            .map_err(|e| QueryError::Connection {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            })?;

        let body: RestResponse = response.json().await.map_err(|e| QueryError::Parse {
            sql: sql.to_owned(),
            message: e.to_string(),
        })?;
        rest_result(&self.endpoint, body)
    }
}

/// Creates a [`RestClient`] against the node's fqdn on a fixed adapter port.
///
/// Every dnode of a local cluster shares one fqdn, so all clients reach the same `taosadapter`
/// and the adapter picks the dnode it forwards to. Moving the client off a stopped dnode
/// therefore reconnects to the same adapter; convergence checks stay valid as long as the
/// adapter's own `firstEp`/`secondEp` keep a running dnode in reach.
pub struct RestConnector {
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[async_trait]
impl Connector for RestConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn SqlClient>, QueryError> {
        let client = RestClient::connect(&node.fqdn, self.port, &self.user, &self.password).await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SHOW_MNODES: &str = "\
Welcome to the TDengine Command Line Interface, Client Version:3.0.0.0
Copyright (c) 2022 by TDengine, all rights reserved.

taos> show mnodes;
     id      |            endpoint            |     role     |  status   |       create_time       |
======================================================================================================
           1 | host-a:6030                    | leader       | ready     | 2022-08-01 10:00:00.000 |
           2 | host-a:6130                    | follower     | ready     | 2022-08-01 10:00:05.000 |
Query OK, 2 row(s) in set (0.003391s)
";

    #[test]
    fn parses_table_output() {
        let rs = parse_shell_output("show mnodes", "host-a:6030", SHOW_MNODES).unwrap();
        assert_eq!(
            rs.columns,
            vec!["id", "endpoint", "role", "status", "create_time"]
        );
        assert_eq!(rs.len(), 2);
        assert_eq!(
            rs.rows[1],
            vec![
                "2",
                "host-a:6130",
                "follower",
                "ready",
                "2022-08-01 10:00:05.000"
            ]
        );
    }

    #[test]
    fn parses_db_error_with_code() {
        let out = "taos> create mnode on dnode 2;\nDB error: Mnode already exists [0x80000350] (0.001236s)\n";
        let err = parse_shell_output("create mnode on dnode 2", "h:6030", out).unwrap_err();
        match err {
            QueryError::Server { code, ref message } => {
                assert_eq!(code, Some(0x80000350));
                assert_eq!(message, "Mnode already exists");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_already_exists());
    }

    #[test]
    fn parses_db_error_without_code() {
        let out = "DB error: Dnode already exists (0.002s)";
        let err = parse_shell_output("create dnode", "h:6030", out).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn status_line_without_table_is_empty_result() {
        let out = "taos> create mnode on dnode 3;\nCreate OK, 0 row(s) affected (0.150s)\n";
        let rs = parse_shell_output("create mnode on dnode 3", "h:6030", out).unwrap();
        assert!(rs.is_empty());
    }

    #[test]
    fn connection_failure_is_not_a_server_error() {
        let out = "failed to connect to server, reason: Unable to establish connection\n";
        let err = parse_shell_output("show mnodes", "h:6030", out).unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn db_error_for_unreachable_endpoint_is_a_connection_error() {
        let out = "DB error: Unable to establish connection [0x8000000b] (0.500s)\n";
        let err = parse_shell_output("create dnode", "h:6030", out).unwrap_err();
        assert!(err.is_connection(), "{err:?}");
        assert!(!err.is_already_exists());

        let out = "DB error: Conn is broken [0x80000018] (1.002s)";
        let err = parse_shell_output("show mnodes", "h:6030", out).unwrap_err();
        assert!(err.is_connection(), "{err:?}");
    }

    #[test]
    fn garbage_output_is_a_parse_error() {
        let err = parse_shell_output("show mnodes", "h:6030", "segmentation fault").unwrap_err();
        assert!(matches!(err, QueryError::Parse { .. }));
    }

    #[test]
    fn rest_values_render_as_text() {
        assert_eq!(render_value(&serde_json::json!(1)), "1");
        assert_eq!(render_value(&serde_json::json!("leader")), "leader");
        assert_eq!(render_value(&serde_json::Value::Null), "NULL");
    }

    #[test]
    fn rest_error_body_deserializes() {
        let body: RestResponse =
            serde_json::from_str(r#"{"code":848,"desc":"Mnode already exists"}"#).unwrap();
        assert_eq!(body.code, 848);
        assert!(body.data.is_empty());
    }

    #[test]
    fn rest_error_code_is_a_server_error() {
        let body = serde_json::from_str(r#"{"code":866,"desc":"Mnode already exists"}"#).unwrap();
        let err = rest_result("h:6041", body).unwrap_err();
        assert!(err.is_already_exists(), "{err:?}");
        assert!(matches!(err, QueryError::Server { code: Some(866), .. }));
    }

    #[test]
    fn rest_network_error_code_is_a_connection_error() {
        let body =
            serde_json::from_str(r#"{"code":11,"desc":"Unable to establish connection"}"#).unwrap();
        let err = rest_result("h:6041", body).unwrap_err();
        assert!(err.is_connection(), "{err:?}");
    }

    #[test]
    fn rest_success_body_becomes_result_set() {
        let body = serde_json::from_str(
            r#"{
                "code": 0,
                "column_meta": [["id","SMALLINT",2],["endpoint","VARCHAR",134],["role","VARCHAR",10]],
                "data": [[1,"host-a:6030","leader"],[2,"host-a:6130",null]],
                "rows": 2
            }"#,
        )
        .unwrap();
        let rs = rest_result("h:6041", body).unwrap();
        assert_eq!(rs.columns, vec!["id", "endpoint", "role"]);
        assert_eq!(rs.rows[1], vec!["2", "host-a:6130", "NULL"]);
    }
}
