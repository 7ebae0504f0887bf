//! Bounded polling of cluster state.
//!
//! Role elections are asynchronous, so every wait in the harness is expressed as "query up to
//! `max_attempts` times, `interval` apart, until the observation satisfies a predicate". Running
//! out of attempts is reported through [`Convergence::converged`] rather than as an error; the
//! caller decides whether that is fatal.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::SqlClient;
use crate::error::{ClusterTestError, QueryError};
use crate::observation::{ConvergenceTarget, DnodeObservation, RoleObservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub max_attempts: usize,
    /// Sleep before every attempt, including the first.
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

/// The outcome of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convergence<T> {
    pub converged: bool,
    /// Number of attempts made, including the satisfying one.
    pub attempts: usize,
    /// The satisfying observation, or the last successful one if the wait was exhausted.
    pub last: Option<T>,
}

impl Convergence<RoleObservation> {
    /// Turns an exhausted wait into [`ClusterTestError::ConvergenceTimeout`].
    pub fn into_result(self, target: &ConvergenceTarget) -> Result<RoleObservation, ClusterTestError> {
        match self {
            Convergence {
                converged: true,
                last: Some(observation),
                ..
            } => Ok(observation),
            Convergence { attempts, last, .. } => Err(ClusterTestError::ConvergenceTimeout {
                target: target.to_string(),
                attempts,
                last,
            }),
        }
    }
}

/// Runs `query` against `state` until `accept` holds or the attempts are exhausted.
///
/// A failed query counts as an attempt that did not converge; the last successful observation is
/// kept.
pub async fn poll_until<S, T, Q, P>(
    state: &mut S,
    mut query: Q,
    accept: P,
    options: PollOptions,
    what: &str,
) -> Convergence<T>
where
    S: ?Sized,
    Q: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, QueryError>>,
    P: Fn(&T) -> bool,
{
    let mut last = None;
    for attempt in 1..=options.max_attempts {
        sleep(options.interval).await;
        match query(state).await {
            Ok(observation) if accept(&observation) => {
                debug!(attempt, "{what} reached");
                return Convergence {
                    converged: true,
                    attempts: attempt,
                    last: Some(observation),
                };
            }
            Ok(observation) => last = Some(observation),
            Err(error) => warn!(attempt, %error, "Query failed while waiting for {what}"),
        }
    }
    info!(
        attempts = options.max_attempts,
        "{what} not reached within {:?}",
        options.interval * options.max_attempts as u32
    );
    Convergence {
        converged: false,
        attempts: options.max_attempts,
        last,
    }
}

pub async fn observe_mnodes(client: &mut dyn SqlClient) -> Result<RoleObservation, QueryError> {
    let rs = client.query(RoleObservation::QUERY).await?;
    RoleObservation::from_result_set(&rs)
}

pub async fn observe_dnodes(client: &mut dyn SqlClient) -> Result<DnodeObservation, QueryError> {
    let rs = client.query(DnodeObservation::QUERY).await?;
    DnodeObservation::from_result_set(&rs)
}

/// Polls `SHOW MNODES` until `target` is satisfied.
pub async fn await_convergence(
    client: &mut dyn SqlClient,
    target: &ConvergenceTarget,
    options: PollOptions,
) -> Convergence<RoleObservation> {
    let what = format!("mnode convergence to {target}");
    poll_until(
        client,
        |c| Box::pin(observe_mnodes(c)),
        |o| target.is_satisfied_by(o),
        options,
        &what,
    )
    .await
}

/// Polls `SHOW DNODES` until exactly `expected` dnodes are registered and ready.
pub async fn await_dnodes_ready(
    client: &mut dyn SqlClient,
    expected: usize,
    options: PollOptions,
) -> Convergence<DnodeObservation> {
    let what = format!("{expected} ready dnodes");
    poll_until(
        client,
        |c| Box::pin(observe_dnodes(c)),
        |o| o.all_ready(expected),
        options,
        &what,
    )
    .await
}
