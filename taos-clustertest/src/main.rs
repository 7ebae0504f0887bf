use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use taos_clustertest::logging;
use taos_clustertest::{
    ClusterBuilder, Env, PollOptions, ScenarioContext, ScenarioRegistry, TimeoutPolicy,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "taos-clustertest")]
struct Opts {
    #[command(flatten)]
    logging: logging::Options,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the registered scenarios
    List,
    /// Run scenarios against local taosd processes
    Run(RunOpts),
}

#[derive(Args)]
struct RunOpts {
    /// Scenarios to run. Runs every registered scenario if none are given.
    names: Vec<String>,

    /// What to do when the cluster does not converge in time
    #[arg(long, env = "TIMEOUT_POLICY", default_value = "fail", value_enum)]
    policy: TimeoutPolicy,

    /// Number of times to query the cluster while waiting for it to converge
    #[arg(long, env = "POLL_ATTEMPTS", default_value_t = 10)]
    poll_attempts: usize,

    /// Milliseconds to sleep before each query while waiting for convergence
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Extra taos.cfg entry for every dnode, as `key=value`. May be repeated.
    #[arg(long = "cfg", value_parser = parse_key_val)]
    extra_cfg: Vec<(String, String)>,

    /// Keep each deployment's config, data and logs after the scenario ends
    #[arg(long, env = "KEEP_FILES")]
    keep_files: bool,

    /// Stop after the first failing scenario
    #[arg(long)]
    fail_fast: bool,
}

fn parse_key_val(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got `{s}`"))?;
    Ok((key.trim().to_owned(), value.trim().to_owned()))
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    opts.logging.init()?;

    // The registry is built once and handed to whatever needs it.
    let registry = ScenarioRegistry::builtin();

    match opts.command {
        Command::List => {
            for scenario in registry.iter() {
                println!("{:<24} {}", scenario.name(), scenario.description());
            }
            Ok(())
        }
        Command::Run(run_opts) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run(&registry, run_opts))
        }
    }
}

async fn run(registry: &ScenarioRegistry, opts: RunOpts) -> Result<()> {
    let env = Env::from_env()?;
    info!(
        binary_path = %env.binary_path.display(),
        sim_dir = %env.sim_dir.display(),
        fqdn = %env.fqdn,
        base_port = env.base_port,
        "Loaded environment"
    );

    let names: Vec<String> = if opts.names.is_empty() {
        registry.names().into_iter().map(String::from).collect()
    } else {
        opts.names.clone()
    };
    let scenarios = names
        .iter()
        .map(|name| {
            registry.get(name).ok_or_else(|| {
                anyhow!(
                    "unknown scenario `{name}`, expected one of: {}",
                    registry.names().join(", ")
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let poll = PollOptions {
        max_attempts: opts.poll_attempts,
        interval: Duration::from_millis(opts.poll_interval_ms),
    };

    let mut failed = vec![];
    for scenario in scenarios {
        let mut builder = ClusterBuilder::new(scenario.name(), &env)
            .poll_options(poll)
            .keep_files(opts.keep_files);
        for (key, value) in &opts.extra_cfg {
            builder = builder.extra_cfg(key, value);
        }
        let ctx = ScenarioContext {
            builder,
            controller: env.controller(),
            connector: env.connector(),
            policy: opts.policy,
        };

        info!(scenario = scenario.name(), "{}", scenario.description());
        match scenario.run(ctx).await {
            Ok(report) => println!("{report}"),
            Err(failure) => {
                error!(scenario = scenario.name(), "{failure}");
                eprintln!("{failure}");
                failed.push(scenario.name());
                if opts.fail_fast {
                    break;
                }
            }
        }
    }

    if !failed.is_empty() {
        bail!("{} scenario(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}
