//! WolfGroup - Group Membership and Leader Election
//!
//! Command line front end: configuration management and a membership
//! simulator running against the in-memory coordination store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfgroup::config::WolfGroupConfig;
use wolfgroup::error::{Error, Result};
use wolfgroup::group::{CoordinationGroup, ServiceState};
use wolfgroup::store::{sequence_of, MemoryClient, MemoryStore};

/// WolfGroup - Group Membership and Leader Election
#[derive(Parser)]
#[command(name = "wolfgroup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfgroup.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfgroup.toml")]
        output: PathBuf,

        /// Base path members register under
        #[arg(long, default_value = "/wolfgroup/members")]
        path: String,
    },

    /// Validate configuration file
    Validate,

    /// Show group configuration
    Info,

    /// Run members against an in-memory store and check leadership
    Simulate {
        /// Number of members
        #[arg(short, long, default_value_t = 5)]
        members: usize,

        /// Churn rounds after the initial election
        #[arg(short, long, default_value_t = 20)]
        rounds: usize,

        /// Seed for the churn schedule
        #[arg(short, long, default_value_t = 42)]
        seed: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let logging = WolfGroupConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    let level = cli.log_level.as_deref().unwrap_or(&logging.level);
    init_logging(level, &logging.format);

    match cli.command {
        Commands::Init { output, path } => run_init(output, path),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Simulate {
            members,
            rounds,
            seed,
        } => run_simulate(cli.config, members, rounds, seed).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Write a default configuration file
fn run_init(output: PathBuf, path: String) -> Result<()> {
    let config = WolfGroupConfig::with_path(path);
    config.validate()?;

    let content = format!(
        "# WolfGroup Configuration\n# Generated configuration file\n\n{}",
        config.to_toml_string()?
    );
    std::fs::write(&output, content)?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfGroupConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Group Path:  {}", config.group.path);
            println!("  Node Prefix: {}", config.group.node_prefix);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show group information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfGroupConfig::from_file(&config_path)?;

    println!("WolfGroup Configuration");
    println!("=======================");
    println!();
    println!("Group Path:       {}", config.group.path);
    println!("Node Path:        {}<sequence>", config.group.node_path());
    println!("Close Grace:      {:?}", config.group.close_grace());
    println!();
    println!("Logging:");
    println!("  Level:          {}", config.logging.level);
    println!("  Format:         {}", config.logging.format);

    Ok(())
}

struct SimMember {
    client: Arc<MemoryClient>,
    group: CoordinationGroup<ServiceState>,
    state: ServiceState,
    announced: bool,
}

/// Run a churn simulation and verify single-master after every round
async fn run_simulate(config_path: PathBuf, members: usize, rounds: usize, seed: u64) -> Result<()> {
    if members == 0 {
        return Err(Error::Config("simulation needs at least one member".into()));
    }

    let config = if config_path.exists() {
        WolfGroupConfig::from_file(&config_path)?
    } else {
        tracing::info!("No configuration at {:?}, using defaults", config_path);
        WolfGroupConfig::with_path("/wolfgroup/simulation")
    };

    let store = MemoryStore::new();
    let mut sim = Vec::with_capacity(members);
    for i in 0..members {
        let client = store.connect();
        let group = CoordinationGroup::new(client.clone(), config.group.clone());
        group.start().await?;
        let state = ServiceState::new("service", format!("container-{}", i)).stamped();
        group.update(Some(state.clone()));
        sim.push(SimMember {
            client,
            group,
            state,
            announced: true,
        });
    }

    await_quiescence(&sim).await?;
    check_single_master(&sim, 0)?;

    let mut rng = StdRng::seed_from_u64(seed);
    for round in 1..=rounds {
        let idx = rng.gen_range(0..sim.len());
        let member = &mut sim[idx];
        match rng.gen_range(0..3) {
            0 => {
                member.announced = !member.announced;
                let state = member.announced.then(|| member.state.clone());
                tracing::info!(
                    "Round {}: {} {}",
                    round,
                    member.state.container,
                    if member.announced { "re-announces" } else { "steps down" }
                );
                member.group.update(state);
            }
            1 => {
                tracing::info!("Round {}: session of {} expires", round, member.state.container);
                member.client.expire_session();
                member.client.reconnect();
            }
            _ => {
                tracing::info!("Round {}: {} loses its connection", round, member.state.container);
                member.client.suspend();
                member.client.reconnect();
            }
        }

        await_quiescence(&sim).await?;
        check_single_master(&sim, round)?;
    }

    let closed = join_all(sim.iter().map(|m| m.group.close())).await;
    for result in closed {
        result?;
    }
    if !store.children_of(&config.group.path).is_empty() {
        return Err(Error::Internal("registrations left behind after close".into()));
    }

    println!("✓ {} members, {} rounds: exactly one master after every round", members, rounds);
    Ok(())
}

/// Registration paths of announced members, in election order
fn expected_view(sim: &[SimMember]) -> Option<Vec<String>> {
    let mut ids = Vec::new();
    for member in sim.iter().filter(|m| m.announced) {
        if member.group.is_unstable() {
            return None;
        }
        ids.push(member.group.id()?);
    }
    ids.sort_by_key(|id| sequence_of(id));
    Some(ids)
}

async fn await_quiescence(sim: &[SimMember]) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(expected) = expected_view(sim) {
            let settled = sim.iter().all(|m| {
                m.group.is_connected() && m.group.members().paths() == expected
            });
            if settled {
                return Ok(());
            }
        }
        if Instant::now() > deadline {
            return Err(Error::Internal("members did not converge".into()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn check_single_master(sim: &[SimMember], round: usize) -> Result<()> {
    let masters: Vec<&SimMember> = sim.iter().filter(|m| m.group.is_master()).collect();
    let expected = expected_view(sim).unwrap_or_default();

    match (masters.as_slice(), expected.first()) {
        ([], None) => {
            tracing::info!("Round {}: no member announced, no master", round);
            Ok(())
        }
        ([master], Some(lowest)) if master.group.id().as_deref() == Some(lowest.as_str()) => {
            tracing::info!("Round {}: master is {}", round, master.state.container);
            Ok(())
        }
        _ => Err(Error::Internal(format!(
            "round {}: {} masters reported, lowest registration {:?}",
            round,
            masters.len(),
            expected.first()
        ))),
    }
}
