use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use threadhub::orchestrator::{AgentRegistry, JobManager};
use threadhub::store::Store;
use threadhub::{config, daemon, ids, AgentCommands, ConfigCommands, JobCommands};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "threadhub")]
#[command(version)]
#[command(
    about = "Route chat threads to coding agents over reliable WebSockets.",
    long_about = None
)]
struct Cli {
    /// Directory holding config.toml (default: ~/.threadhub)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway and idle sweeper until Ctrl+C
    Daemon {
        /// Bind host (overrides `[gateway] host`)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides `[gateway] port`)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Generate an identifier such as `j_01ARZ3NDEKTSV4RRFFQ69G5FAV`
    Id { prefix: String },

    /// Inspect jobs
    Jobs {
        #[command(subcommand)]
        job_command: JobCommands,
    },

    /// Inspect agents
    Agents {
        #[command(subcommand)]
        agent_command: AgentCommands,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("THREADHUB_CONFIG_DIR", config_dir);
    }

    // Schema and ids print to stdout only: no config, no logging.
    match &cli.command {
        Commands::Config {
            config_command: ConfigCommands::Schema,
        } => {
            let schema = schemars::schema_for!(config::Config);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            return Ok(());
        }
        Commands::Id { prefix } => {
            println!("{}", ids::new_id(prefix)?);
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let mut config = config::Config::load_or_init().await?;

    match cli.command {
        Commands::Daemon { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            config.validate()?;
            daemon::run(config).await
        }

        Commands::Jobs { job_command } => {
            let jobs = JobManager::new(Store::open(&config.db_path())?);
            match job_command {
                JobCommands::List { org } => print_json(&jobs.list_jobs(&org)?),
                JobCommands::Idle { org, minutes } => {
                    let minutes = minutes.unwrap_or(config.jobs.idle_minutes);
                    print_json(&jobs.get_idle_jobs(&org, minutes)?)
                }
                JobCommands::Delete { org, job } => {
                    jobs.delete_job(&job, &org)?;
                    println!("Deleted {job}");
                    Ok(())
                }
            }
        }

        Commands::Agents { agent_command } => {
            let agents = AgentRegistry::new(Store::open(&config.db_path())?);
            match agent_command {
                AgentCommands::List { org } => print_json(&agents.list_agents(&org)?),
                AgentCommands::Available { org } => print_json(&agents.get_available_agents(&org)?),
            }
        }

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigCommands::Schema => Ok(()),
        },

        Commands::Id { .. } => Ok(()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
