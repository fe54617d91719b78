use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use flowgrid_core::{Controller, ControllerConfig, PatriciaTrie, Prefix};

#[derive(Parser)]
#[command(name = "flowgrid")]
#[command(about = "Distributed SDN controller core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a controller instance until interrupted
    Run {
        /// TOML configuration file; defaults plus FLOWGRID_* variables when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured instance id
        #[arg(long)]
        instance_id: Option<String>,
    },
    /// Configuration utilities
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Longest-prefix match against a set of routes
    Lpm {
        /// Routes as PREFIX=NAME, e.g. 10.0.0.0/8=core
        #[arg(required = true)]
        routes: Vec<String>,

        /// Address or prefix to look up
        #[arg(long)]
        query: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Parse and validate a configuration file
    Check { file: PathBuf },
    /// Print the default configuration as TOML
    Default,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("flowgrid=info".parse().context("invalid log directive")?)
        .add_directive("flowgrid_core=info".parse().context("invalid log directive")?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, instance_id } => {
            let mut config = match config {
                Some(path) => ControllerConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ControllerConfig::from_env()?,
            };
            if let Some(id) = instance_id {
                config.instance_id = id;
            }
            run(config).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Check { file } => {
                let config = ControllerConfig::from_file(&file)
                    .with_context(|| format!("loading {}", file.display()))?;
                println!("{} is valid (instance {})", file.display(), config.instance_id);
                Ok(())
            }
            ConfigCommands::Default => {
                let text = toml::to_string_pretty(&ControllerConfig::default())?;
                print!("{}", text);
                Ok(())
            }
        },
        Commands::Lpm { routes, query } => lpm(&routes, &query),
    }
}

async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    let controller = Arc::new(Controller::from_config(config)?);
    controller.start().await?;
    tracing::info!("Controller {} is up; press Ctrl-C to stop", controller.instance_id());

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");
    controller.shutdown().await;
    Ok(())
}

fn lpm(routes: &[String], query: &str) -> anyhow::Result<()> {
    let query: Prefix = query.parse()?;
    let trie = PatriciaTrie::new(query.address().len() * 8);
    for route in routes {
        let (prefix, name) = route
            .split_once('=')
            .with_context(|| format!("route {:?} is not PREFIX=NAME", route))?;
        let prefix: Prefix = prefix.parse()?;
        trie.put(prefix, name.to_string())?;
    }
    match trie.match_prefix(&query)? {
        Some(name) => println!("{} -> {}", query, name),
        None => println!("{} -> no route", query),
    }
    Ok(())
}
