//! Dominator - Docker container orchestration for fleets of ships
//!
//! This is the main CLI entry point for Dominator.

use anyhow::Context;
use clap::{Parser, Subcommand};
use dominator::actions::{self, RemoteCommand, EXIT_DIFFERS};
use dominator::entities::Shipment;
use dominator::harbor::Harbor;
use dominator::logging;
use dominator::settings::Settings;
use std::path::PathBuf;
use std::process::ExitCode;

/// Dominator - deploys shipments of Docker containers to ships
#[derive(Parser)]
#[command(name = "dominator")]
#[command(author = "Nikolay Bryskin")]
#[command(version)]
#[command(about = "Deploys declarative shipments of Docker containers", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short = 'l', long, global = true)]
    loglevel: Option<String>,

    /// Shipment YAML file, `-` for stdin
    #[arg(short, long)]
    config: String,

    /// Namespace for bare repository names
    #[arg(short, long)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the shipment with every image pinned
    Dump,

    /// List containers placed on this machine
    ListContainers,

    /// Start local containers, replacing outdated ones
    Localstart {
        /// Container name
        container: Option<String>,
    },

    /// Stop and start local containers
    Localrestart {
        /// Container name
        container: Option<String>,
    },

    /// Run a local container until it stops
    Localexec {
        /// Container name
        container: String,
        /// Keep the container after it stops
        #[arg(short, long)]
        keep: bool,
    },

    /// Show the status of local containers
    Localstatus {
        /// Ship name
        ship: Option<String>,
        /// Container name
        container: Option<String>,
        /// Print differences from the shipment
        #[arg(short, long)]
        diff: bool,
    },

    /// Stop containers
    Stop {
        /// Ship name
        ship: Option<String>,
        /// Container name
        container: Option<String>,
    },

    /// Show container logs
    Logs {
        /// Ship name
        ship: Option<String>,
        /// Container name
        container: Option<String>,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },

    /// Start containers on their ships
    Start(RemoteArgs),

    /// Restart containers on their ships
    Restart(RemoteArgs),

    /// Show the status of containers on their ships
    Status(RemoteArgs),

    /// Build and push source images
    Build {
        /// Container name
        container: Option<String>,
    },
}

#[derive(clap::Args)]
struct RemoteArgs {
    /// Ship name
    ship: Option<String>,
    /// Container name
    container: Option<String>,
    /// Keep the ambassador container
    #[arg(short, long)]
    keep: bool,
    /// Print differences from the shipment
    #[arg(short, long)]
    diff: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn exit_code(code: i64) -> ExitCode {
    match code {
        0 => ExitCode::SUCCESS,
        code => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Settings::load(cli.settings.as_deref());
    let logging_settings = settings
        .as_ref()
        .map(|s| s.logging.clone())
        .unwrap_or_default();
    logging::init(&logging_settings, cli.loglevel.as_deref());

    let mut settings = settings.context("failed to load settings")?;
    if let Some(namespace) = cli.namespace {
        settings.docker_namespace = Some(namespace);
    }

    let shipment = Shipment::load(&cli.config, &settings)
        .await
        .with_context(|| format!("failed to load shipment from {}", cli.config))?;
    let harbor = Harbor::new(settings);
    let mut stdout = std::io::stdout();

    match cli.command {
        Commands::Dump => {
            let yaml = actions::dump(&harbor, &shipment).await?;
            print!("{}", yaml);
        }

        Commands::ListContainers => {
            for name in actions::list_containers(&shipment) {
                println!("{}", name);
            }
        }

        Commands::Localstart { container } => {
            actions::localstart(&harbor, &shipment, container.as_deref())
                .await
                .context("failed to start containers")?;
        }

        Commands::Localrestart { container } => {
            actions::localrestart(&harbor, &shipment, container.as_deref())
                .await
                .context("failed to restart containers")?;
        }

        Commands::Localexec { container, keep } => {
            actions::localexec(&harbor, &shipment, &container, keep, &mut stdout)
                .await
                .with_context(|| format!("failed to execute {}", container))?;
        }

        Commands::Localstatus {
            ship,
            container,
            diff,
        } => {
            let differs = actions::localstatus(
                &harbor,
                &shipment,
                ship.as_deref(),
                container.as_deref(),
                diff,
                &mut stdout,
            )
            .await?;
            if differs {
                return Ok(ExitCode::from(EXIT_DIFFERS as u8));
            }
        }

        Commands::Stop { ship, container } => {
            actions::stop(&harbor, &shipment, ship.as_deref(), container.as_deref())
                .await
                .context("failed to stop containers")?;
        }

        Commands::Logs {
            ship,
            container,
            follow,
        } => {
            tokio::select! {
                result = actions::logs(
                    &harbor,
                    &shipment,
                    ship.as_deref(),
                    container.as_deref(),
                    follow,
                    &mut stdout,
                ) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::debug!("interrupted");
                }
            }
        }

        Commands::Start(args) => {
            return remote(&harbor, &shipment, RemoteCommand::Start, args).await;
        }

        Commands::Restart(args) => {
            return remote(&harbor, &shipment, RemoteCommand::Restart, args).await;
        }

        Commands::Status(args) => {
            let command = RemoteCommand::Status {
                show_diff: args.diff,
            };
            return remote(&harbor, &shipment, command, args).await;
        }

        Commands::Build { container } => {
            actions::build(&harbor, &shipment, container.as_deref())
                .await
                .context("failed to build images")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn remote(
    harbor: &Harbor,
    shipment: &Shipment,
    command: RemoteCommand,
    args: RemoteArgs,
) -> anyhow::Result<ExitCode> {
    let mut stdout = std::io::stdout();
    let code = actions::remote(
        harbor,
        shipment,
        command,
        args.ship.as_deref(),
        args.container.as_deref(),
        args.keep,
        &mut stdout,
    )
    .await
    .with_context(|| format!("failed to run {:?} on ships", command))?;
    Ok(exit_code(code))
}
