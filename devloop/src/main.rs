//! devloop - inner-loop development against a remote cluster.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use devloop::DevloopError;
use devloop::commands::{self, Project};
use devloop::runner::PipelineRequest;
use devloop::session::{PushOptions, SessionOptions};
use devloop::status::OutputFormat;
use devloop_common::{LogConfig, init_logging};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "devloop")]
#[command(author, version, about = "Sync, run and watch a component on a remote cluster")]
struct Cli {
    /// Project directory containing devloop.toml
    #[arg(long, global = true, env = "DEVLOOP_PROJECT")]
    project: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync, run, forward ports and watch for changes
    Dev {
        /// Run the debug command group instead of run
        #[arg(long)]
        debug: bool,

        /// Forward endpoints to random free local ports
        #[arg(long)]
        random_ports: bool,

        /// Run once and keep running without watching for changes
        #[arg(long)]
        no_watch: bool,

        /// Delete the workload and the file index on exit
        #[arg(long)]
        cleanup: bool,
    },

    /// Push local changes once and run the pipeline
    Push {
        #[arg(long)]
        debug: bool,

        /// Build command to run instead of the default
        #[arg(long, value_name = "NAME")]
        build_command: Option<String>,

        /// Run command to run instead of the default
        #[arg(long, value_name = "NAME")]
        run_command: Option<String>,

        /// Push every file and run the pipeline even without changes
        #[arg(short = 'f', long)]
        force_build: bool,
    },

    /// Watch for changes and push them, without forwarding ports
    Watch,

    /// Debug session helpers
    Debug {
        #[command(subcommand)]
        action: DebugAction,
    },

    /// Show container logs
    Logs {
        #[arg(long)]
        follow: bool,

        /// Logs of the debug command's container
        #[arg(long)]
        debug: bool,
    },

    /// Run the test command group
    Test {
        #[arg(long, value_name = "NAME")]
        test_command: Option<String>,
    },

    /// Show the state of supervised programs
    Status {
        #[arg(short, long, value_enum, default_value_t = Format::Human)]
        output: Format,
    },
}

#[derive(Subcommand)]
enum DebugAction {
    /// Forward the debug endpoint to a local port
    PortForward {
        #[arg(long)]
        local_port: Option<u16>,
    },

    /// Print the running debug session
    Info {
        #[arg(short, long, value_enum, default_value_t = Format::Human)]
        output: Format,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Human,
    Json,
}

impl From<Format> for OutputFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Human => OutputFormat::Human,
            Format::Json => OutputFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("warn").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _guards = match init_logging(&log_config) {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e}");
            None
        }
    };

    if let Err(err) = run(cli).await {
        std::process::exit(report(&err));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let root = match cli.project {
        Some(root) => root,
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };
    let project = Project::load(&root)?;
    debug!(root = %project.root.display(), "Running command");
    let human = OutputFormat::Human;

    match cli.command {
        Commands::Dev {
            debug,
            random_ports,
            no_watch,
            cleanup,
        } => {
            let options = SessionOptions {
                pipeline: PipelineRequest {
                    debug,
                    ..PipelineRequest::default()
                },
                random_ports,
                watch: !no_watch,
                owns_workload: cleanup,
                ..SessionOptions::default()
            };
            commands::dev::dev(&project, options, human).await?;
        }
        Commands::Push {
            debug,
            build_command,
            run_command,
            force_build,
        } => {
            let push = PushOptions {
                pipeline: PipelineRequest {
                    debug,
                    build_command,
                    run_command,
                },
                force: force_build,
            };
            commands::dev::push(&project, push, human).await?;
        }
        Commands::Watch => commands::dev::watch(&project, human).await?,
        Commands::Debug { action } => match action {
            DebugAction::PortForward { local_port } => {
                commands::debug::port_forward(&project, local_port, human).await?;
            }
            DebugAction::Info { output } => {
                commands::debug::info(&project, output.into()).await?;
            }
        },
        Commands::Logs { follow, debug } => commands::inspect::logs(&project, follow, debug).await?,
        Commands::Test { test_command } => {
            commands::inspect::test(&project, test_command.as_deref(), human).await?;
        }
        Commands::Status { output } => commands::inspect::status(&project, output.into()).await?,
    }
    Ok(())
}

/// Print `err` and return the process exit code.
fn report(err: &anyhow::Error) -> i32 {
    let Some(devloop_err) = err.downcast_ref::<DevloopError>() else {
        eprintln!("{} {:#}", "Error:".red().bold(), err);
        return 1;
    };
    let code = devloop_err.code();
    eprintln!(
        "{} {}: {}",
        format!("Error [{}]", code.code_string()).red().bold(),
        devloop_err.category_label(),
        devloop_err
    );
    for step in code.remediation() {
        eprintln!("  {} {}", "→".dimmed(), step);
    }
    devloop_err.exit_code()
}
