use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

mod completion;
mod config;
mod flows;
mod render;

use completion::{write_completions_script, CliCompletionShell};
use config::{load_config, resolve_config_path, CONFIG_ENV_VAR};
use flows::AppContext;
use render::{current_output_style, TerminalRenderer};

const LOG_ENV_VAR: &str = "FLARM_LOG";

#[derive(Parser, Debug)]
#[command(name = "flarm")]
#[command(about = "Installer for FLARM app packages", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the per-user default.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Folder that holds installed packages.
    #[arg(long, global = true, value_name = "DIR")]
    install_root: Option<PathBuf>,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Disable rich progress output.
    #[arg(long, global = true)]
    plain: bool,
    /// A flarmstore: link or an .iflapp file, opened as with `flarm open`.
    #[arg(value_name = "REFERENCE")]
    reference: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show a package and whether it can be installed.
    Open { reference: String },
    Install { reference: String },
    /// Remove a package by reference or canonical folder name.
    Uninstall { reference: String },
    /// Launch an installed package.
    Run { reference: String },
    List,
    /// Print a link others can use to get the package.
    Share {
        reference: String,
        /// Skip the link shortener.
        #[arg(long)]
        long: bool,
    },
    Integrity {
        #[command(subcommand)]
        command: IntegrityCommand,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
    Doctor,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum IntegrityCommand {
    /// Report whether the link handler and file association are registered.
    Check,
    /// Re-register anything missing, elevating if the system requires it.
    Repair,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run_cli(cli)
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level(verbose).into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn verbosity_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    if let Some(Commands::Completions { shell }) = cli.command {
        let mut stdout = std::io::stdout();
        return write_completions_script(shell, &mut stdout);
    }

    let command = match (cli.command, cli.reference) {
        (Some(command), _) => command,
        (None, Some(reference)) => Commands::Open { reference },
        (None, None) => {
            Cli::command().print_help()?;
            return Ok(());
        }
    };

    let config_path = resolve_config_path(
        cli.config.as_deref(),
        std::env::var_os(CONFIG_ENV_VAR),
    );
    let config = load_config(config_path.as_deref())?;
    let install_root = config.resolve_install_root(cli.install_root.as_deref())?;
    debug!(
        install_root = %install_root.display(),
        config = ?config_path,
        "resolved settings"
    );
    let ctx = AppContext {
        config,
        config_path,
        install_root,
        renderer: TerminalRenderer::from_style(current_output_style(cli.plain)),
    };

    match command {
        Commands::Open { reference } => flows::run_open(&ctx, &reference),
        Commands::Install { reference } => flows::run_install(&ctx, &reference),
        Commands::Uninstall { reference } => flows::run_uninstall(&ctx, &reference),
        Commands::Run { reference } => flows::run_launch(&ctx, &reference),
        Commands::List => flows::run_list(&ctx),
        Commands::Share { reference, long } => flows::run_share(&ctx, &reference, long),
        Commands::Integrity { command } => match command {
            IntegrityCommand::Check => flows::run_integrity_check(&ctx),
            IntegrityCommand::Repair => flows::run_integrity_repair(&ctx),
        },
        Commands::Completions { .. } => Ok(()),
        Commands::Doctor => flows::run_doctor(&ctx),
    }
}
