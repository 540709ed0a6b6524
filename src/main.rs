//! hotrack: rebuilds and restarts applications when their sources change.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, sets up logging, loads configuration, and hands the selected
//! applications to the orchestrator.

mod config;
mod error;
mod orchestrator;
mod output;
mod process;
mod runner;
mod scaffold;
mod session;
mod signals;
mod watch;

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{CommandFactory, Parser, Subcommand};

use crate::config::{app_specs, load_config, DEFAULT_CONFIG_FILE};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "hotrack",
    version,
    about = "Live-reload supervisor for development builds",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to hotrack.toml configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Quiet period after the last file change before restarting (ms).
    #[arg(long, global = true, default_value_t = 300)]
    debounce_ms: u64,
    /// Time to wait after the stop signal before force-killing (ms).
    #[arg(long, global = true, default_value_t = 5000)]
    kill_grace_ms: u64,
    /// Upper bound for stopping all applications on exit (ms).
    #[arg(long, global = true, default_value_t = 10000)]
    shutdown_timeout_ms: u64,
    /// Disable colored prefixes and strip colors from app output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Log debug messages.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the named applications (all when none are given).
    Run {
        /// Application names from the configuration file.
        apps: Vec<String>,
    },
    /// Create a hotrack.toml for the project in the current directory.
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },
    /// Show help information.
    Help,
    /// Show version information.
    Version,
    /// Print the ANSI banner.
    Banner,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    output::set_colors(!cli.no_color);

    let selected = match &cli.command {
        Some(Commands::Help) => {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        }
        Some(Commands::Version) => {
            println!("hotrack {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Commands::Banner) => {
            print_ansi_banner();
            return Ok(());
        }
        Some(Commands::Init { force }) => return run_init(&cli, *force),
        Some(Commands::Run { apps }) => apps.clone(),
        None => Vec::new(),
    };

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = load_config(&config_path).map_err(|err| {
        if !config_path.exists() {
            log::info!("Run 'hotrack init' to create a configuration.");
        }
        err
    })?;
    let base_dir = std::env::current_dir().context("failed to read current directory")?;
    let specs = app_specs(&config, &base_dir)?;
    if specs.is_empty() {
        bail!("no applications defined in {}", config_path.display());
    }

    let settings = OrchestratorSettings {
        debounce: Duration::from_millis(cli.debounce_ms),
        stop_grace: Duration::from_millis(cli.kill_grace_ms),
        shutdown_timeout: Duration::from_millis(cli.shutdown_timeout_ms),
    };
    let orchestrator = Orchestrator::new(specs, settings);
    orchestrator.run(&selected).await?;
    Ok(())
}

fn run_init(cli: &Cli, force: bool) -> Result<()> {
    let dir = std::env::current_dir().context("failed to read current directory")?;
    let target = cli
        .config
        .clone()
        .unwrap_or_else(|| scaffold::default_target(&dir));
    let project = scaffold::init(&dir, &target, force)?;
    print!("{}", scaffold::summary(&project));
    println!("Created {}", target.display());
    println!("Run 'hotrack' to start watching.");
    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} hotrack {}: {}",
                clock(),
                record.level().as_str().to_lowercase(),
                record.args()
            )
        })
        .init();
}

// Wall-clock time of day (UTC) as HH:MM:SS.
fn clock() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

fn print_ansi_banner() {
    let c1 = "\x1b[38;5;202m";
    let c2 = "\x1b[38;5;208m";
    let c3 = "\x1b[38;5;214m";
    let reset = "\x1b[0m";
    let lines = [
        "██╗  ██╗ ██████╗ ████████╗██████╗  █████╗  ██████╗██╗  ██╗",
        "██║  ██║██╔═══██╗╚══██╔══╝██╔══██╗██╔══██╗██╔════╝██║ ██╔╝",
        "███████║██║   ██║   ██║   ██████╔╝███████║██║     █████╔╝ ",
        "██╔══██║██║   ██║   ██║   ██╔══██╗██╔══██║██║     ██╔═██╗ ",
        "██║  ██║╚██████╔╝   ██║   ██║  ██║██║  ██║╚██████╗██║  ██╗",
        "╚═╝  ╚═╝ ╚═════╝    ╚═╝   ╚═╝  ╚═╝╚═╝  ╚═╝ ╚═════╝╚═╝  ╚═╝",
    ];
    for (idx, line) in lines.iter().enumerate() {
        if !output::colors_enabled() {
            println!("{}", line);
            continue;
        }
        let color = match idx % 3 {
            0 => c1,
            1 => c2,
            _ => c3,
        };
        println!("{}{}{}", color, line, reset);
    }
}
