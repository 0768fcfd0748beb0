use clap::{Args, Parser, Subcommand};
use plinth::config::{self, ConfigSources, ConfigSnapshot};
use plinth::context::CancelToken;
use plinth::hooks::Stage;
use plinth::runner::{BuildError, RunOptions, Runner};
use plinth::{output, plugins};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Flags shared by every command that resolves configuration.
#[derive(Args, Clone)]
struct ConfigArgs {
    /// Project config file (default: ./plinth.toml when present)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Set a config value, e.g. -s site.title="My Site" (repeatable)
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
}

#[derive(Args, Clone)]
struct BuildArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Output directory (same as -s build.output=DIR)
    #[arg(short = 'o', long = "output", value_name = "DIR")]
    output: Option<PathBuf>,

    /// Disable the content cache for this build
    #[arg(long)]
    no_cache: bool,

    /// Process every document, even ones that match a previous build
    #[arg(long)]
    no_skip: bool,
}

#[derive(Parser)]
#[command(name = "plinth")]
#[command(version)]
#[command(about = "Plugin-driven content build pipeline")]
#[command(long_about = "\
Plugin-driven content build pipeline

Source files are discovered, loaded as documents with front matter, and passed
through a fixed sequence of stages. Plugins hook into each stage:

  configure → glob → load → pre_render → render → post_render → save → teardown

Configuration layers, later ones win:

  built-in defaults
  ~/.config/plinth/config.toml
  ./plinth.toml (or -c FILE)
  PLINTH_SECTION__KEY=value environment variables
  -s section.key=value flags

Unchanged documents are skipped on rebuild. Set PLINTH_NO_SKIP=1 or pass
--no-skip to force a full build. Logging is controlled by PLINTH_LOG
(e.g. PLINTH_LOG=plinth=debug).

Run 'plinth gen-config' to print a documented plinth.toml.")]
struct Cli {
    /// Log more (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline and write the site
    Build(BuildArgs),
    /// Validate config, plugins and documents without rendering
    Check(ConfigArgs),
    /// Remove the output directory and the content cache
    Clean(ConfigArgs),
    /// Print a stock plinth.toml with all core options documented
    GenConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(inner) = cause {
                eprintln!("    caused by: {inner}");
                cause = inner.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<ExitCode, Box<dyn Error>> {
    let working_dir = std::env::current_dir()?;
    match command {
        Command::Build(args) => {
            let mut overrides = args.config.set.clone();
            if let Some(output) = &args.output {
                overrides.push(format!("build.output={}", quoted(output)));
            }
            if args.no_cache {
                overrides.push("cache.enabled=false".to_string());
            }
            let config = resolve_config(&args.config.config, overrides, &working_dir)?;

            let cancel = CancelToken::new();
            install_interrupt_handler(&cancel);
            let mut options = RunOptions::new(&working_dir);
            options.no_skip = args.no_skip;
            options.cancel = cancel;

            let runner = Runner::from_plugins(plugins::defaults(), config, options)?;
            match runner.run() {
                Ok(report) => {
                    output::print_build_report(&report);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(report_failure(&e)),
            }
        }
        Command::Check(args) => {
            let config = resolve_config(&args.config, args.set.clone(), &working_dir)?;
            let mut options = RunOptions::new(&working_dir);
            options.stop_after = Some(Stage::Load);
            options.no_skip = true;

            let runner = Runner::from_plugins(plugins::defaults(), config, options)?;
            match runner.run() {
                Ok(report) => {
                    output::print_check_report(runner.registry(), &report);
                    if report.failed.is_empty() {
                        Ok(ExitCode::SUCCESS)
                    } else {
                        Ok(ExitCode::FAILURE)
                    }
                }
                Err(e) => Ok(report_failure(&e)),
            }
        }
        Command::Clean(args) => {
            let config = resolve_config(&args.config, args.set.clone(), &working_dir)?;
            let core = config.core();
            for dir in [&core.build.output, &core.cache.dir] {
                remove_dir(&working_dir.join(dir))?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn resolve_config(
    explicit: &Option<PathBuf>,
    overrides: Vec<String>,
    working_dir: &Path,
) -> Result<ConfigSnapshot, config::ConfigError> {
    ConfigSources::discover(explicit.as_deref(), working_dir, overrides).resolve()
}

/// Print a failed build and pick the exit code: 130 for Ctrl-C, 1 otherwise.
fn report_failure(error: &BuildError) -> ExitCode {
    output::print_build_error(error);
    match error {
        BuildError::Interrupted => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}

/// Quote a path as a string literal for an override flag, so a name like
/// `2024` is not read as a number.
fn quoted(path: &Path) -> String {
    serde_json::Value::String(path.to_string_lossy().into_owned()).to_string()
}

fn remove_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            println!("Removed {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `PLINTH_LOG` wins, then `RUST_LOG`, then `info` (or `debug` with `-v`).
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("PLINTH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| {
            EnvFilter::new(if verbose {
                "plinth=debug"
            } else {
                "plinth=info"
            })
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// First Ctrl-C cancels the build at the next checkpoint; teardown still runs.
fn install_interrupt_handler(cancel: &CancelToken) {
    let cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, stopping after the current step");
        cancel.cancel();
    }) {
        tracing::warn!(error = %e, "could not install Ctrl-C handler");
    }
}
