//! Daijin CLI Entry Point
//!
//! Provides the command-line interface for pipeline execution.
//!
//! # Usage
//!
//! ```bash
//! # Build every terminal output of daijin.yaml
//! daijin run --config config.yaml
//!
//! # Build one output (and whatever it needs)
//! daijin run blastx/all.tsv
//!
//! # Preview what would run
//! daijin dry-run --set blastx.chunks=8
//!
//! # Remove declared outputs and logs
//! daijin clean --working-dir /data/analysis
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use log::{error, info, warn};

use daijin::config::RunConfig;
use daijin::execution::{Budget, Engine, RunStatus};
use daijin::workflow::load_catalog;
use daijin::{EngineError, APP_NAME, VERSION};

/// Default catalog file used when none is specified.
const DEFAULT_CATALOG: &str = "daijin.yaml";

/// Default number of concurrently running nodes.
const DEFAULT_JOBS: usize = 4;

const EXIT_FAILURE: u8 = 1;
const EXIT_BUILD_ERROR: u8 = 2;
const EXIT_PARTIAL: u8 = 3;
const EXIT_USAGE: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    DryRun,
    Clean,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    targets: Vec<String>,
    catalog_path: PathBuf,
    config_path: Option<PathBuf>,
    overrides: Vec<String>,
    working_dir: Option<PathBuf>,
    jobs: usize,
    threads: Option<usize>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: Command::Run,
            targets: Vec::new(),
            catalog_path: PathBuf::from(DEFAULT_CATALOG),
            config_path: None,
            overrides: Vec::new(),
            working_dir: None,
            jobs: DEFAULT_JOBS,
            threads: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Declarative Task-Graph Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: daijin <COMMAND> [OPTIONS] [TARGET...]");
    println!();
    println!("Commands:");
    println!("  run [TARGET...]      Build targets (default: every terminal output)");
    println!("  dry-run [TARGET...]  Show what would run without launching anything");
    println!("  clean                Remove declared outputs, logs and engine state");
    println!();
    println!("Targets are output paths, node ids (align[chunk=002]) or step names.");
    println!();
    println!("Options:");
    println!("  --catalog PATH       Step catalog (default: {})", DEFAULT_CATALOG);
    println!("  --config PATH        Runtime configuration YAML");
    println!("  --set KEY=VALUE      Override a configuration value (repeatable)");
    println!("  --working-dir PATH   Directory relative paths resolve against");
    println!("  --jobs N             Maximum concurrent nodes (default: {})", DEFAULT_JOBS);
    println!("  --threads N          Thread budget (default: CPU count)");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  daijin run --config config.yaml");
    println!("  daijin dry-run --set blastx.chunks=8");
    println!("  daijin run blastx/all.tsv --jobs 8 --threads 32");
}

fn take_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", option))
}

fn parse_count(value: &str, option: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid {} value: {}", option, value)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut command = None;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--catalog" => {
                config.catalog_path = PathBuf::from(take_value(args, &mut i, arg)?);
            }
            "--config" => {
                config.config_path = Some(PathBuf::from(take_value(args, &mut i, arg)?));
            }
            "--set" => {
                config.overrides.push(take_value(args, &mut i, arg)?.to_string());
            }
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(take_value(args, &mut i, arg)?));
            }
            "--jobs" | "-j" => {
                config.jobs = parse_count(take_value(args, &mut i, arg)?, arg)?;
            }
            "--threads" => {
                config.threads = Some(parse_count(take_value(args, &mut i, arg)?, arg)?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ if command.is_none() => {
                command = Some(match arg.as_str() {
                    "run" => Command::Run,
                    "dry-run" => Command::DryRun,
                    "clean" => Command::Clean,
                    other => return Err(format!("Unknown command: {}", other)),
                });
            }
            _ => config.targets.push(arg.clone()),
        }
        i += 1;
    }

    config.command = command.ok_or_else(|| "No command given".to_string())?;
    if config.command == Command::Clean && !config.targets.is_empty() {
        return Err("clean does not take targets".to_string());
    }

    Ok(config)
}

/// Loads runtime configuration and applies `--set` overrides.
fn load_run_config(config: &Config) -> daijin::Result<RunConfig> {
    let mut run_config = match &config.config_path {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::new(),
    };
    for assignment in &config.overrides {
        run_config.apply_override(assignment)?;
    }
    Ok(run_config)
}

/// Validates the working directory, if one was given.
fn check_working_directory(dir: &Path) -> daijin::Result<()> {
    if !dir.exists() {
        return Err(EngineError::Configuration(format!(
            "working directory does not exist: {}",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(EngineError::Configuration(format!(
            "path is not a directory: {}",
            dir.display()
        )));
    }
    Ok(())
}

/// Executes the selected command and returns the overall run status.
async fn execute(config: Config) -> daijin::Result<RunStatus> {
    let catalog = load_catalog(&config.catalog_path)?;
    info!("Catalog loaded: {} steps", catalog.len());

    let run_config = load_run_config(&config)?;

    let mut engine = Engine::new(catalog, run_config);
    if let Some(dir) = &config.working_dir {
        check_working_directory(dir)?;
        engine.set_working_dir(dir.clone());
    }
    let threads = config.threads.unwrap_or_else(num_cpus::get);
    engine.set_budget(Budget::new(config.jobs, threads));

    info!("Working directory: {}", engine.working_dir()?.display());

    match config.command {
        Command::DryRun => {
            info!("Mode: DRY RUN (commands will not execute)");
            let plan = engine.plan(&config.targets)?;
            plan.print();
            Ok(RunStatus::Success)
        }
        Command::Clean => {
            let removed = engine.clean()?;
            for path in &removed {
                println!("removed {}", path.display());
            }
            info!("Removed {} path(s)", removed.len());
            Ok(RunStatus::Success)
        }
        Command::Run => {
            info!(
                "Budget: {} jobs, {} threads",
                engine.budget().jobs,
                engine.budget().threads
            );

            let cancel = engine.cancellation();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    let _ = cancel.send(true);
                }
            });

            let summary = engine.run(&config.targets).await?;
            summary.print();
            Ok(summary.status)
        }
    }
}

/// Maps the outcome of a command to the process exit code.
fn exit_code(result: &daijin::Result<RunStatus>) -> u8 {
    match result {
        Ok(RunStatus::Success) => 0,
        Ok(RunStatus::Failure) => EXIT_FAILURE,
        Ok(RunStatus::Partial) => EXIT_PARTIAL,
        Err(e) if e.is_build_error() => EXIT_BUILD_ERROR,
        Err(_) => EXIT_FAILURE,
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    let config = match parse_arguments(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    setup_logging(config.verbose);
    print_banner();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let result = runtime.block_on(execute(config));
    if let Err(e) = &result {
        eprintln!();
        eprintln!("Error: {}", e);
    }
    ExitCode::from(exit_code(&result))
}
