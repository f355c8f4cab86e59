use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cronloop::config::{AppConfig, CliConfig, FileConfig};
use cronloop::lock::{ExecutionLockStore, LockCoordinator, SqliteExecutionLockStore};
use cronloop::process::{listen_for_termination, ProcessGraph, ProcessHandle};
use cronloop::runner::{
    is_worker_process, worker_pidfile, RunLoopController, SelfExecLauncher, ShellCommandStep,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(
    name = "cronloop",
    about = "Runs a command repeatedly under a runtime budget, with optional singleton locking and multi-process fan-out."
)]
struct CliArgs {
    /// The command executed on every loop iteration.
    command: String,

    /// Arguments passed to the command.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Maximum execution time in seconds; values below 1 disable the budget.
    #[clap(short = 't', long, default_value_t = 50)]
    runtime: i64,

    /// How often the command may run within one process (0 = no limit).
    #[clap(short = 'l', long, default_value_t = 0)]
    max_loops: u64,

    /// Number of worker processes to fan out to.
    #[clap(short, long, default_value_t = 1)]
    workers: usize,

    /// Allow only one active instance of this command, via the lock database.
    #[clap(long)]
    singleton: bool,

    /// Seconds until a held singleton lock counts as abandoned; a value
    /// beyond the current epoch second is used as an absolute deadline.
    #[clap(long, default_value_t = 3600)]
    singleton_timeout: i64,

    /// Path to the SQLite lock database (required with --singleton).
    #[clap(long, value_parser = parse_path)]
    lock_db: Option<PathBuf>,

    /// Pidfile for this run; fan-out workers get ".N" suffixed copies.
    #[clap(long, value_parser = parse_path)]
    pidfile: Option<PathBuf>,

    /// Seconds to sleep between iteration bursts (0 = no pacing).
    #[clap(long, default_value_t = 1)]
    pause_secs: u64,

    /// How long iterations may burst before the next pause is due
    /// (0 = pause after every iteration).
    #[clap(long, default_value_t = 0)]
    pause_interval_secs: u64,

    /// Optional TOML config file; file values override CLI values.
    #[clap(long, value_parser = parse_path)]
    config: Option<PathBuf>,
}

/// Lock records are keyed by the full command line, so the same program
/// with different arguments counts as a different job.
fn lock_key(cli_args: &CliArgs) -> String {
    let mut key = cli_args.command.clone();
    for arg in &cli_args.args {
        key.push(' ');
        key.push_str(arg);
    }
    key
}

fn main() {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let code = match run(cli_args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli_args: CliArgs) -> Result<i32> {
    let file_config = cli_args
        .config
        .as_ref()
        .map(|path| FileConfig::load(path))
        .transpose()?;

    let cli_config = CliConfig {
        runtime: cli_args.runtime,
        max_loops: cli_args.max_loops,
        workers: cli_args.workers,
        singleton: cli_args.singleton,
        singleton_timeout: cli_args.singleton_timeout,
        lock_db: cli_args.lock_db.clone(),
        pidfile: cli_args.pidfile.clone(),
        pause_secs: cli_args.pause_secs,
        pause_interval_secs: cli_args.pause_interval_secs,
    };
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    let graph = Arc::new(ProcessGraph::new());

    if is_worker_process() {
        return run_worker(&app_config, graph, &cli_args);
    }

    info!(
        "cronloop {} ({}) running '{}' (runtime: {:?}, max loops: {}, workers: {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        cli_args.command,
        app_config.settings.runtime_max,
        app_config.settings.max_iterations,
        app_config.settings.workers,
    );

    let mut controller = RunLoopController::new(app_config.settings.clone(), Arc::clone(&graph))
        .with_launcher(Box::new(SelfExecLauncher::from_current_invocation(
            app_config.settings.pidfile.clone(),
        )));

    if app_config.settings.singleton {
        let lock_db = app_config
            .lock_db
            .as_ref()
            .context("singleton mode requires a lock database path")?;
        let store: Arc<dyn ExecutionLockStore> =
            Arc::new(SqliteExecutionLockStore::new(lock_db)?);
        controller = controller.with_coordinator(LockCoordinator::new(
            store,
            lock_key(&cli_args),
            app_config.singleton_timeout,
        ));
    }

    // This process's own handle: carries the pidfile when the loop runs
    // here, and cascades termination signals to any spawned workers.
    let self_handle = Arc::new(match &app_config.settings.pidfile {
        Some(path) if app_config.settings.workers <= 1 => {
            std::fs::write(path, std::process::id().to_string())
                .with_context(|| format!("Failed to write pidfile {:?}", path))?;
            ProcessHandle::with_pidfile(Arc::clone(&graph), path.clone())
        }
        _ => ProcessHandle::new(Arc::clone(&graph)),
    });
    listen_for_termination(Arc::clone(&self_handle));

    let mut step = ShellCommandStep::new(&cli_args.command, cli_args.args.clone());
    let result = controller.run(&mut step);
    self_handle.remove_pidfile();
    let report = result?;

    if !report.succeeded() {
        error!("Not all workers exited before the deadline");
        return Ok(1);
    }
    Ok(0)
}

/// The worker continuation: this process was spawned by a fan-out parent
/// and runs the full loop itself, then always exits.
fn run_worker(app_config: &AppConfig, graph: Arc<ProcessGraph>, cli_args: &CliArgs) -> Result<i32> {
    let handle = Arc::new(ProcessHandle::for_current_process(
        Arc::clone(&graph),
        worker_pidfile(),
    ));
    listen_for_termination(Arc::clone(&handle));

    let mut controller = RunLoopController::new(app_config.settings.clone(), graph);
    let mut step = ShellCommandStep::new(&cli_args.command, cli_args.args.clone());
    let result = controller.run(&mut step);

    // The worker cleans up its own pidfile no matter how the loop ended
    handle.remove_pidfile();
    result?;
    Ok(0)
}
