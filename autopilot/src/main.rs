//! Command-line front end for the autopilot driver.
//!
//! Loads `autopilot.toml`, queues tasks from a task file or the command line,
//! and drives one or more PTY sessions until the queue is drained.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use autopilot::cancel::CancelToken;
use autopilot::core::classifier::ScreenAnalyzer;
use autopilot::core::patterns::PatternSet;
use autopilot::core::types::ReadinessState;
use autopilot::dispatch::{DispatchSummary, LoopStop, RunMode};
use autopilot::distributor::{Distributor, WorkerFactory};
use autopilot::exit_codes;
use autopilot::health::HealthMonitor;
use autopilot::io::checks::ShellCheckRunner;
use autopilot::io::config::{
    AutopilotConfig, DEFAULT_CONFIG_FILE, load_config, load_pattern_set, write_config,
};
use autopilot::io::pty::PtySpawner;
use autopilot::io::store::{FileQueue, MemoryQueue, SharedQueue, TaskQueue};
use autopilot::io::telemetry::{FanOutSink, JsonLinesSink, SharedSink, TracingSink};
use autopilot::logging;
use autopilot::registry::SessionRegistry;

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Drive an interactive coding CLI through a pseudo-terminal"
)]
struct Cli {
    /// Path to the driver config.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Feed queued tasks to the CLI until the queue is drained.
    Run {
        /// JSON task file; created when missing and updated as tasks finish.
        #[arg(long)]
        tasks: Option<PathBuf>,
        /// Task text to append to the queue (repeatable).
        #[arg(long = "task")]
        task: Vec<String>,
        /// Check ids to attach to every task added with --task.
        #[arg(long = "check")]
        check: Vec<String>,
        /// Number of parallel sessions.
        #[arg(short, long, default_value_t = 1)]
        workers: usize,
        /// Keep polling the task file for new work instead of exiting when idle.
        #[arg(long)]
        watch: bool,
        /// Append driver events as JSON lines to this file (`-` for stdout).
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Classify a captured screen dump as busy, waiting or ready.
    Classify {
        /// Raw PTY output captured to a file.
        dump: PathBuf,
        /// Milliseconds of silence to assume since the last output.
        #[arg(long, default_value_t = 0)]
        quiet_ms: u64,
    },
    /// Print the built-in pattern set as TOML.
    Patterns,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            tasks,
            task,
            check,
            workers,
            watch,
            events,
        } => {
            let options = RunOptions {
                tasks,
                task,
                check,
                workers,
                mode: if watch {
                    RunMode::UntilStopped
                } else {
                    RunMode::UntilIdle
                },
                events,
            };
            cmd_run(&cli.config, options)
        }
        Command::Classify { dump, quiet_ms } => cmd_classify(&cli.config, &dump, quiet_ms),
        Command::Patterns => cmd_patterns(),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} already exists", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &AutopilotConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

struct RunOptions {
    tasks: Option<PathBuf>,
    task: Vec<String>,
    check: Vec<String>,
    workers: usize,
    mode: RunMode,
    events: Option<PathBuf>,
}

fn cmd_run(config_path: &Path, options: RunOptions) -> Result<i32> {
    if options.workers == 0 {
        bail!("--workers must be at least 1");
    }
    let config = load_config(config_path)?;
    let patterns = load_pattern_set(&config)?.compile()?;
    let checks = ShellCheckRunner::new(config.checks.clone(), config.session.cwd.clone());
    let events = event_sink(options.events.as_deref())?;
    let interrupt = CancelToken::new();
    install_interrupt_handler(interrupt.clone())?;
    let factory = WorkerFactory::new(config.clone(), patterns, Arc::new(PtySpawner), Arc::new(checks))
        .with_events(Arc::clone(&events))
        .with_interrupt(interrupt.clone());

    let summary = match &options.tasks {
        Some(path) => {
            let mut queue = FileQueue::open(path)?;
            for text in &options.task {
                queue.push_with_checks(text.as_str(), options.check.iter().cloned())?;
            }
            drive(factory, &config, events, SharedQueue::new(queue), &options, &interrupt)?
        }
        None => {
            if options.task.is_empty() {
                bail!("nothing to do: pass --tasks or at least one --task");
            }
            let mut queue = MemoryQueue::new();
            for text in &options.task {
                queue.push_with_checks(text.as_str(), options.check.iter().cloned());
            }
            drive(factory, &config, events, SharedQueue::new(queue), &options, &interrupt)?
        }
    };

    println!(
        "completed {}, failed {}",
        summary.completed, summary.failed
    );
    Ok(match summary.stop {
        _ if interrupt.is_cancelled() => exit_codes::INTERRUPTED,
        LoopStop::Cancelled => exit_codes::INTERRUPTED,
        _ if summary.failed > 0 => exit_codes::TASKS_FAILED,
        _ => exit_codes::OK,
    })
}

fn drive<Q>(
    factory: WorkerFactory,
    config: &AutopilotConfig,
    events: SharedSink,
    queue: SharedQueue<Q>,
    options: &RunOptions,
    interrupt: &CancelToken,
) -> Result<DispatchSummary>
where
    Q: TaskQueue + Send,
{
    let registry = Arc::new(SessionRegistry::new());
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&registry),
        config.health.clone(),
        events,
    ));
    let monitor_stop = CancelToken::new();
    let monitor_thread = monitor
        .spawn(monitor_stop.clone())
        .context("spawn health monitor")?;

    let distributor = Distributor::new(factory, registry);
    let result = distributor.run(&queue, options.workers, options.mode, interrupt);

    monitor_stop.cancel();
    if monitor_thread.join().is_err() {
        eprintln!("health monitor thread panicked");
    }
    result
}

/// First Ctrl-C (or SIGTERM) cancels running sends so workers stop their
/// sessions and exit. A second one terminates immediately.
fn install_interrupt_handler(interrupt: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        if interrupt.is_cancelled() {
            std::process::exit(exit_codes::INTERRUPTED);
        }
        warn!("interrupted; stopping sessions");
        interrupt.cancel();
    })
    .context("install interrupt handler")
}

fn event_sink(path: Option<&Path>) -> Result<SharedSink> {
    let mut sink = FanOutSink::new(vec![Arc::new(TracingSink)]);
    match path {
        None => {}
        Some(path) if path == Path::new("-") => {
            sink.push(Arc::new(JsonLinesSink::new(io::stdout())));
        }
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open event log {}", path.display()))?;
            sink.push(Arc::new(JsonLinesSink::new(BufWriter::new(file))));
        }
    }
    Ok(Arc::new(sink))
}

#[derive(Serialize)]
struct ClassifyReport {
    state: ReadinessState,
    ready_match: Option<String>,
    permission_match: Option<String>,
    busy_after_ready: bool,
    resolved: bool,
}

fn cmd_classify(config_path: &Path, dump: &Path, quiet_ms: u64) -> Result<i32> {
    let config = load_config(config_path)?;
    let patterns = load_pattern_set(&config)?.compile()?;
    let bytes = fs::read(dump).with_context(|| format!("read {}", dump.display()))?;
    let analyzer = ScreenAnalyzer::new(patterns, config.session.debounce());

    let frame = analyzer.inspect(&bytes);
    let report = ClassifyReport {
        state: analyzer.classify(&bytes, Duration::from_millis(quiet_ms)),
        ready_match: frame.ready,
        permission_match: frame.permission,
        busy_after_ready: frame.busy,
        resolved: frame.resolved,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize report")?
    );
    Ok(exit_codes::OK)
}

fn cmd_patterns() -> Result<i32> {
    let toml = toml::to_string_pretty(&PatternSet::default()).context("serialize pattern set")?;
    print!("{toml}");
    Ok(exit_codes::OK)
}
