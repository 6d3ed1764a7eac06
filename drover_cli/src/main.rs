use drover_core::{DroverConfig, EngineService, FuzzingTask};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Overrides `work-dir` from the configuration.
    #[clap(long)]
    work_dir: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the engines usable on this host.
    Engines,
    /// Run one fuzzing session and print its result.
    Fuzz(FuzzArgs),
    /// Minimize a crashing input.
    Minimize(TestcaseArgs),
    /// Run the target once on an input.
    Reproduce(TestcaseArgs),
    /// Measure coverage of an input or a corpus directory.
    Coverage(TestcaseArgs),
    /// Suggest engines for a target.
    Recommend {
        #[clap(long)]
        target: PathBuf,
        #[clap(last = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct FuzzArgs {
    #[clap(long)]
    target: PathBuf,
    #[clap(long)]
    corpus: Option<PathBuf>,
    /// Empty picks the preferred available engine.
    #[clap(long, default_value = "")]
    engine: String,
    #[clap(long)]
    timeout_secs: Option<u64>,
    #[clap(long)]
    memory_limit_mb: Option<u64>,
    #[clap(long)]
    max_crashes: Option<usize>,
    #[clap(long)]
    coverage: bool,
    #[clap(long)]
    minimize: bool,
    /// Engine option as `key=value`; may be repeated.
    #[clap(long = "option", value_parser = parse_option)]
    options: Vec<(String, String)>,
    /// Extra arguments, passed after every engine default.
    #[clap(last = true)]
    args: Vec<String>,
}

#[derive(Args, Debug)]
struct TestcaseArgs {
    #[clap(long)]
    target: PathBuf,
    #[clap(long)]
    testcase: PathBuf,
    #[clap(long)]
    engine: Option<String>,
    #[clap(last = true)]
    args: Vec<String>,
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn load_config(cli: &Cli) -> Result<DroverConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            DroverConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                DroverConfig::load_from_file(&default_config_path)?
            } else {
                info!("No config file specified and default 'config.toml' not found, using built-in defaults.");
                DroverConfig::default()
            }
        }
    };
    if let Some(work_dir) = &cli.work_dir {
        config.work_dir = work_dir.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), anyhow::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// The engine named on the command line, or the one a task for `target` would
/// get by default.
fn engine_name(
    service: &EngineService,
    engine: Option<String>,
    target: &Path,
) -> Result<String, anyhow::Error> {
    match engine {
        Some(name) => Ok(name),
        None => Ok(service
            .select_engine(&FuzzingTask::new(target))?
            .name()
            .to_string()),
    }
}

async fn fuzz(service: &EngineService, args: FuzzArgs) -> Result<(), anyhow::Error> {
    let mut task = FuzzingTask::new(args.target)
        .with_engine(args.engine)
        .with_args(args.args)
        .with_coverage(args.coverage)
        .with_minimization(args.minimize);
    if let Some(corpus) = args.corpus {
        task = task.with_corpus(corpus);
    }
    if let Some(secs) = args.timeout_secs {
        task = task.with_timeout(Duration::from_secs(secs));
    }
    if let Some(mb) = args.memory_limit_mb {
        task = task.with_memory_limit_mb(mb);
    }
    if let Some(max) = args.max_crashes {
        task = task.with_max_crashes(max);
    }
    for (key, value) in args.options {
        task = task.with_option(key, value);
    }

    let run = service.start_fuzzing(task)?;
    let engine = run.engine.clone();
    let session_id = run.session_id;
    let wait = run.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!(session = %session_id, "Interrupted, stopping session");
            service.stop_fuzzing(&engine, session_id)?;
            wait.await?
        }
    };
    print_json(&result)
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let service = EngineService::start(config).await?;

    let outcome = match cli.command {
        Command::Engines => print_json(&service.available_engines()),
        Command::Fuzz(args) => fuzz(&service, args).await,
        Command::Minimize(args) => {
            let engine = engine_name(&service, args.engine, &args.target)?;
            let minimized = service
                .minimize_test_case(&engine, args.testcase, args.target, args.args)?
                .wait()
                .await?;
            print_json(&minimized)
        }
        Command::Reproduce(args) => {
            let engine = engine_name(&service, args.engine, &args.target)?;
            let reproduction = service
                .reproduce_crash(&engine, args.testcase, args.target, args.args)?
                .wait()
                .await?;
            print_json(&reproduction)
        }
        Command::Coverage(args) => {
            let engine = engine_name(&service, args.engine, &args.target)?;
            let coverage = service
                .generate_coverage(&engine, args.testcase, args.target, args.args)?
                .wait()
                .await?;
            print_json(&coverage)
        }
        Command::Recommend { target, args } => {
            print_json(&service.engine_recommendations(&target, &args))
        }
    };

    service.shutdown();
    outcome
}
