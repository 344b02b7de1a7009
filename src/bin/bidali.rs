use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use bidali::app::App;
use bidali::catalog::builtin_registry;
use bidali::config::ConfigLoader;
use bidali::domain::DatasetSpecifier;
use bidali::error::BidaliError;
use bidali::orchestrator::LoadOptions;
use bidali::output::{HumanOutput, JsonOutput, LoadReport, OutputMode};

#[derive(Parser)]
#[command(name = "bidali")]
#[command(about = "Biological datasets through a checksummed local cache")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./bidali.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Never touch the network; serve cached entries, stale or not.
    #[arg(long, global = true)]
    offline: bool,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load, inspect and manage cached datasets")]
    Data(DataArgs),
}

#[derive(Args)]
struct DataArgs {
    #[command(subcommand)]
    command: DataCommand,
}

#[derive(Subcommand)]
enum DataCommand {
    #[command(about = "Load a dataset, fetching it if needed")]
    Load(LoadArgs),
    #[command(about = "List cached entries")]
    List,
    #[command(about = "Show cache state for a dataset without fetching")]
    Info(SpecArgs),
    #[command(about = "Drop a dataset from the cache")]
    Invalidate(InvalidateArgs),
    #[command(about = "Remove the whole cache directory")]
    Clear,
    #[command(about = "List datasets that can be loaded")]
    Datasets,
}

#[derive(Args)]
struct LoadArgs {
    /// `name[:key=value,...]`, e.g. `gene_annotations:build=hg19`.
    specifier: String,

    /// Fetch even when a fresh entry is cached.
    #[arg(long)]
    refresh: bool,

    /// Give up waiting after this many seconds.
    #[arg(long)]
    timeout: Option<f64>,

    /// Include the realized value in JSON output.
    #[arg(long)]
    full: bool,
}

#[derive(Args)]
struct SpecArgs {
    specifier: String,
}

#[derive(Args)]
struct InvalidateArgs {
    specifier: String,

    /// Delete the cached payload and sidecar as well.
    #[arg(long)]
    evict: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<BidaliError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BidaliError) -> u8 {
    match error {
        BidaliError::UnknownDataset(_)
        | BidaliError::InvalidParameters { .. }
        | BidaliError::InvalidSpecifier(_)
        | BidaliError::InvalidDatasetName(_)
        | BidaliError::ConfigRead(_)
        | BidaliError::ConfigParse(_) => 2,
        BidaliError::Fetch { .. } | BidaliError::Http(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if cli.offline {
        config.offline_mode = true;
    }
    let registry = Arc::new(builtin_registry()?);
    let app = App::new(config, registry);

    match cli.command {
        Commands::Data(args) => run_data(args.command, &app, output_mode),
    }
}

fn run_data(command: DataCommand, app: &App, output_mode: OutputMode) -> miette::Result<()> {
    match command {
        DataCommand::Load(args) => run_load(args, app, output_mode),
        DataCommand::List => {
            let result = app.list()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_list(&result),
                OutputMode::Human => HumanOutput::print_list(&result),
            }
            .into_diagnostic()
        }
        DataCommand::Info(args) => {
            let specifier = args.specifier.parse::<DatasetSpecifier>()?;
            let result = app.status(specifier.name.as_str(), &specifier.params)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_status(&result),
                OutputMode::Human => HumanOutput::print_status(&result),
            }
            .into_diagnostic()
        }
        DataCommand::Invalidate(args) => {
            let specifier = args.specifier.parse::<DatasetSpecifier>()?;
            let result = app.invalidate(specifier.name.as_str(), &specifier.params, args.evict)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_invalidate(&result),
                OutputMode::Human => HumanOutput::print_invalidate(&result),
            }
            .into_diagnostic()
        }
        DataCommand::Clear => {
            let result = app.clear()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_clear(&result),
                OutputMode::Human => HumanOutput::print_clear(&result),
            }
            .into_diagnostic()
        }
        DataCommand::Datasets => {
            let result = app.datasets();
            match output_mode {
                OutputMode::Json => JsonOutput::print_datasets(&result),
                OutputMode::Human => HumanOutput::print_datasets(&result),
            }
            .into_diagnostic()
        }
    }
}

fn run_load(args: LoadArgs, app: &App, output_mode: OutputMode) -> miette::Result<()> {
    let specifier = args.specifier.parse::<DatasetSpecifier>()?;
    let deadline = match args.timeout {
        // Too far out to represent means no deadline at all.
        Some(secs) => match Duration::try_from_secs_f64(secs) {
            Ok(timeout) => Instant::now().checked_add(timeout),
            Err(_) if secs.is_finite() && secs > 0.0 => None,
            Err(_) => {
                return Err(miette::Report::msg(format!(
                    "--timeout must be a non-negative number of seconds, got {secs}"
                )));
            }
        },
        None => None,
    };
    let options = LoadOptions {
        deadline,
        force_refresh: args.refresh,
    };

    let loaded = app.load_with(specifier.name.as_str(), &specifier.params, &options)?;
    let report = LoadReport::new(&loaded, args.full);
    match output_mode {
        OutputMode::Json => JsonOutput::print_load(&report),
        OutputMode::Human => HumanOutput::print_load(&report),
    }
    .into_diagnostic()
}
