use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use populate_scamplers::api::TrackingHttpClient;
use populate_scamplers::app::{self, App, LogSink, ProgressSink, RunOptions};
use populate_scamplers::config::{ConfigLoader, DEFAULT_ERROR_DIR, Overrides};
use populate_scamplers::domain::EntityKind;
use populate_scamplers::error::PopulateError;
use populate_scamplers::error_report::{self, LabelOrder};
use populate_scamplers::output::{JsonOutput, OutputMode, TextOutput, TextProgress};
use populate_scamplers::submit::SubmitOptions;

#[derive(Parser)]
#[command(name = "populate-scamplers")]
#[command(about = "Migrate sample-tracking spreadsheets into the scamplers API")]
#[command(version, author)]
struct Cli {
    /// Settings file (defaults to ~/.config/populate-scamplers/settings.toml).
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    /// Print reports as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create every missing record from the CSV exports")]
    Run(RunArgs),
    #[command(about = "Copy the slim outputs of processed datasets")]
    CopyDatasets(CopyArgs),
    #[command(about = "List the error artifacts recorded for one record type")]
    Errors(ErrorsArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Directory holding the CSV exports.
    csv_dir: PathBuf,

    /// Processed dataset directories to register.
    dataset_dirs: Vec<Utf8PathBuf>,

    #[arg(long, env = "POPULATE_SCAMPLERS_API_BASE_URL")]
    api_base_url: Option<String>,

    #[arg(long, env = "POPULATE_SCAMPLERS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long)]
    accept_invalid_certificates: bool,

    #[arg(long)]
    cache_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    error_dir: Option<Utf8PathBuf>,

    /// Record types to leave alone. May be repeated.
    #[arg(long, value_enum)]
    skip: Vec<EntityKind>,

    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Build requests without sending them.
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    print_requests: bool,

    #[arg(long)]
    save_requests: Option<Utf8PathBuf>,

    #[arg(long)]
    print_responses: bool,

    #[arg(long)]
    save_responses: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct CopyArgs {
    destination: Utf8PathBuf,

    #[arg(required = true)]
    dataset_dirs: Vec<Utf8PathBuf>,
}

#[derive(Args)]
struct ErrorsArgs {
    #[arg(value_enum)]
    kind: EntityKind,

    /// Only show labels matching this regular expression.
    #[arg(long)]
    pattern: Option<String>,

    #[arg(long)]
    error_dir: Option<Utf8PathBuf>,

    /// Labels are not experiment IDs such as `25E12-SU3`.
    #[arg(long)]
    no_experiment: bool,

    /// Where the number starts in labels read with `--no-experiment`.
    #[arg(long, default_value_t = 0, requires = "no_experiment")]
    numeric_from: usize,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<PopulateError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &PopulateError) -> u8 {
    match error {
        PopulateError::InvalidKind(_)
        | PopulateError::MissingConfig(_)
        | PopulateError::ConfigRead(_)
        | PopulateError::ConfigParse(_)
        | PopulateError::MissingSetting(_)
        | PopulateError::MissingCsv(_)
        | PopulateError::InvalidPattern(_)
        | PopulateError::InvalidDataset { .. } => 2,
        PopulateError::ApiHttp(_)
        | PopulateError::ApiStatus { .. }
        | PopulateError::ApiDecode(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    match cli.command {
        Commands::Run(args) => run_migration(cli.config, args, output_mode),
        Commands::CopyDatasets(args) => copy_datasets(args, output_mode),
        Commands::Errors(args) => list_errors(cli.config, args, output_mode),
    }
}

fn run_migration(
    config: Option<Utf8PathBuf>,
    args: RunArgs,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let settings = ConfigLoader::load(config.as_deref())?;
    let resolved = ConfigLoader::resolve(
        settings,
        Overrides {
            csv_dir: args.csv_dir,
            dataset_dirs: args.dataset_dirs,
            api_base_url: args.api_base_url,
            api_key: args.api_key,
            accept_invalid_certificates: args.accept_invalid_certificates,
            cache_dir: args.cache_dir,
            error_dir: args.error_dir,
            skip: args.skip,
            max_concurrency: args.max_concurrency,
        },
    )?;

    let client = TrackingHttpClient::new(
        &resolved.api_base_url,
        &resolved.api_key,
        resolved.accept_invalid_certificates,
    )?;
    let options = RunOptions {
        skip: resolved.skip.clone(),
        submit: SubmitOptions {
            dry_run: args.dry_run,
            print_requests: args.print_requests,
            save_requests: args.save_requests,
            print_responses: args.print_responses,
            save_responses: args.save_responses,
            error_dir: resolved.error_dir.clone(),
            max_concurrency: resolved.max_concurrency,
        },
    };
    tracing::info!(
        api = %resolved.api_base_url,
        cache = %resolved.cache_dir,
        dry_run = options.submit.dry_run,
        "starting migration"
    );

    let cache = resolved.cache();
    let app = App::new(client, cache, resolved.sources, resolved.tables);
    let report = app.run(&options, progress_sink(output_mode));
    match output_mode {
        OutputMode::Json => JsonOutput::print_run(&report).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_run(&report).into_diagnostic()?,
    }

    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn copy_datasets(args: CopyArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let report = app::copy_datasets(
        &args.destination,
        &args.dataset_dirs,
        progress_sink(output_mode),
    );
    match output_mode {
        OutputMode::Json => JsonOutput::print_copy(&report).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_copy(&report).into_diagnostic()?,
    }
    if report.failures() == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn list_errors(
    config: Option<Utf8PathBuf>,
    args: ErrorsArgs,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let error_dir = match args.error_dir {
        Some(dir) => dir,
        None => ConfigLoader::load(config.as_deref())?
            .error_dir
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_ERROR_DIR)),
    };
    let pattern = args
        .pattern
        .as_deref()
        .map(error_report::compile_pattern)
        .transpose()?;
    let order = if args.no_experiment {
        LabelOrder::Numeric {
            from: args.numeric_from,
        }
    } else {
        LabelOrder::ExperimentId
    };

    let entries = error_report::find_errors(&error_dir, args.kind, pattern.as_ref(), order)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_errors(&entries).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_errors(&entries).into_diagnostic()?,
    }
    Ok(ExitCode::SUCCESS)
}

fn progress_sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &LogSink,
        OutputMode::Text => &TextProgress,
    }
}
