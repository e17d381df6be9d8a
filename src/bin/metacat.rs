use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use metacat_manager::app::{App, BuildOptions, CatalogInfo};
use metacat_manager::domain::CatalogVersion;
use metacat_manager::error::CatalogError;
use metacat_manager::output::{JsonOutput, LogSink};
use metacat_manager::parser::SidecarParser;
use metacat_manager::pool::WorkerPool;
use metacat_manager::store::{DEFAULT_CATALOG_FILE, Store};

#[derive(Parser)]
#[command(name = "metacat")]
#[command(about = "Build, version and validate a meta-catalog of climate model output")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build a catalog version from configuration documents")]
    Build(BuildArgs),
    #[command(about = "Publish a built catalog version as the live default")]
    Concretize(ConcretizeArgs),
    #[command(about = "Check an experiment metadata document against the schema")]
    Validate(ValidateArgs),
    #[command(about = "Print an empty experiment metadata document")]
    Template,
}

#[derive(Args)]
struct StoreArgs {
    /// Directory holding one sub-directory per catalog version.
    #[arg(long, default_value = ".")]
    build_base_path: Utf8PathBuf,

    /// Directory holding the live catalog descriptor; defaults to the build base.
    #[arg(long)]
    catalog_base_path: Option<Utf8PathBuf>,

    #[arg(long, default_value = DEFAULT_CATALOG_FILE)]
    catalog_file: String,

    #[arg(long)]
    catalog_name: Option<String>,

    #[arg(long)]
    catalog_description: Option<String>,
}

#[derive(Args)]
struct BuildArgs {
    #[arg(required = true)]
    config_yaml: Vec<Utf8PathBuf>,

    #[command(flatten)]
    store: StoreArgs,

    /// Catalog version, `vYYYY-MM-DD`; defaults to today.
    #[arg(long)]
    version: Option<String>,

    /// Rebuild a version that already exists.
    #[arg(long)]
    overwrite: bool,

    /// Build without publishing to the live descriptor.
    #[arg(long)]
    no_concretize: bool,

    /// Parser threads; 0 uses every core.
    #[arg(long, default_value_t = 0)]
    workers: usize,
}

#[derive(Args)]
struct ConcretizeArgs {
    version: String,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args)]
struct ValidateArgs {
    metadata_yaml: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CatalogError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CatalogError) -> u8 {
    if error.is_validation() { 2 } else { 1 }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Concretize(args) => run_concretize(args),
        Commands::Validate(args) => {
            let app = app_for(None, 0)?;
            let report = app.validate(&args.metadata_yaml)?;
            JsonOutput::print_validate(&report).into_diagnostic()
        }
        Commands::Template => {
            let app = app_for(None, 0)?;
            JsonOutput::print_text(&app.template()?).into_diagnostic()
        }
    }
}

fn run_build(args: BuildArgs) -> miette::Result<()> {
    let app = app_for(Some(&args.store), args.workers)?;
    let options = BuildOptions {
        version: args.version,
        overwrite: args.overwrite,
        no_concretize: args.no_concretize,
    };
    let report = app.build(&args.config_yaml, &options, &LogSink)?;
    JsonOutput::print_build(&report).into_diagnostic()
}

fn run_concretize(args: ConcretizeArgs) -> miette::Result<()> {
    let app = app_for(Some(&args.store), 0)?;
    let version: CatalogVersion = args.version.parse()?;
    let report = app.concretize(&version)?;
    JsonOutput::print_concretize(&report).into_diagnostic()
}

fn app_for(store: Option<&StoreArgs>, workers: usize) -> Result<App<SidecarParser>, CatalogError> {
    let (store, info) = match store {
        Some(args) => {
            let catalog_base = args
                .catalog_base_path
                .clone()
                .unwrap_or_else(|| args.build_base_path.clone());
            let mut info = CatalogInfo::default();
            if let Some(name) = &args.catalog_name {
                info.name = name.clone();
            }
            if let Some(description) = &args.catalog_description {
                info.description = description.clone();
            }
            (
                Store::new(args.build_base_path.clone(), catalog_base)
                    .with_catalog_file(args.catalog_file.clone()),
                info,
            )
        }
        None => (
            Store::new(Utf8PathBuf::from("."), Utf8PathBuf::from(".")),
            CatalogInfo::default(),
        ),
    };
    Ok(App::new(store, SidecarParser::new())?
        .with_pool(WorkerPool::with_workers(workers))
        .with_info(info))
}
