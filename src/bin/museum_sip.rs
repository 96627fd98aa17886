use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use museum_sip::app::{Controller, ControllerSettings, CreateOptions, StageReport};
use museum_sip::builder::SiptoolsBuilder;
use museum_sip::catalogue::MuseumPlusClient;
use museum_sip::config::ConfigLoader;
use museum_sip::domain::{ObjectId, PackageId, PackageKey, ServiceOutcome, parse_timestamp};
use museum_sip::error::{PreservationOutcome, SipError};
use museum_sip::output::JsonOutput;
use museum_sip::store::Store;
use museum_sip::transfer::ConfiguredChannel;

#[derive(Parser)]
#[command(name = "museum-sip")]
#[command(about = "Download, package, submit and confirm museum objects for digital preservation")]
#[command(version, author)]
struct Cli {
    /// Path to museum-sip.json
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download an object's metadata and attachments")]
    Download(ObjectArgs),
    #[command(about = "Create a submission package from the downloaded object")]
    Create(CreateArgs),
    #[command(about = "Submit a created package to the preservation service")]
    Submit(PackageArgs),
    #[command(about = "Confirm whether the service accepted or rejected a package")]
    Confirm(ConfirmArgs),
    #[command(about = "Show the recorded state of a package")]
    Status(PackageArgs),
}

#[derive(Args)]
struct ObjectArgs {
    object_id: String,
}

#[derive(Args)]
struct PackageArgs {
    object_id: String,

    /// Separate package id, allowing several packages of one object
    #[arg(long)]
    package_id: Option<String>,
}

#[derive(Args)]
struct CreateArgs {
    #[command(flatten)]
    package: PackageArgs,

    /// Creation date of the package (defaults to now)
    #[arg(long)]
    create_date: Option<String>,

    /// Modification date, required with --update
    #[arg(long)]
    modify_date: Option<String>,

    /// Create an update package for an already preserved object
    #[arg(long)]
    update: bool,
}

#[derive(Args)]
struct ConfirmArgs {
    #[command(flatten)]
    package: PackageArgs,

    /// Outcome the caller expects the service to have reported
    #[arg(long, value_enum)]
    status: ServiceOutcome,

    /// Directory for archived reports and logs
    #[arg(long)]
    archive_dir: Option<Utf8PathBuf>,
}

impl PackageArgs {
    fn key(&self) -> Result<PackageKey, SipError> {
        let object_id: ObjectId = self.object_id.parse()?;
        let package_id = self
            .package_id
            .as_deref()
            .map(str::parse::<PackageId>)
            .transpose()?;
        Ok(PackageKey::new(object_id, package_id))
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            ExitCode::from(1)
        }
    }
}

/// 0 for success and failures worth retrying, 2 for classified
/// preservation errors, 1 for every other terminal failure.
fn map_exit_code(report: &StageReport) -> u8 {
    match &report.outcome {
        PreservationOutcome::Success | PreservationOutcome::RetryableFailure { .. } => 0,
        PreservationOutcome::TerminalFailure { .. } if report.preservation_error.is_some() => 2,
        PreservationOutcome::TerminalFailure { .. } => 1,
    }
}

fn run() -> miette::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match execute(cli) {
        Ok(report) => {
            JsonOutput::print_report(&report).into_diagnostic()?;
            Ok(map_exit_code(&report))
        }
        Err(err) => {
            JsonOutput::print_failure(&err).into_diagnostic()?;
            let code = if err.is_retryable() { 0 } else { 1 };
            eprintln!("{:?}", miette::Report::new(err));
            Ok(code)
        }
    }
}

fn execute(cli: Cli) -> Result<StageReport, SipError> {
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let catalogue = MuseumPlusClient::new(&config.catalogue)?;
    let builder = SiptoolsBuilder::new(config.packaging.tool_dir.clone());
    let channel = ConfiguredChannel::from_settings(&config.transfer);
    let controller = Controller::new(
        Store::new(&config.paths),
        catalogue,
        builder,
        channel,
        ControllerSettings::from(&config),
    );

    let report = match cli.command {
        Commands::Download(args) => {
            let object_id: ObjectId = args.object_id.parse()?;
            controller.download(&object_id, &JsonOutput)
        }
        Commands::Create(args) => {
            let key = args.package.key()?;
            let create_date = match args.create_date.as_deref() {
                Some(value) => parse_timestamp(value)?,
                None => Utc::now(),
            };
            let modify_date = args
                .modify_date
                .as_deref()
                .map(parse_timestamp)
                .transpose()?;
            let options = CreateOptions {
                create_date,
                modify_date,
                update: args.update,
            };
            controller.create(&key, &options, &JsonOutput)
        }
        Commands::Submit(args) => controller.submit(&args.key()?, &JsonOutput),
        Commands::Confirm(args) => controller.confirm(
            &args.package.key()?,
            args.status,
            args.archive_dir.as_deref(),
            &JsonOutput,
        ),
        Commands::Status(args) => controller.status(&args.key()?),
    };
    Ok(report)
}
