use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use magscreen::config::ConfigLoader;
use magscreen::error::ScreenError;
use magscreen::icsd::IcsdHttpClient;
use magscreen::mp::MpHttpClient;
use magscreen::nemad::NemadHttpClient;
use magscreen::output::write_records_csv;
use magscreen::pipeline::{Harvester, ProgressEvent, ProgressSink, SourceStatus};
use magscreen::seed::{read_seed_table, read_table_column, write_id_list};

#[derive(Parser)]
#[command(name = "magscreen")]
#[command(about = "Cross-database screening of candidate magnetic materials")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Harvest, reconcile, and filter candidate materials")]
    Run(RunArgs),
    #[command(about = "Extract the structure-database id list from a data table")]
    Ids(IdsArgs),
    #[command(about = "Resolve and print the effective configuration")]
    CheckConfig(CheckConfigArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    /// Seed table of known material ids; skips element-search discovery.
    #[arg(long)]
    seed: Option<Utf8PathBuf>,

    #[arg(long)]
    output: Option<Utf8PathBuf>,

    #[arg(long)]
    ids_out: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct IdsArgs {
    table: Utf8PathBuf,

    #[arg(long)]
    out: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct CheckConfigArgs {
    #[arg(long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<ScreenError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ScreenError) -> u8 {
    match error {
        ScreenError::MissingConfig
        | ScreenError::ConfigRead(_)
        | ScreenError::ConfigParse(_)
        | ScreenError::SeedRead(_)
        | ScreenError::SeedColumn(_) => 2,
        ScreenError::MpHttp(_)
        | ScreenError::MpStatus { .. }
        | ScreenError::NemadHttp(_)
        | ScreenError::NemadStatus { .. }
        | ScreenError::IcsdHttp(_)
        | ScreenError::IcsdStatus { .. }
        | ScreenError::RetriesExhausted { .. } => 3,
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
    match cli.command {
        Commands::Run(args) => run_pipeline(args, cli.json),
        Commands::Ids(args) => run_ids(args),
        Commands::CheckConfig(args) => run_check_config(args),
    }
}

struct StderrSink;

impl ProgressSink for StderrSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("[{:>6.1}s] {}", elapsed.as_secs_f64(), event.message),
            None => eprintln!("         {}", event.message),
        }
    }
}

fn run_pipeline(args: RunArgs, json: bool) -> miette::Result<()> {
    let mut config = ConfigLoader::resolve(args.config.as_deref()).into_diagnostic()?;
    if let Some(output) = args.output {
        config.output_csv = output;
    }
    if let Some(ids_out) = args.ids_out {
        config.output_ids = ids_out;
    }

    let seed = args
        .seed
        .as_deref()
        .map(read_seed_table)
        .transpose()
        .into_diagnostic()?;

    let mp = MpHttpClient::new().into_diagnostic()?;
    let nemad = NemadHttpClient::new().into_diagnostic()?;
    let icsd = IcsdHttpClient::new(config.icsd_gateway_url.clone()).into_diagnostic()?;

    let output_csv = config.output_csv.clone();
    let output_ids = config.output_ids.clone();
    let harvester = Harvester::new(mp, nemad, icsd, config);
    let report = harvester
        .run(seed.as_deref(), &StderrSink)
        .into_diagnostic()?;

    write_records_csv(&output_csv, &report.records).into_diagnostic()?;
    write_id_list(&output_ids, report.icsd_ids()).into_diagnostic()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).into_diagnostic()?
        );
    } else {
        print_run_summary(&report, &output_csv, &output_ids);
    }

    if report
        .statuses
        .values()
        .all(|status| *status == SourceStatus::Failed)
    {
        return Err(miette::Report::msg("every source failed"));
    }
    Ok(())
}

fn print_run_summary(
    report: &magscreen::pipeline::RunReport,
    output_csv: &camino::Utf8Path,
    output_ids: &camino::Utf8Path,
) {
    println!("magscreen summary");
    println!("  merged records: {}", report.records.len());
    println!(
        "  primary kept {} (filtered out {})",
        report.primary_records, report.filtered_out
    );
    println!(
        "  secondary candidates rejected: {}",
        report.rejected_candidates
    );
    println!("  malformed records skipped: {}", report.skipped_records);
    for (source, status) in &report.statuses {
        println!("  source {source}: {status:?}");
    }
    println!("  data table: {output_csv}");
    println!("  id list:    {output_ids}");
}

fn run_ids(args: IdsArgs) -> miette::Result<()> {
    let ids = read_table_column(&args.table, &["icsd", "ID", "id"]).into_diagnostic()?;
    let out = args
        .out
        .unwrap_or_else(|| Utf8PathBuf::from("ids_to_download.txt"));
    let count = ids.len();
    write_id_list(&out, ids).into_diagnostic()?;
    println!("wrote {count} ids to {out}");
    Ok(())
}

fn run_check_config(args: CheckConfigArgs) -> miette::Result<()> {
    let resolved = ConfigLoader::resolve(args.config.as_deref()).into_diagnostic()?;
    println!("sources: {:?}", resolved.sources);
    println!(
        "allow: {}",
        resolved
            .allow_elements
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",")
    );
    println!(
        "ban: {}",
        resolved
            .ban_elements
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",")
    );
    println!("batch_size: {}", resolved.batch_size);
    println!("ban_chunk_chars: {}", resolved.ban_chunk_chars);
    println!(
        "retries: {} (base delay {:?})",
        resolved.retry.max_attempts, resolved.retry.base_delay
    );
    println!("ordering: {:?}", resolved.ordering);
    for threshold in &resolved.thresholds {
        println!("threshold: {threshold:?}");
    }
    println!("output_csv: {}", resolved.output_csv);
    println!("output_ids: {}", resolved.output_ids);
    Ok(())
}
