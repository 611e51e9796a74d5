use anyhow::Context;
use app_bootstrap::app::agent::{analyze, sample_input, write_metrics_csv};
use app_bootstrap::utils::logger;
use clap::{Parser, ValueEnum};
use std::io::Read;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Parser)]
#[command(name = "metrics-agent")]
#[command(about = "Daily profit and acquisition cost report")]
struct Args {
    /// JSON file with `today` and `yesterday` figures; reads stdin when omitted
    #[arg(short, long, conflicts_with = "sample")]
    input: Option<PathBuf>,

    /// Use the built-in sample figures
    #[arg(long)]
    sample: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn read_input(args: &Args) -> anyhow::Result<serde_json::Value> {
    if args.sample {
        return Ok(sample_input());
    }
    let content = match &args.input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("cannot read stdin")?;
            buffer
        }
    };
    serde_json::from_str(&content).context("input is not valid JSON")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);

    let input = read_input(&args)?;
    let state = analyze(input)?;
    tracing::debug!("Agent state: {:?}", state);

    match args.format {
        OutputFormat::Json => {
            let report = state.report.context("workflow produced no report")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Csv => {
            let metrics = state.metrics.context("workflow produced no metrics")?;
            write_metrics_csv(&metrics, std::io::stdout().lock())?;
        }
    }
    Ok(())
}
