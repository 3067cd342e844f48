use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, command};
use keiro_cli::error::{CliError, CliResult};
use keiro_cli::input::{read_documents, read_json};
use keiro_core::Runtime;
use keiro_core::config::RuntimeConfig;
use keiro_core::eval::Cursor;
use keiro_core::schedule::CronSchedule;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to runtime config file
    #[arg(short, long, default_value = "keiro.json", env = "KEIRO_CONFIG", global = true)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate an expression
    Eval {
        /// Expression as JSON, `@file` or `-` for stdin
        expression: String,

        /// Document the expression runs against
        #[arg(short, long)]
        root: Option<String>,
    },

    /// Run a pipeline over input documents
    Run {
        /// Pipeline stages as a JSON array, `@file` or `-` for stdin
        pipeline: String,

        /// Input documents as a JSON array
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Preview the next firing times of a cron expression
    Cron {
        expression: String,

        #[arg(short = 'n', long, default_value = "5")]
        count: usize,

        /// Start after this RFC 3339 timestamp instead of now
        #[arg(long)]
        after: Option<String>,
    },

    /// Print the effective runtime configuration
    Config,
}

fn load_config(path: &PathBuf) -> CliResult<RuntimeConfig> {
    if path.exists() {
        debug!("loading config from {:?}", path);
        Ok(RuntimeConfig::from_file(path)?)
    } else {
        Ok(RuntimeConfig::default())
    }
}

fn print(cli: &Cli, value: &serde_json::Value) -> CliResult<()> {
    let text = if cli.pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

async fn run(cli: &Cli) -> CliResult<()> {
    let config = load_config(&cli.config)?;
    match &cli.command {
        Commands::Eval { expression, root } => {
            let runtime = Runtime::new(config);
            let expression = read_json(expression)?;
            let root = root
                .as_deref()
                .map(read_json)
                .transpose()?
                .unwrap_or(serde_json::Value::Null);
            let value = runtime.evaluate(&expression, root).await?;
            print(cli, &value.to_json())
        }
        Commands::Run { pipeline, input } => {
            let runtime = Runtime::new(config);
            let pipeline = read_json(pipeline)?;
            let documents = read_documents(input.as_deref())?;
            let mut cursor = runtime.run(&pipeline, documents)?;
            let values = cursor.to_array().await?;
            print(
                cli,
                &serde_json::Value::Array(
                    values.into_iter().map(|v| v.normalized().to_json()).collect(),
                ),
            )
        }
        Commands::Cron {
            expression,
            count,
            after,
        } => {
            let schedule = CronSchedule::parse(expression)?;
            let after = match after {
                Some(ts) => DateTime::parse_from_rfc3339(ts)?.with_timezone(&Utc),
                None => Utc::now(),
            };
            let times = schedule.upcoming(after, *count);
            if times.is_empty() {
                return Err(CliError::Usage(format!(
                    "{} never fires after {}",
                    schedule, after
                )));
            }
            let times = times
                .into_iter()
                .map(|t| serde_json::Value::String(t.to_rfc3339()))
                .collect();
            print(cli, &serde_json::Value::Array(times))
        }
        Commands::Config => print(cli, &serde_json::to_value(&config)?),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
