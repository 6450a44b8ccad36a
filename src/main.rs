//! CLI entry point for the scene density labeler.
//!
//! Labels every scene file of a dataset directory by traffic density (the
//! default when no subcommand is given), and offers read-only inspection of
//! single files.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scene_density_labeler::analyzers::labeler;
use scene_density_labeler::config::{ConfigOverrides, LabelerConfig};
use scene_density_labeler::inspect::{summarize, vehicle_features};
use scene_density_labeler::output::render_json;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "scene_density_labeler")]
#[command(about = "Label traffic scene graph files by vehicle density", long_about = None)]
struct Cli {
    #[command(flatten)]
    label: LabelArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Default)]
struct LabelArgs {
    /// Optional JSON config file with data_directory, output_path and class_count
    #[arg(short, long, global = true, env = "DENSITY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory containing the .pt scene files
    #[arg(short = 'd', long, global = true, env = "DENSITY_DATA_DIR")]
    data_directory: Option<PathBuf>,

    /// CSV file to write labels to (overwritten)
    #[arg(short, long, global = true, env = "DENSITY_OUTPUT_PATH")]
    output: Option<PathBuf>,

    /// Number of density classes (2 or 3)
    #[arg(short = 'k', long, global = true, env = "DENSITY_CLASS_COUNT")]
    class_count: Option<u8>,
}

#[derive(Subcommand)]
enum Commands {
    /// Label every scene file by average vehicles per timestep and write a CSV (default)
    Label,
    /// Print the structure of one or more scene files
    Inspect {
        /// Scene files to inspect
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Print JSON instead of a text report
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print selected vehicle feature columns of one scene file
    Features {
        /// Scene file to read
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Vehicle row to print
        #[arg(short, long, default_value_t = 0)]
        vehicle: usize,

        /// Print JSON instead of a text report
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Label);

    // settings are validated before the log directory is created
    let label_config = match command {
        Commands::Label => Some(resolve_config(cli.label)?),
        _ => None,
    };

    let _file_guard = init_tracing()?;

    match command {
        Commands::Label => {
            if let Some(config) = &label_config {
                labeler::run(config)?;
            }
        }
        Commands::Inspect { files, json } => {
            for path in &files {
                let summary = summarize(path)
                    .with_context(|| format!("failed to inspect {}", path.display()))?;
                if json {
                    println!("{}", render_json(&summary)?);
                } else {
                    println!("{summary}");
                }
            }
            info!(files = files.len(), "Inspection finished");
        }
        Commands::Features {
            file,
            vehicle,
            json,
        } => {
            let features = vehicle_features(&file, vehicle)
                .with_context(|| format!("failed to read features of {}", file.display()))?;
            if json {
                println!("{}", render_json(&features)?);
            } else {
                print!("{features}");
            }
        }
    }

    Ok(())
}

/// Layers defaults, the optional config file and command-line flags.
fn resolve_config(args: LabelArgs) -> Result<LabelerConfig> {
    let cli_overrides = ConfigOverrides {
        data_directory: args.data_directory,
        output_path: args.output,
        class_count: args.class_count,
    };

    Ok(LabelerConfig::from_layers(args.config.as_deref(), cli_overrides)?)
}

/// Logging setup: colored stderr + JSON rolling log file.
fn init_tracing() -> Result<WorkerGuard> {
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/scene_density_labeler.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("scene_density_labeler.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    Ok(file_guard)
}
