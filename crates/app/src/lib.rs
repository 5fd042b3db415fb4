use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use satsr_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use satsr_core::enhancer::Enhancer;
use satsr_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use satsr_core::pipeline::PixelBuffer;
use satsr_core::server::{app_router, AppState};
use satsr_core::weights::WeightSet;

#[derive(Parser)]
#[command(
    name = "satsr",
    about = "4x satellite image super-resolution",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Enhance(EnhanceArgs),
}

#[derive(Args)]
struct EnhanceArgs {
    #[arg(help = "Path to the input image")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output path (default: <input>_4x.png)")]
    output: Option<PathBuf>,
    #[arg(long, help = "Override the weights file from config")]
    weights: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(Some(resolved_data_dir.as_path()));

    match cli.command {
        Some(Commands::Enhance(args)) => {
            run_enhance(args.input, args.output, args.weights, resolved_data_dir).await
        }
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let effective_filter = init_plan.filters.effective_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&effective_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&effective_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&effective_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            eprintln!(
                "Warning: persistent file logging unavailable (path: {attempted_log_dir}; reason: {reason}). Continuing with console-only logging."
            );
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(pid, "Runtime startup metadata");
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Loads the parameter file and builds the enhancer. Fails fast: a
/// missing or malformed weights file aborts startup instead of serving
/// an untrained network.
fn build_enhancer(weights_path: &Path) -> Result<Enhancer> {
    if !weights_path.exists() {
        bail!(
            "weights file does not exist: {} (set paths.weights_file in config.toml or pass --weights)",
            weights_path.display()
        );
    }

    let weights = WeightSet::load(weights_path)?;
    Enhancer::from_weights(&weights)
        .with_context(|| format!("invalid weights file: {}", weights_path.display()))
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let weights_path = resolve_relative_to(&data_dir, &config.paths.weights_file);
    let enhancer = build_enhancer(&weights_path)?;

    let state = AppState::new(enhancer, config);
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting satsr server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_enhance(
    input: PathBuf,
    output: Option<PathBuf>,
    weights_override: Option<PathBuf>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);
    let weights_path = weights_override
        .unwrap_or_else(|| resolve_relative_to(&data_dir, &config.paths.weights_file));
    let enhancer = build_enhancer(&weights_path)?;

    let decoded = image::open(&input)
        .with_context(|| format!("failed to open input image: {}", input.display()))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    let buffer = PixelBuffer::new(decoded.into_raw(), width, height)?;

    info!(width, height, input = %input.display(), "Enhancing image");
    let started = Instant::now();
    let enhanced = enhancer.enhance(&buffer)?;
    info!(
        output_width = enhanced.width,
        output_height = enhanced.height,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Enhancement finished"
    );

    let output_path = output.unwrap_or_else(|| default_output_path(&input));
    let result = image::RgbImage::from_raw(enhanced.width, enhanced.height, enhanced.data)
        .context("enhanced image has inconsistent dimensions")?;
    result
        .save(&output_path)
        .with_context(|| format!("failed to write output image: {}", output_path.display()))?;

    info!(output = %output_path.display(), "Wrote enhanced image");
    Ok(())
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("enhanced");
    input.with_file_name(format!("{stem}_4x.png"))
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        include_noise_filter_when_implicit: true,
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::select_log_filter(&options)
}

#[cfg(test)]
mod log_filter_tests {
    use super::*;

    const NOISE: &str = "hyper=warn,tower_http=warn";

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        let selected = select_log_filter(NOISE, None, 0, None);
        assert_eq!(selected, format!("{NOISE},info"));
    }

    #[test]
    fn uses_noise_with_rust_log_when_no_cli_overrides() {
        let selected = select_log_filter(NOISE, Some("debug"), 0, None);
        assert_eq!(selected, format!("{NOISE},debug"));
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        let selected = select_log_filter(NOISE, Some("info"), 1, None);
        assert_eq!(selected, "debug");
    }

    #[test]
    fn double_verbose_enables_trace() {
        let selected = select_log_filter(NOISE, Some("info"), 2, None);
        assert_eq!(selected, "trace");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        let selected = select_log_filter(NOISE, Some("warn"), 2, Some("satsr_core=trace"));
        assert_eq!(selected, "satsr_core=trace");
    }
}
