use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use edgepred_core::backend::log_target_availability;
use edgepred_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use edgepred_core::labels::{format_top_labels, load_labels, top_k, SUMMARY_TOP_K};
use edgepred_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use edgepred_core::onnx::inspect_onnx;
use edgepred_core::runtime::{log_runtime_lib_status, setup_runtime_libs};
use edgepred_core::{ImageShape, PredictionContext, ResizeStrategy, Resizer};

#[derive(Parser)]
#[command(name = "edgepred", about = "On-device image model inference")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

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

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one prediction and print the top classes as JSON.
    Predict(PredictArgs),
    /// Print a model's inputs, outputs and operator summary as JSON.
    Inspect(InspectArgs),
    /// Resize an image to a raw HWC tensor dump.
    Resize(ResizeArgs),
}

#[derive(Args)]
struct PredictArgs {
    #[arg(help = "Model file, absolute or relative to the models directory")]
    model: PathBuf,
    #[arg(short = 'm', long, help = "Runtime mode code (1-11); defaults to config")]
    mode: Option<i32>,
    #[arg(short = 'i', long, help = "Image file (png or jpeg)")]
    image: Option<PathBuf>,
    #[arg(
        long,
        conflicts_with = "image",
        help = "Raw little-endian f32 HWC tensor file"
    )]
    raw: Option<PathBuf>,
    #[command(flatten)]
    shape: ShapeArgs,
    #[arg(
        long,
        conflicts_with = "normalize",
        help = "Feed integer pixel values to a quantized model"
    )]
    quantize: bool,
    #[arg(long, help = "Divide float pixel values by 255")]
    normalize: bool,
    #[arg(long, help = "Label file, one label per line")]
    labels: Option<PathBuf>,
    #[arg(long, default_value_t = SUMMARY_TOP_K)]
    top: usize,
    #[arg(long, help = "Capture and log a per-operator profile")]
    profile: bool,
    #[arg(long, value_parser = parse_resize_strategy, help = "graph or direct")]
    resize: Option<ResizeStrategy>,
}

/// Source shape of a raw tensor file; zero means the model's own.
#[derive(Args)]
struct ShapeArgs {
    #[arg(long, default_value_t = 0)]
    height: usize,
    #[arg(long, default_value_t = 0)]
    width: usize,
    #[arg(long, default_value_t = 0)]
    channels: usize,
}

#[derive(Args)]
struct InspectArgs {
    model: PathBuf,
}

#[derive(Args)]
struct ResizeArgs {
    image: PathBuf,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[arg(long)]
    width: usize,
    #[arg(long)]
    height: usize,
    #[arg(long, value_enum, default_value_t = DumpFormat::F32)]
    format: DumpFormat,
    #[arg(long, help = "Read the image as single-channel")]
    gray: bool,
    #[arg(long, value_parser = parse_resize_strategy, help = "graph or direct")]
    resize: Option<ResizeStrategy>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DumpFormat {
    F32,
    U8,
    I8,
}

fn parse_resize_strategy(s: &str) -> std::result::Result<ResizeStrategy, String> {
    match s.to_ascii_lowercase().as_str() {
        "graph" | "onnx" => Ok(ResizeStrategy::Graph),
        "direct" | "native" | "rust" => Ok(ResizeStrategy::from_str_lossy(s)),
        other => Err(format!("unknown resize strategy '{other}'")),
    }
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());
    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        eprintln!("Warning: failed to initialize data directory: {e:#}");
    }
    let config = match AppConfig::load_from_path(&config_path(&resolved_data_dir)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Warning: {err:#}; using default config");
            AppConfig::default()
        }
    };

    let lib_status = setup_runtime_libs();
    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        config.logging.retention_files,
    );
    log_runtime_lib_status(&lib_status);
    if cli.verbose > 0 {
        log_target_availability();
    }
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Predict(args) => run_predict(args, &config, &resolved_data_dir, cli.verbose),
        Commands::Inspect(args) => run_inspect(args, &config, &resolved_data_dir),
        Commands::Resize(args) => run_resize(args, &config),
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>, retention: usize) {
    let panic_hook_plan = logging::install_panic_hook(Some(data_dir));
    if let PanicHookInstallPlan::Disabled { reason } = &panic_hook_plan {
        eprintln!("Warning: crash reports unavailable ({reason}).");
    }

    let init_options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        retention_files: retention,
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_env_filter =
        parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_env_filter);

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_env_filter =
                parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(file_env_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
        }
        FileSinkPlan::Disabled {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
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

/// Pixels of `path` as HWC values in 0..=255.
fn load_image_hwc(path: &Path, channels: usize) -> Result<(Vec<u8>, ImageShape)> {
    let img = image::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    let (width, height) = (img.width() as usize, img.height() as usize);
    let (pixels, channels) = match channels {
        1 => (img.to_luma8().into_raw(), 1),
        3 => (img.to_rgb8().into_raw(), 3),
        4 => (img.to_rgba8().into_raw(), 4),
        other => bail!("cannot load an image with {other} channels"),
    };
    Ok((pixels, ImageShape::new(height, width, channels)))
}

fn read_raw_f32(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    decode_f32_le(&bytes).with_context(|| format!("invalid raw tensor file: {}", path.display()))
}

fn decode_f32_le(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        bail!("length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn index_labels(count: usize) -> Vec<String> {
    (0..count).map(|i| i.to_string()).collect()
}

fn run_predict(args: PredictArgs, config: &AppConfig, data_dir: &Path, verbose: u8) -> Result<()> {
    let mut options = config.session_options(data_dir);
    if let Some(mode) = args.mode {
        options.mode = mode;
    }
    if let Some(resize) = args.resize {
        options.resize = resize;
    }
    options.profile |= args.profile;
    options.verbose |= verbose > 0;

    let model = config.resolve_model(data_dir, &args.model);
    let mut ctx = PredictionContext::with_options(&model, &options)
        .with_context(|| format!("failed to load model: {}", model.display()))?;

    let (floats, shape) = match (&args.image, &args.raw) {
        (Some(image), _) => {
            let (pixels, shape) = load_image_hwc(image, ctx.channels())?;
            let scale = if args.normalize { 255.0 } else { 1.0 };
            (pixels.into_iter().map(|p| p as f32 / scale).collect(), shape)
        }
        (None, Some(raw)) => {
            let s = &args.shape;
            (read_raw_f32(raw)?, ImageShape::new(s.height, s.width, s.channels))
        }
        (None, None) => bail!("either --image or --raw is required"),
    };

    let start = Instant::now();
    if args.quantize {
        let quantized: Vec<i32> = floats.iter().map(|&v| v as i32).collect();
        let ImageShape {
            height,
            width,
            channels,
        } = shape;
        ctx.predict_with_shape(&quantized, &[], true, height, width, channels)?;
    } else {
        let ImageShape {
            height,
            width,
            channels,
        } = shape;
        ctx.predict_with_shape(&[], &floats, false, height, width, channels)?;
    }
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let predictions = ctx.predictions().context("prediction produced no output")?;
    let labels = match &args.labels {
        Some(path) => load_labels(path)
            .with_context(|| format!("failed to read labels: {}", path.display()))?,
        None => index_labels(predictions.len()),
    };
    let top = top_k(predictions, &labels, args.top)?;
    let summary = format_top_labels(predictions, &labels)?;

    let report = serde_json::json!({
        "model": model.display().to_string(),
        "selection": ctx.session().selection(),
        "input": {
            "height": ctx.height(),
            "width": ctx.width(),
            "channels": ctx.channels(),
        },
        "output_length": ctx.output_length(),
        "elapsed_ms": elapsed_ms,
        "top": top,
        "summary": summary,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_inspect(args: InspectArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let model = config.resolve_model(data_dir, &args.model);
    let inspection = inspect_onnx(&model)?;
    println!("{}", serde_json::to_string_pretty(&inspection)?);
    Ok(())
}

fn run_resize(args: ResizeArgs, config: &AppConfig) -> Result<()> {
    let channels = if args.gray { 1 } else { 3 };
    let (pixels, from) = load_image_hwc(&args.image, channels)?;
    let to = ImageShape::new(args.height, args.width, channels);

    let mut resizer = Resizer::new(args.resize.unwrap_or(config.inference.resize));
    let bytes = resize_dump(&mut resizer, &pixels, from, to, args.format)?;
    fs::write(&args.output, &bytes)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(
        output = %args.output.display(),
        from = ?from,
        to = ?to,
        format = ?args.format,
        strategy = %resizer.strategy(),
        "Wrote resized tensor"
    );
    Ok(())
}

fn resize_dump(
    resizer: &mut Resizer,
    pixels: &[u8],
    from: ImageShape,
    to: ImageShape,
    format: DumpFormat,
) -> Result<Vec<u8>> {
    let len = to
        .checked_len()
        .with_context(|| format!("target shape {to:?} is too large"))?;
    Ok(match format {
        DumpFormat::F32 => {
            let src: Vec<f32> = pixels.iter().copied().map(f32::from).collect();
            let mut dst = vec![0f32; len];
            resizer.resize_float(&src, from, &mut dst, to)?;
            dst.iter().flat_map(|v| v.to_le_bytes()).collect()
        }
        DumpFormat::U8 => {
            let src: Vec<i32> = pixels.iter().copied().map(i32::from).collect();
            let mut dst = vec![0u8; len];
            resizer.resize_to_u8(&src, from, &mut dst, to)?;
            dst
        }
        DumpFormat::I8 => {
            let src: Vec<i32> = pixels.iter().copied().map(i32::from).collect();
            let mut dst = vec![0i8; len];
            resizer.resize_to_i8(&src, from, &mut dst, to)?;
            dst.into_iter().map(|v| v as u8).collect()
        }
    })
}
