use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use env_logger::Env;
use log::{error, info, Level};
use std::io::Write;
use std::path::PathBuf;

use cytoseg::config::{
    parse_probability, CountOptions, Magnification, SizePolicy, DEFAULT_OVERLAY_PATH,
};
use cytoseg::detection::DetectionTable;
use cytoseg::engine::InferenceEngine;
use cytoseg::model::DenseEngine;
use cytoseg::overlay::ColorMap;
use cytoseg::segmenter::Segmenter;
use cytoseg::tiling::TiledEngine;

#[derive(clap::Subcommand)]
enum Commands {
    /// Count cells or spheroids in a microscopy image
    Count(CountCommand),

    /// Show version information
    Version,
}

#[derive(Parser, Clone)]
struct CountCommand {
    /// Path to the input image
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Path to the ONNX segmentation model
    #[arg(long)]
    model: PathBuf,

    /// Objective magnification of the input (x10 uses sliced inference)
    #[arg(long, default_value = "x20")]
    magnification: Magnification,

    /// Confidence cutoff (0.0-1.0); defaults to 0.05 for x20, 0.01 for x10
    #[arg(long, value_parser = parse_probability)]
    min_score: Option<f32>,

    /// Smallest accepted box extent in pixels
    #[arg(long, default_value_t = 0.0)]
    min_size: f32,

    /// Largest accepted box extent in pixels
    #[arg(long)]
    max_size: Option<f32>,

    /// Palette for the overlay (tab10, tab20, viridis, turbo, grayscale)
    #[arg(long, default_value = "tab20")]
    colormap: ColorMap,

    /// Overlay blend opacity (0.0-1.0)
    #[arg(long, default_value_t = 0.75, value_parser = parse_probability)]
    alpha: f32,

    /// Where to write the overlay image
    #[arg(long, default_value = DEFAULT_OVERLAY_PATH)]
    overlay: PathBuf,

    /// Skip overlay rendering
    #[arg(long)]
    no_overlay: bool,

    /// Keep binary masks in the detection table
    #[arg(long)]
    store_bin_mask: bool,

    /// Print the filtered detection rows as JSON
    #[arg(long)]
    json: bool,

    /// Device to use for inference (auto, cpu, coreml)
    #[arg(long, default_value = "auto")]
    device: String,
}

#[derive(Parser)]
#[command(name = "cytoseg")]
#[command(about = "Cell and spheroid counting toolkit")]
struct Cli {
    /// Verbosity level (-q/--quiet, -v/-vv/-vvv for info/debug/trace)
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,

    #[command(subcommand)]
    command: Commands,
}

fn get_log_level_from_verbosity(
    verbosity: &clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    let adjusted_level = match verbosity.log_level_filter() {
        log::LevelFilter::Off => log::LevelFilter::Off,
        log::LevelFilter::Error => log::LevelFilter::Warn,
        log::LevelFilter::Warn => log::LevelFilter::Info,
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug => log::LevelFilter::Trace,
        log::LevelFilter::Trace => log::LevelFilter::Trace,
    };

    if verbosity.is_silent() {
        log::LevelFilter::Error
    } else {
        adjusted_level
    }
}

fn run_count<E: InferenceEngine>(mut segmenter: Segmenter<E>, cmd: &CountCommand) -> anyhow::Result<()> {
    let options = CountOptions {
        min_score: cmd.min_score,
        store_bin_mask: cmd.store_bin_mask,
        render: !cmd.no_overlay,
        overlay_path: cmd.overlay.clone(),
        alpha: cmd.alpha,
    };

    let result = segmenter.count(&cmd.image, &options)?;

    match result {
        Some(table) => {
            report(&table, cmd)?;
        }
        None => {
            info!("No detections matched the confidence and size bounds");
            println!("0");
        }
    }

    Ok(())
}

fn report(table: &DetectionTable, cmd: &CountCommand) -> anyhow::Result<()> {
    info!(
        "Counted {} object(s) in {}x{} image",
        table.len(),
        table.image_width,
        table.image_height
    );

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(table)?);
    } else {
        println!("{}", table.len());
    }

    if !cmd.no_overlay {
        info!("Overlay written to {}", cmd.overlay.display());
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // If user didn't pass -v/-q and RUST_LOG is set, honor the env var.
    let use_env = !cli.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(get_log_level_from_verbosity(&cli.verbosity));
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => "ERROR".red().bold().to_string(),
                Level::Warn => "WARN".yellow().to_string(),
                Level::Info => "INFO".green().to_string(),
                Level::Debug => "DEBUG".blue().to_string(),
                Level::Trace => "TRACE".magenta().to_string(),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();

    match &cli.command {
        Commands::Count(cmd) => {
            info!(
                "Counting {} | magnification: {} | device: {}",
                cmd.image.display(),
                cmd.magnification,
                cmd.device
            );

            let max_size = cmd.max_size.unwrap_or(f32::INFINITY);
            let policy =
                SizePolicy::new(cmd.min_size, max_size).with_color_map(cmd.colormap);

            let outcome = match cmd.magnification {
                Magnification::X20 => DenseEngine::from_path(&cmd.model, &cmd.device)
                    .and_then(|engine| run_count(Segmenter::new(engine, policy), cmd)),
                Magnification::X10 => TiledEngine::from_path(&cmd.model, &cmd.device)
                    .and_then(|engine| run_count(Segmenter::new(engine, policy), cmd)),
            };

            if let Err(e) = outcome {
                error!("Counting failed: {e}");
                std::process::exit(1);
            }
        }
        Commands::Version => {
            println!("cytoseg {}", env!("CARGO_PKG_VERSION"));
        }
    }
}
