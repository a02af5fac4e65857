//! digitread: recognize handwritten digits in an image file.
//!
//! Loads (or trains and saves) the digit classifier, runs the recognizer
//! on the given image, prints progress to stderr and the recognized
//! digits to stdout. Useful for:
//!
//! - Checking how a photo segments and classifies
//! - Tuning the filter preset (scale, contrast, brightness, threshold)
//! - Forcing a known digit count with `--columns`
//! - Measuring per-stage durations
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin digitread -- [OPTIONS] <IMAGE_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use digitread_io::{FsDatasetSource, FsModelStore};
use digitread_pipeline::dataset::DEFAULT_SAMPLE_LIMIT;
use digitread_pipeline::{
    CancellationToken, DatasetSource, FilterConfig, HandwritingResult,
    LabelEncoding, ModelCache, Progress, Recognizer, RecognizerConfig, Segmentation, SpriteLayout,
    Stage, TrainingConfig,
};

/// Recognize handwritten digit strings in an image.
///
/// Runs the recognition pipeline on a photo or scan and prints the digits
/// it finds. The classifier is loaded from the model directory, or
/// trained from the reference dataset and saved there on first use.
#[derive(Parser)]
#[command(name = "digitread", version)]
struct Cli {
    /// Path to the input image (JPEG, PNG, GIF, WebP, BMP; at most 10 MiB).
    image_path: PathBuf,

    /// Upscale factor applied before filtering.
    #[arg(long, default_value_t = FilterConfig::DEFAULT_SCALE)]
    scale: f32,

    /// Contrast multiplier around mid-gray.
    #[arg(long, default_value_t = FilterConfig::DEFAULT_CONTRAST)]
    contrast: f32,

    /// Brightness multiplier applied after contrast.
    #[arg(long, default_value_t = FilterConfig::DEFAULT_BRIGHTNESS)]
    brightness: f32,

    /// Binarization threshold (0-255).
    #[arg(long, default_value_t = FilterConfig::DEFAULT_THRESHOLD)]
    threshold: u8,

    /// Skip binarization.
    #[arg(long)]
    no_threshold: bool,

    /// Keep color instead of converting to grayscale.
    #[arg(long)]
    no_grayscale: bool,

    /// Apply a mild secondary contrast and brightness boost.
    #[arg(long)]
    sharpen: bool,

    /// Split the image into exactly this many equal-width columns instead
    /// of searching for connected components.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    columns: Option<u32>,

    /// Full recognizer config as a JSON string.
    ///
    /// When provided, all filter and segmentation flags are ignored. The
    /// JSON must be a valid `RecognizerConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,

    /// Directory holding persisted models.
    #[arg(long, default_value = "models")]
    model_dir: PathBuf,

    /// Directory holding the reference dataset, used when no model is
    /// saved yet.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Reference dataset sprite image [default: <DATA_DIR>/digits-sprite.png].
    #[arg(long)]
    sprite: Option<PathBuf>,

    /// Reference dataset label file [default: <DATA_DIR>/digits-labels.bin].
    #[arg(long)]
    labels: Option<PathBuf>,

    /// How the label file encodes classes.
    #[arg(long, value_enum, default_value_t = Encoding::OneHot)]
    label_encoding: Encoding,

    /// How glyphs are packed into the sprite image.
    #[arg(long, value_enum, default_value_t = Layout::FlatRows)]
    sprite_layout: Layout,

    /// Number of dataset samples used for training.
    #[arg(long, default_value_t = DEFAULT_SAMPLE_LIMIT)]
    sample_limit: usize,

    /// Training passes over the dataset.
    #[arg(long, default_value_t = TrainingConfig::DEFAULT_EPOCHS)]
    epochs: u32,

    /// Seed for weight initialization and shuffling.
    #[arg(long, default_value_t = TrainingConfig::DEFAULT_SEED)]
    seed: u64,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Print the per-stage diagnostics report.
    #[arg(long)]
    diagnostics: bool,

    /// Output the result as JSON instead of plain text.
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Label encoding selection.
#[derive(Clone, Copy, ValueEnum)]
enum Encoding {
    /// Ten bytes per sample.
    OneHot,
    /// One class byte per sample.
    Index,
}

/// Sprite layout selection.
#[derive(Clone, Copy, ValueEnum)]
enum Layout {
    /// One flattened 28x28 sample per row.
    FlatRows,
    /// A grid of 28x28 tiles.
    Tiles,
}

/// Build a [`RecognizerConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and the
/// individual filter and segmentation flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<RecognizerConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(RecognizerConfig {
        filter: FilterConfig {
            scale: cli.scale,
            grayscale: !cli.no_grayscale,
            contrast: cli.contrast,
            brightness: cli.brightness,
            sharpen: cli.sharpen,
            threshold: (!cli.no_threshold).then_some(cli.threshold),
        },
        segmentation: cli
            .columns
            .map_or(Segmentation::ConnectedComponents, Segmentation::FixedColumns),
    })
}

fn training_from_cli(cli: &Cli) -> TrainingConfig {
    TrainingConfig {
        sample_limit: cli.sample_limit,
        epochs: cli.epochs,
        seed: cli.seed,
        ..TrainingConfig::default()
    }
}

/// File name of the sprite image inside the data directory.
const SPRITE_FILE: &str = "digits-sprite.png";

/// File name of the label file inside the data directory.
const LABELS_FILE: &str = "digits-labels.bin";

fn dataset_paths(cli: &Cli) -> (PathBuf, PathBuf) {
    let sprite = cli.sprite.clone().unwrap_or_else(|| cli.data_dir.join(SPRITE_FILE));
    let labels = cli.labels.clone().unwrap_or_else(|| cli.data_dir.join(LABELS_FILE));
    (sprite, labels)
}

fn dataset_from_cli(cli: &Cli) -> Arc<dyn DatasetSource> {
    let (sprite, labels) = dataset_paths(cli);
    let encoding = match cli.label_encoding {
        Encoding::OneHot => LabelEncoding::OneHot,
        Encoding::Index => LabelEncoding::Index,
    };
    let layout = match cli.sprite_layout {
        Layout::FlatRows => SpriteLayout::FlatRows,
        Layout::Tiles => SpriteLayout::Tiles,
    };
    log::debug!("dataset: {} and {}", sprite.display(), labels.display());
    Arc::new(FsDatasetSource::new(sprite, labels, encoding).with_layout(layout))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn print_progress(progress: Progress) {
    match progress.stage {
        Stage::Failed => eprintln!("[{:>3}%] failed: {}", progress.percent, progress.status),
        _ => eprintln!("[{:>3}%] {}", progress.percent, progress.status),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let image_bytes = match digitread_io::read_upload(&cli.image_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error reading {}: {e}", cli.image_path.display());
            return ExitCode::FAILURE;
        }
    };

    eprintln!(
        "Image: {} ({} bytes)",
        cli.image_path.display(),
        image_bytes.len(),
    );
    log::info!("config: {config:?}");

    let cache = ModelCache::new(
        Arc::new(FsModelStore::new(&cli.model_dir)),
        dataset_from_cli(&cli),
        training_from_cli(&cli),
    );
    let recognizer = Recognizer::new(&cache, config);
    let cancel = CancellationToken::new();
    let mut progress = print_progress;

    let mut results = Vec::with_capacity(cli.runs);
    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match recognizer.recognize(&image_bytes, &mut progress, &cancel) {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {
                eprintln!("Cancelled");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                eprintln!("Recognition error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(report) = cache.last_training_report() {
        eprintln!(
            "Trained on {} samples ({} held out), loss {:.4}",
            report.training_samples, report.validation_samples, report.mean_loss,
        );
    }

    let Some(result) = results.first() else {
        return ExitCode::FAILURE;
    };
    if let Err(msg) = print_result(result, cli.json, cli.diagnostics) {
        eprintln!("{msg}");
        return ExitCode::FAILURE;
    }

    if cli.runs > 1 {
        print_multi_run_summary(&results);
    }

    ExitCode::SUCCESS
}

fn print_result(result: &HandwritingResult, json: bool, diagnostics: bool) -> Result<(), String> {
    if json {
        let json = serde_json::to_string_pretty(result)
            .map_err(|e| format!("Error serializing result: {e}"))?;
        println!("{json}");
    } else {
        println!("{}", result.combined_text);
        for (i, d) in result.digits.iter().enumerate() {
            println!(
                "  #{i}: {} ({:.1}%) at {},{} {}x{}",
                d.prediction.symbol(),
                d.prediction.confidence,
                d.bbox.x,
                d.bbox.y,
                d.bbox.width,
                d.bbox.height,
            );
        }
        println!("Processed in {}ms", result.processing_time_ms);
    }
    if diagnostics {
        println!("{}", result.diagnostics.report());
    }
    Ok(())
}

/// Print aggregated timing across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(results: &[HandwritingResult]) {
    println!();
    println!("Summary ({} runs)\n{}", results.len(), "=".repeat(60));

    let durations: Vec<f64> = results
        .iter()
        .map(|r| r.diagnostics.total_duration.as_secs_f64() * 1000.0)
        .collect();
    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len().max(1) as f64;
    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    let consistent = results
        .windows(2)
        .all(|w| w[0].combined_text == w[1].combined_text);
    if !consistent {
        println!("Warning: recognized text differed between runs");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use digitread_pipeline::DatasetError;
    use std::ffi::OsStr;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_the_tuned_preset() {
        let cli = Cli::try_parse_from(["digitread", "digits.png"]).unwrap();
        assert_eq!(config_from_cli(&cli).unwrap(), RecognizerConfig::default());
        assert_eq!(training_from_cli(&cli), TrainingConfig::default());
    }

    #[test]
    fn flags_override_the_preset() {
        let cli = Cli::try_parse_from([
            "digitread",
            "digits.png",
            "--scale",
            "2",
            "--no-threshold",
            "--sharpen",
            "--columns",
            "4",
        ])
        .unwrap();
        let config = config_from_cli(&cli).unwrap();
        assert!((config.filter.scale - 2.0).abs() < f32::EPSILON);
        assert_eq!(config.filter.threshold, None);
        assert!(config.filter.sharpen);
        assert_eq!(config.segmentation, Segmentation::FixedColumns(4));
    }

    #[test]
    fn zero_columns_are_refused() {
        assert!(Cli::try_parse_from(["digitread", "x.png", "--columns", "0"]).is_err());
    }

    #[test]
    fn config_json_replaces_flags() {
        let cli = Cli::try_parse_from([
            "digitread",
            "digits.png",
            "--scale",
            "5",
            "--config-json",
            r#"{"segmentation":{"FixedColumns":2}}"#,
        ])
        .unwrap();
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.filter, FilterConfig::default());
        assert_eq!(config.segmentation, Segmentation::FixedColumns(2));
    }

    #[test]
    fn bad_config_json_is_reported() {
        let cli =
            Cli::try_parse_from(["digitread", "digits.png", "--config-json", "{"]).unwrap();
        assert!(config_from_cli(&cli).unwrap_err().contains("--config-json"));
    }

    #[test]
    fn dataset_defaults_to_data_dir() {
        let cli = Cli::try_parse_from(["digitread", "x.png"]).unwrap();
        let (sprite, labels) = dataset_paths(&cli);
        assert_eq!(sprite, PathBuf::from("data").join(SPRITE_FILE));
        assert_eq!(labels, PathBuf::from("data").join(LABELS_FILE));
    }

    #[test]
    fn dataset_paths_follow_data_dir_and_overrides() {
        let cli = Cli::try_parse_from([
            "digitread",
            "x.png",
            "--data-dir",
            "/srv/digits",
            "--labels",
            "custom.bin",
        ])
        .unwrap();
        let (sprite, labels) = dataset_paths(&cli);
        assert_eq!(sprite, PathBuf::from("/srv/digits").join(SPRITE_FILE));
        assert_eq!(labels, PathBuf::from("custom.bin"));
    }

    #[test]
    fn missing_dataset_names_the_expected_path() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            OsStr::new("digitread"),
            OsStr::new("digits.png"),
            OsStr::new("--data-dir"),
            dir.path().as_os_str(),
        ])
        .unwrap();
        let source = dataset_from_cli(&cli);
        assert!(matches!(
            source.fetch(10),
            Err(DatasetError::Unavailable(ref m)) if m.contains(SPRITE_FILE)
        ));
    }
}
