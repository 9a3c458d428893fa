//! GDCnn Pipeline CLI
//!
//! Runs glomerulus detection and classification over the images of a project.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gdcnn_pipeline::pipeline::{collect_results, print_results};
use gdcnn_pipeline::{
    build_runtime, run_flow, AnnotationStore, Config, ExitCodePolicy, Flow, ImageSelection, ProjectStore,
    RunOutcome,
};

#[derive(Parser)]
#[command(name = "gdcnn-pipeline")]
#[command(about = "Detect and classify glomeruli in whole-slide images", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pipeline.yaml", global = true)]
    config: PathBuf,

    /// Fail a stage when its program exits with a nonzero status
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FlowArg {
    /// Tissue detection through classification
    Full,
    /// Tissue detection, tiling and glomerulus detection
    Detect,
    /// Export and classification of existing glomerulus annotations
    Classify,
}

impl From<FlowArg> for Flow {
    fn from(arg: FlowArg) -> Self {
        match arg {
            FlowArg::Full => Flow::Full,
            FlowArg::Detect => Flow::DetectionOnly,
            FlowArg::Classify => Flow::ClassificationOnly,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline flow (full flow over all images if no command specified)
    Run {
        #[arg(short, long, value_enum, default_value = "full")]
        flow: FlowArg,

        /// Image to process; repeat for several (default: all project images)
        #[arg(short, long = "image")]
        images: Vec<String>,
    },

    /// List the images of the project
    Images,

    /// Show glomerulus counts and the most predicted classes per image
    Results {
        /// Image to report on; repeat for several (default: all project images)
        #[arg(short, long = "image")]
        images: Vec<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "pipeline.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run_command(cli.config, cli.strict, FlowArg::Full, Vec::new())?,

        Some(Commands::Run { flow, images }) => run_command(cli.config, cli.strict, flow, images)?,

        Some(Commands::Images) => images_command(cli.config)?,

        Some(Commands::Results { images, json }) => results_command(cli.config, images, json)?,

        Some(Commands::Validate) => validate_command(cli.config)?,

        Some(Commands::GenerateConfig { output }) => generate_config_command(output)?,
    }

    Ok(())
}

fn run_command(config_path: PathBuf, strict: bool, flow: FlowArg, images: Vec<String>) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;

    // Apply overrides
    if strict {
        config.processing.exit_code_policy = ExitCodePolicy::Strict;
    }

    config.validate()?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let status = runtime.block_on(run_flow(config, flow.into(), images))?;

    match status.outcome {
        Some(RunOutcome::Done) => Ok(()),
        Some(RunOutcome::Failed { stage, cause }) => anyhow::bail!("{} failed: {}", stage, cause),
        Some(RunOutcome::Cancelled) => anyhow::bail!("pipeline cancelled"),
        None => anyhow::bail!("pipeline stopped before finishing"),
    }
}

fn images_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    let store = ProjectStore::open(&config.workspace.base_dir, &config.workspace.project_file)?;

    println!("\n=== Project Images ===");
    for info in store.list_images()? {
        let annotations = store.read_annotations(&info.name)?;
        let subjects = annotations
            .iter()
            .filter(|a| a.has_class(&config.export.subject_class))
            .count();
        let pixel_size = info
            .pixel_size_um
            .map(|um| format!("{um} um/px"))
            .unwrap_or_else(|| "uncalibrated".to_string());
        println!(
            "{:<32} {:>7}x{:<7} {:<14} {} annotations ({} {})",
            info.name,
            info.width,
            info.height,
            pixel_size,
            annotations.len(),
            subjects,
            config.export.subject_class
        );
    }
    Ok(())
}

fn results_command(config_path: PathBuf, images: Vec<String>, json: bool) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    let store = ProjectStore::open(&config.workspace.base_dir, &config.workspace.project_file)?;

    let selection: ImageSelection = if images.is_empty() {
        store.list_images()?.into_iter().map(|info| info.name).collect()
    } else {
        ImageSelection::new(images)
    };
    let results = collect_results(&store, &selection, &config.export.subject_class)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results);
    }
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# GDCnn Pipeline Configuration

# === WORKSPACE: The project to process ===
workspace:
  # Project directory; stage programs write into <base_dir>/Temp
  base_dir: "/data/kidney-project"

  # Image list, relative to base_dir
  project_file: "project.json"

# === TOOLS: External stage programs ===
tools:
  threshold_command: "gdcnn-threshold"
  segment_command: "gdcnn-segment"
  classify_command: "gdcnn-classify"

  # Working directory for the programs (default: current directory)
  # working_dir: "/opt/gdcnn"

  # Extra environment, e.g. to find a virtual environment
  # env:
  #   PATH: "/opt/gdcnn/.venv/bin:/usr/bin:/bin"

# === TISSUE: Low-resolution export for thresholding ===
tissue:
  downsample: 20
  image_extension: ".jpeg"

# === TILING: Tiles handed to the glomerulus detector ===
tiling:
  tile_size: 4096
  overlap: 2048
  downsample: 1.0
  image_extension: ".jpeg"

# === DETECTION: Glomerulus segmentation ===
detection:
  model: "cascade_R_50_FPN_1x"
  train_config: "external"
  undersampling: 1

# === EXPORT: Crops handed to the classifier ===
export:
  # Pixels added around each glomerulus
  padding: 300
  downsample: 1.0
  subject_class: "Glomerulus"

# === CLASSIFICATION ===
classification:
  model: "swin_transformer"

  # Invoke the classifier once per image instead of once per run
  per_image: false

# === PROCESSING ===
processing:
  # lenient: log nonzero exit codes and keep going
  # strict: fail the stage
  exit_code_policy: lenient

  # Placeholder class written by tissue detection
  tissue_class: "Tissue"

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 4

  # Status reporting interval in seconds
  report_interval_secs: 10

  # Save the final status as JSON
  # status_output_path: "/tmp/gdcnn-status.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
