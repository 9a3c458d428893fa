//! Configuration for the glomerulus analysis pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project location
    pub workspace: WorkspaceConfig,

    /// Stage program names and environment
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Tissue detection parameters
    #[serde(default)]
    pub tissue: TissueConfig,

    /// Tiling parameters
    #[serde(default)]
    pub tiling: TilingConfig,

    /// Glomerulus detection parameters
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Annotation export parameters
    #[serde(default)]
    pub export: ExportConfig,

    /// Classification parameters
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// Run behaviour
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Project directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Project directory. Stage programs export into `<base_dir>/Temp`.
    pub base_dir: PathBuf,

    /// Project file name, relative to `base_dir`
    #[serde(default = "default_project_file")]
    pub project_file: String,
}

/// External stage programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tissue thresholding program
    #[serde(default = "default_threshold_command")]
    pub threshold_command: String,

    /// Glomerulus segmentation program
    #[serde(default = "default_segment_command")]
    pub segment_command: String,

    /// Glomerulus classification program
    #[serde(default = "default_classify_command")]
    pub classify_command: String,

    /// Working directory for every stage program (defaults to the current one)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment for every stage program, e.g. PATH or PYTHONPATH
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            threshold_command: default_threshold_command(),
            segment_command: default_segment_command(),
            classify_command: default_classify_command(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TissueConfig {
    /// Downsample of the low-resolution export handed to the thresholder
    #[serde(default = "default_tissue_downsample")]
    pub downsample: u32,

    /// Extension of the low-resolution export
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
}

impl Default for TissueConfig {
    fn default() -> Self {
        Self {
            downsample: default_tissue_downsample(),
            image_extension: default_image_extension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilingConfig {
    /// Tile edge length in full-resolution pixels
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,

    /// Overlap between neighbouring tiles in pixels
    #[serde(default = "default_overlap")]
    pub overlap: u32,

    /// Downsample applied to each written tile
    #[serde(default = "default_downsample")]
    pub downsample: f64,

    #[serde(default = "default_image_extension")]
    pub image_extension: String,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            overlap: default_overlap(),
            downsample: default_downsample(),
            image_extension: default_image_extension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Segmentation model identifier
    #[serde(default = "default_detection_model")]
    pub model: String,

    /// Training configuration the model was produced with
    #[serde(default = "default_train_config")]
    pub train_config: String,

    #[serde(default = "default_undersampling")]
    pub undersampling: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model: default_detection_model(),
            train_config: default_train_config(),
            undersampling: default_undersampling(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Pixels added around each annotation's bounding box
    #[serde(default = "default_padding")]
    pub padding: u32,

    #[serde(default = "default_downsample")]
    pub downsample: f64,

    /// Class label marking the annotations of interest
    #[serde(default = "default_subject_class")]
    pub subject_class: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            padding: default_padding(),
            downsample: default_downsample(),
            subject_class: default_subject_class(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Backbone network passed as `--netB`; also names the report folder
    #[serde(default = "default_classification_model")]
    pub model: String,

    /// Invoke the classifier once per image (with `--wsi`) instead of once per run
    #[serde(default)]
    pub per_image: bool,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            model: default_classification_model(),
            per_image: false,
        }
    }
}

/// How a nonzero exit status of a stage program is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitCodePolicy {
    /// Log the status and still read the artifact.
    #[default]
    Lenient,
    /// Fail the stage.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub exit_code_policy: ExitCodePolicy,

    /// Class label of the placeholder regions written by tissue detection
    #[serde(default = "default_tissue_class")]
    pub tissue_class: String,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Status reporting interval in seconds while a run is active
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Optional path to save the final status JSON after a run completes
    #[serde(default)]
    pub status_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            exit_code_policy: ExitCodePolicy::default(),
            tissue_class: default_tissue_class(),
            worker_threads: None,
            report_interval_secs: default_report_interval(),
            status_output_path: None,
        }
    }
}

impl Config {
    /// Configuration with every section at its default, rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace: WorkspaceConfig {
                base_dir: base_dir.into(),
                project_file: default_project_file(),
            },
            tools: ToolsConfig::default(),
            tissue: TissueConfig::default(),
            tiling: TilingConfig::default(),
            detection: DetectionConfig::default(),
            export: ExportConfig::default(),
            classification: ClassificationConfig::default(),
            processing: ProcessingConfig::default(),
        }
    }

    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace.base_dir.as_os_str().is_empty() {
            anyhow::bail!("workspace.base_dir must be set");
        }
        for (name, command) in [
            ("threshold_command", &self.tools.threshold_command),
            ("segment_command", &self.tools.segment_command),
            ("classify_command", &self.tools.classify_command),
        ] {
            if command.trim().is_empty() {
                anyhow::bail!("tools.{} must not be empty", name);
            }
        }
        if self.tissue.downsample == 0 {
            anyhow::bail!("tissue.downsample must be > 0");
        }
        if self.tiling.tile_size == 0 {
            anyhow::bail!("tiling.tile_size must be > 0");
        }
        if self.tiling.overlap >= self.tiling.tile_size {
            anyhow::bail!("tiling.overlap must be smaller than tiling.tile_size");
        }
        if self.tiling.downsample < 1.0 || self.export.downsample < 1.0 {
            anyhow::bail!("downsample factors must be >= 1");
        }
        if self.detection.undersampling == 0 {
            anyhow::bail!("detection.undersampling must be > 0");
        }
        if self.export.subject_class.is_empty() || self.export.subject_class.contains('_') {
            anyhow::bail!("export.subject_class must be non-empty and free of '_'");
        }
        if self.processing.report_interval_secs == 0 {
            anyhow::bail!("processing.report_interval_secs must be > 0");
        }
        if self.processing.worker_threads == Some(0) {
            anyhow::bail!("processing.worker_threads must be > 0");
        }
        Ok(())
    }

    /// Absolute or base-relative path of the project file.
    pub fn project_path(&self) -> PathBuf {
        self.workspace.base_dir.join(&self.workspace.project_file)
    }
}

// Default value functions for serde
fn default_project_file() -> String { "project.json".to_string() }
fn default_threshold_command() -> String { "gdcnn-threshold".to_string() }
fn default_segment_command() -> String { "gdcnn-segment".to_string() }
fn default_classify_command() -> String { "gdcnn-classify".to_string() }
fn default_tissue_downsample() -> u32 { 20 }
fn default_image_extension() -> String { ".jpeg".to_string() }
fn default_tile_size() -> u32 { 4096 }
fn default_overlap() -> u32 { 2048 }
fn default_downsample() -> f64 { 1.0 }
fn default_detection_model() -> String { "cascade_R_50_FPN_1x".to_string() }
fn default_train_config() -> String { "external".to_string() }
fn default_undersampling() -> u32 { 1 }
fn default_padding() -> u32 { 300 }
fn default_subject_class() -> String { "Glomerulus".to_string() }
fn default_classification_model() -> String { "swin_transformer".to_string() }
fn default_tissue_class() -> String { "Tissue".to_string() }
fn default_report_interval() -> u64 { 10 }
