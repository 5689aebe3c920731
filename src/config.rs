use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

// Detection related, bit-exact with the model zoo this was tuned against.
pub const MODEL_OBJECTS_CONFIDENCE_THRESHOLD: f32 = 0.7;
pub const MODEL_LP_CONFIDENCE_THRESHOLD: f32 = 0.4;
pub const MODEL_IOU_THRESHOLD: f32 = 0.4;
pub const MODEL_MASK_ALPHA: f32 = 0.4;
pub const MODEL_CROP_GAIN: f32 = 0.4;
/// Reconsider sending a seen object through the pipeline again once its
/// area grew by this fraction.
pub const DET_RECONSIDER_AREA_INCREASE: f32 = 0.30;
/// 40 secs * 24 FPS worth of ids.
pub const TRACKER_DELTA_OBJECT_LIMIT: usize = 40 * 24;
/// Consecutive absent frames before an event is finalized (~1s at 24 FPS).
pub const TRACKER_OBJECT_LOSS_LIMIT: u32 = 24;

// Working-directory layout, created at startup.
pub const CONFIG_DIR: &str = "config";
pub const RECORD_DIR: &str = "recordings";
pub const THUMB_DIR: &str = "thumbnails";
pub const CACHE_DIR: &str = "cache";
pub const CLIPS_CACHE_DIR: &str = "cache/clips";
pub const MODEL_CACHE_DIR: &str = "cache/models";
pub const EXPORT_DIR: &str = "exports";

pub const DEFAULT_CONFIG: &str = r#"
version: "0.1"
cameras:
  local_file:
    enabled: true
    ffmpeg:
      inputs:
        - path: videos/street.mp4
          roles:
            - Detect
    detect:
      enabled: false
      width: 1280
      height: 720
predictors:
  yolo11_det:
    model:
      path: models/yolo11n.onnx
    ep: CPUExecutionProvider
database:
  path: db/vigil.sqlite3
"#;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub version: Option<String>,
    #[serde(default)]
    pub cameras: BTreeMap<String, CameraConfig>,
    #[serde(default)]
    pub predictors: BTreeMap<String, PredictorConfig>,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub lpr: LprConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub ffmpeg: CameraFfmpegConfig,
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub objects: ObjectConfig,
    #[serde(default)]
    pub record: RecordConfig,
    /// Pull-based backpressure drops frames when the detectors are behind;
    /// push-based blocks capture instead.
    #[serde(default)]
    pub pull_based_order: bool,
    /// ms
    #[serde(default = "default_push_timeout")]
    pub push_based_timeout: u64,
    /// ms
    #[serde(default = "default_pull_timeout")]
    pub pull_based_timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraFfmpegConfig {
    #[serde(default)]
    pub inputs: Vec<CameraInput>,
}

impl CameraFfmpegConfig {
    /// The input that carries the Detect role feeds the pipeline.
    pub fn detect_input(&self) -> Option<&CameraInput> {
        self.inputs
            .iter()
            .find(|input| input.roles.contains(&CameraRole::Detect))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraInput {
    pub path: String,
    #[serde(default)]
    pub roles: Vec<CameraRole>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraRole {
    Audio,
    Record,
    Detect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectConfig {
    #[serde(default)]
    pub enabled: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default = "default_detect_fps")]
    pub fps: u32,
    pub min_initialized: Option<u32>,
    pub max_disappeared: Option<u32>,
}

impl Default for DetectConfig {
    fn default() -> DetectConfig {
        DetectConfig {
            enabled: false,
            width: None,
            height: None,
            fps: default_detect_fps(),
            min_initialized: None,
            max_disappeared: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    #[serde(default = "default_tracked_objects")]
    pub track: Vec<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterConfig>,
}

impl Default for ObjectConfig {
    fn default() -> ObjectConfig {
        ObjectConfig {
            track: default_tracked_objects(),
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub min_area: i64,
    #[serde(default = "default_max_area")]
    pub max_area: i64,
    #[serde(default)]
    pub min_ratio: f32,
    #[serde(default = "default_max_ratio")]
    pub max_ratio: f32,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

impl Default for FilterConfig {
    fn default() -> FilterConfig {
        FilterConfig {
            min_area: 0,
            max_area: default_max_area(),
            min_ratio: 0.0,
            max_ratio: default_max_ratio(),
            threshold: default_threshold(),
            min_score: default_min_score(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub retain: RetainConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetainConfig {
    #[serde(default)]
    pub days: f32,
    #[serde(default)]
    pub mode: RetainMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetainMode {
    #[default]
    All,
    Motion,
    ActiveObjects,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    #[serde(default)]
    pub model: ModelConfig,
    /// Execution provider.
    #[serde(default = "default_ep")]
    pub ep: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// (num keypoints, values per keypoint) for pose models.
    pub kpt_shape: Option<[usize; 2]>,
}

impl Default for PredictorConfig {
    fn default() -> PredictorConfig {
        PredictorConfig {
            model: ModelConfig::default(),
            ep: default_ep(),
            batch_size: default_batch_size(),
            kpt_shape: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: String,
    pub labelmap_path: Option<String>,
    #[serde(default = "default_model_side")]
    pub width: u32,
    #[serde(default = "default_model_side")]
    pub height: u32,
    #[serde(default)]
    pub input_tensor: InputTensor,
    #[serde(default)]
    pub input_pixel_format: PixelFormat,
    #[serde(default)]
    pub input_dtype: InputDType,
    #[serde(default)]
    pub model_type: ModelType,
}

impl Default for ModelConfig {
    fn default() -> ModelConfig {
        ModelConfig {
            path: "models/yolo11n.onnx".to_owned(),
            labelmap_path: None,
            width: default_model_side(),
            height: default_model_side(),
            input_tensor: InputTensor::default(),
            input_pixel_format: PixelFormat::default(),
            input_dtype: InputDType::default(),
            model_type: ModelType::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputTensor {
    #[default]
    #[serde(rename = "NCHW", alias = "nchw")]
    Nchw,
    #[serde(rename = "NHWC", alias = "nhwc")]
    Nhwc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    #[serde(rename = "RGB", alias = "rgb")]
    Rgb,
    #[serde(rename = "BGR", alias = "bgr")]
    Bgr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputDType {
    #[default]
    #[serde(rename = "FLOAT", alias = "float")]
    Float,
    #[serde(rename = "INT", alias = "int")]
    Int,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "SSD", alias = "ssd")]
    Ssd,
    #[serde(rename = "YOLOX", alias = "yolox")]
    Yolox,
    #[serde(rename = "YOLOV9", alias = "yolov9")]
    Yolov9,
    #[default]
    #[serde(rename = "YOLO11", alias = "yolo11")]
    Yolo11,
    #[serde(rename = "YOLONAS", alias = "yolonas")]
    Yolonas,
    #[serde(rename = "DFINE", alias = "dfine")]
    Dfine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LprConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_lpr_detection_threshold")]
    pub detection_threshold: f32,
    #[serde(default = "default_lpr_recognition_threshold")]
    pub recognition_threshold: f32,
    /// Textline orientation flip is applied above this score.
    #[serde(default = "default_lpr_recognition_threshold")]
    pub cls_threshold: f32,
    /// vehicles-of-interest
    #[serde(default = "default_voi")]
    pub voi: BTreeSet<String>,
}

impl Default for LprConfig {
    fn default() -> LprConfig {
        LprConfig {
            enabled: false,
            detection_threshold: default_lpr_detection_threshold(),
            recognition_threshold: default_lpr_recognition_threshold(),
            cls_threshold: default_lpr_recognition_threshold(),
            voi: default_voi(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_push_timeout() -> u64 {
    100
}

fn default_pull_timeout() -> u64 {
    20
}

fn default_detect_fps() -> u32 {
    5
}

fn default_tracked_objects() -> Vec<String> {
    vec!["person".to_owned()]
}

fn default_max_area() -> i64 {
    24_000_000
}

fn default_max_ratio() -> f32 {
    24_000_000.0
}

fn default_threshold() -> f32 {
    0.7
}

fn default_min_score() -> f32 {
    0.5
}

fn default_ep() -> String {
    "CPUExecutionProvider".to_owned()
}

fn default_batch_size() -> usize {
    1
}

fn default_model_side() -> u32 {
    320
}

fn default_lpr_detection_threshold() -> f32 {
    0.7
}

fn default_lpr_recognition_threshold() -> f32 {
    0.9
}

fn default_voi() -> BTreeSet<String> {
    ["bicycle", "car", "motorcycle", "bus", "truck"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Reads `config.yml`; falls back to the built-in document when the file
/// does not exist yet.
#[instrument(fields(config_path = ?config_path.as_ref()), err)]
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<AppConfig> {
    let config_path = config_path.as_ref();
    let raw = if config_path.exists() {
        fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?
    } else {
        info!("no config file found, using the built-in default document");
        DEFAULT_CONFIG.to_owned()
    };
    let config: AppConfig = serde_yaml::from_str(&raw).context("malformed configuration")?;
    Ok(config)
}

/// Creates the working-directory layout if missing.
pub fn ensure_dirs() -> Result<()> {
    for dir in [
        CONFIG_DIR,
        RECORD_DIR,
        THUMB_DIR,
        CACHE_DIR,
        CLIPS_CACHE_DIR,
        MODEL_CACHE_DIR,
        EXPORT_DIR,
    ] {
        if !Path::new(dir).exists() {
            info!(dir, "creating directory");
            fs::create_dir_all(dir).with_context(|| format!("failed to create {dir}"))?;
        }
    }
    Ok(())
}
