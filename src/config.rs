//! Configuration file support.
//!
//! Settings come from a TOML file (`facevision.toml` in the working directory unless a
//! path is given) and are then overridden by command line flags. Every field has a
//! default, so an empty or missing file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::face_detection::model_ultraface::UltrafaceParams;
use crate::preprocess::{Normalization, ResizeMode};

pub const DEFAULT_CONFIG_FILE: &str = "facevision.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Classification,
    FaceDetection,
}

/// The bundled model choices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelPreset {
    #[default]
    Resnet18,
    MobilenetQuantized,
    Ultranet,
}

impl ModelPreset {
    pub fn task(&self) -> Task {
        match self {
            ModelPreset::Resnet18 | ModelPreset::MobilenetQuantized => Task::Classification,
            ModelPreset::Ultranet => Task::FaceDetection,
        }
    }

    /// Input width and height the preset's model was exported with.
    pub fn input_size(&self) -> (u32, u32) {
        match self {
            ModelPreset::Resnet18 | ModelPreset::MobilenetQuantized => (224, 224),
            ModelPreset::Ultranet => (320, 240),
        }
    }

    pub fn normalization(&self) -> Normalization {
        match self {
            ModelPreset::Resnet18 | ModelPreset::MobilenetQuantized => Normalization::TORCHVISION,
            ModelPreset::Ultranet => Normalization::ULTRANET,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ModelPreset::Resnet18 => "resnet18.onnx",
            ModelPreset::MobilenetQuantized => "mobilenet_quantized_925.onnx",
            ModelPreset::Ultranet => "ultranet-slim-320.onnx",
        }
    }
}

impl std::str::FromStr for ModelPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "resnet18" => Ok(ModelPreset::Resnet18),
            "mobilenet-quantized" => Ok(ModelPreset::MobilenetQuantized),
            "ultranet" => Ok(ModelPreset::Ultranet),
            other => Err(Error::Config(format!("unknown model preset '{}'", other))),
        }
    }
}

/// Top-level configuration structure.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub detector: UltrafaceParams,
    pub classifier: ClassifierConfig,
    pub camera: CameraConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub preset: ModelPreset,
    /// Explicit model file. Defaults to `<dir>/<preset file name>`.
    pub path: Option<PathBuf>,
    pub dir: PathBuf,
    pub input_width: Option<u32>,
    pub input_height: Option<u32>,
    pub threads: i16,
    /// Newline separated class names for classifiers.
    pub labels: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            preset: ModelPreset::default(),
            path: None,
            dir: PathBuf::from("models"),
            input_width: None,
            input_height: None,
            threads: 4,
            labels: None,
        }
    }
}

impl ModelConfig {
    pub fn model_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| self.dir.join(self.preset.file_name()))
    }

    pub fn input_size(&self) -> (u32, u32) {
        let (w, h) = self.preset.input_size();
        (self.input_width.unwrap_or(w), self.input_height.unwrap_or(h))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub top_k: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { top_k: 3 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Clockwise rotation applied to every frame before it is fed to the model.
    pub rotation: i32,
    pub resize: ResizeMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Number of frames in the forward-duration moving average.
    pub moving_avg_period: usize,
    /// TrueType font used to print scores on the overlay. Scores are omitted without one.
    pub font: Option<PathBuf>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            moving_avg_period: 10,
            font: None,
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Loads `path` if given (it must exist), otherwise `facevision.toml` when present,
    /// otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let local = Path::new(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    Self::load(local)
                } else {
                    debug!("no configuration file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.detector
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        if self.classifier.top_k == 0 {
            return Err(Error::Config("classifier.top_k must be at least 1".into()));
        }
        if self.display.moving_avg_period == 0 {
            return Err(Error::Config(
                "display.moving_avg_period must be at least 1".into(),
            ));
        }
        if self.model.threads <= 0 {
            return Err(Error::Config("model.threads must be positive".into()));
        }
        let (w, h) = self.model.input_size();
        if w == 0 || h == 0 {
            return Err(Error::Config(format!(
                "model input size {}x{} must be non-zero",
                w, h
            )));
        }
        Ok(())
    }
}
