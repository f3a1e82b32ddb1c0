//! Per-frame analysis: preprocessing, forward pass and post-processing.
//!
//! An [`Analyzer`] is owned by exactly one worker. The model, the input buffer and the
//! face detector are created on the first frame and reused afterwards. The first error
//! latches the analyzer: it is logged and reported once, and every later frame is
//! skipped without touching the model again.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::classification::{classify, ClassScore, Labels};
use crate::config::{Config, Task};
use crate::error::{Error, Result};
use crate::face_detection::model_ultraface::UltrafaceParams;
use crate::face_detection::{init_face_detector_with, release_face_detector, DetectorHandle, FaceInfo};
use crate::inference::{InferenceModule, ModuleLoader};
use crate::preprocess::{
    fill_input_tensor, Frame, FrameTransform, InputTensor, Normalization, ResizeMode,
};

const INPUT_CHANNELS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Detections {
    Classes(Vec<ClassScore>),
    Faces(Vec<FaceInfo>),
}

/// Snapshot produced once per analyzed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub detections: Detections,
    /// Model input size the face coordinates refer to.
    pub input_size: (u32, u32),
    /// Maps face coordinates back onto the upright frame.
    pub transform: FrameTransform,
    pub module_forward_duration: Duration,
    pub analysis_duration: Duration,
}

/// Receives the error that latched the analyzer.
pub type ErrorSink = Box<dyn FnMut(&Error) + Send>;

enum TaskState {
    Classification { top_k: usize, labels: Labels },
    FaceDetection { params: UltrafaceParams },
}

pub struct Analyzer {
    task: TaskState,
    model_path: PathBuf,
    input_size: (u32, u32),
    normalization: Normalization,
    resize: ResizeMode,
    loader: Box<dyn ModuleLoader>,
    module: Option<Box<dyn InferenceModule>>,
    input: Option<InputTensor>,
    detector: Option<DetectorHandle>,
    error_state: bool,
    error_sink: Option<ErrorSink>,
}

impl Analyzer {
    pub fn new(config: &Config, loader: Box<dyn ModuleLoader>) -> Result<Self> {
        config.validate()?;

        let task = match config.model.preset.task() {
            Task::Classification => {
                let labels = match &config.model.labels {
                    Some(path) => Labels::load(path)?,
                    None => Labels::default(),
                };
                TaskState::Classification {
                    top_k: config.classifier.top_k,
                    labels,
                }
            }
            Task::FaceDetection => TaskState::FaceDetection {
                params: config.detector,
            },
        };

        Ok(Self {
            task,
            model_path: config.model.model_path(),
            input_size: config.model.input_size(),
            normalization: config.model.preset.normalization(),
            resize: config.camera.resize,
            loader,
            module: None,
            input: None,
            detector: None,
            error_state: false,
            error_sink: None,
        })
    }

    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn is_error_state(&self) -> bool {
        self.error_state
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    /// Analyzes one frame. `None` means the frame was skipped, either because this call
    /// failed or because an earlier one did.
    pub fn analyze(&mut self, frame: &Frame, rotation_degrees: i32) -> Option<AnalysisResult> {
        if self.error_state {
            return None;
        }

        match self.try_analyze(frame, rotation_degrees) {
            Ok(result) => Some(result),
            Err(e) => {
                error!(error = %e, "Error during image analysis");
                self.error_state = true;
                if let Some(sink) = self.error_sink.as_mut() {
                    sink(&e);
                }
                None
            }
        }
    }

    fn prepare(&mut self) -> Result<()> {
        if self.module.is_none() {
            info!(path = %self.model_path.display(), "loading model");
            self.module = Some(self.loader.load(&self.model_path)?);
        }
        if self.input.is_none() {
            let (w, h) = self.input_size;
            self.input = Some(InputTensor::new(
                INPUT_CHANNELS as usize,
                h as usize,
                w as usize,
            ));
        }
        if let TaskState::FaceDetection { params } = &self.task {
            if self.detector.is_none() {
                let (w, h) = self.input_size;
                self.detector = Some(init_face_detector_with(w, h, INPUT_CHANNELS, *params)?);
            }
        }
        Ok(())
    }

    fn try_analyze(&mut self, frame: &Frame, rotation_degrees: i32) -> Result<AnalysisResult> {
        self.prepare()?;

        let module = self
            .module
            .as_deref()
            .ok_or_else(|| Error::Inference("model is not loaded".into()))?;
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| Error::Inference("input tensor is not allocated".into()))?;

        let start = Instant::now();
        let transform =
            fill_input_tensor(frame, rotation_degrees, self.resize, &self.normalization, input)?;

        let forward_start = Instant::now();
        let output = module.forward(input)?;
        let module_forward_duration = forward_start.elapsed();

        let detections = match &self.task {
            TaskState::Classification { top_k, labels } => {
                let logits = output.into_tensor()?;
                Detections::Classes(classify(&logits, *top_k, labels))
            }
            TaskState::FaceDetection { .. } => {
                let detector = self
                    .detector
                    .as_ref()
                    .ok_or_else(|| Error::Inference("face detector is not initialized".into()))?;
                let (scores, boxes) = output.into_pair()?;
                Detections::Faces(detector.detect(&scores, &boxes)?)
            }
        };

        let analysis_duration = start.elapsed();
        debug!(
            forward_ms = module_forward_duration.as_millis() as u64,
            analysis_ms = analysis_duration.as_millis() as u64,
            "analyzed frame"
        );

        Ok(AnalysisResult {
            detections,
            input_size: self.input_size,
            transform,
            module_forward_duration,
            analysis_duration,
        })
    }

    /// Releases the detector and the model. Called by the worker after its last frame.
    pub fn close(mut self) {
        if let Some(detector) = self.detector.take() {
            release_face_detector(detector);
        }
        if self.module.take().is_some() {
            debug!("released model");
        }
    }
}
