//! Inference runtime boundary.
//!
//! The analyzer only sees [`InferenceModule`]; the ONNX Runtime backed [`OrtModule`] is
//! one implementation, tests plug in their own.

use std::path::Path;
use std::sync::Arc;

use ndarray::CowArray;
use ort::tensor::OrtOwnedTensor;
use ort::{Environment, ExecutionProvider, GraphOptimizationLevel, Session, SessionBuilder, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::preprocess::InputTensor;

/// Result of one forward pass, flattened to plain buffers.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleOutput {
    Tensor(Vec<f32>),
    Tuple(Vec<Vec<f32>>),
}

impl ModuleOutput {
    /// Single tensor output, as produced by classifiers.
    pub fn into_tensor(self) -> Result<Vec<f32>> {
        match self {
            ModuleOutput::Tensor(values) => Ok(values),
            ModuleOutput::Tuple(values) => Err(Error::UnexpectedOutput(format!(
                "expected a single tensor, got a tuple of {}",
                values.len()
            ))),
        }
    }

    /// `(scores, boxes)` pair, as produced by the face detector.
    pub fn into_pair(self) -> Result<(Vec<f32>, Vec<f32>)> {
        match self {
            ModuleOutput::Tuple(values) if values.len() >= 2 => {
                let mut iter = values.into_iter();
                match (iter.next(), iter.next()) {
                    (Some(first), Some(second)) => Ok((first, second)),
                    _ => Err(Error::UnexpectedOutput("tuple shorter than two".into())),
                }
            }
            ModuleOutput::Tuple(values) => Err(Error::UnexpectedOutput(format!(
                "expected a tuple of two tensors, got {}",
                values.len()
            ))),
            ModuleOutput::Tensor(_) => Err(Error::UnexpectedOutput(
                "expected a tuple of two tensors, got a single tensor".into(),
            )),
        }
    }
}

pub trait InferenceModule {
    fn forward(&self, input: &InputTensor) -> Result<ModuleOutput>;
}

/// Creates modules on demand so the analyzer can defer loading to the first frame.
pub trait ModuleLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn InferenceModule>>;
}

impl<F> ModuleLoader for F
where
    F: Fn(&Path) -> Result<Box<dyn InferenceModule>>,
{
    fn load(&self, path: &Path) -> Result<Box<dyn InferenceModule>> {
        self(path)
    }
}

pub struct OrtModule {
    _environment: Arc<Environment>,
    session: Session,
}

impl OrtModule {
    pub fn load(path: &Path, threads: i16) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("model file {} does not exist", path.display()),
            )));
        }

        let environment = Environment::builder()
            .with_name("facevision")
            .with_execution_providers([ExecutionProvider::CPU(Default::default())])
            .build()?
            .into_arc();

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_intra_threads(threads)?
            .with_model_from_file(path)?;

        info!(path = %path.display(), threads, "loaded model");

        Ok(Self {
            _environment: environment,
            session,
        })
    }
}

impl InferenceModule for OrtModule {
    fn forward(&self, input: &InputTensor) -> Result<ModuleOutput> {
        let array = CowArray::from(input.view().into_dyn());
        let inputs = vec![Value::from_array(self.session.allocator(), &array)?];
        let outputs: Vec<Value> = self.session.run(inputs)?;

        let mut tensors = Vec::with_capacity(outputs.len());
        for output in outputs.iter() {
            let tensor: OrtOwnedTensor<f32, _> = output.try_extract()?;
            tensors.push(tensor.view().iter().copied().collect::<Vec<f32>>());
        }

        match tensors.len() {
            0 => Err(Error::UnexpectedOutput("model produced no outputs".into())),
            1 => Ok(ModuleOutput::Tensor(tensors.remove(0))),
            _ => Ok(ModuleOutput::Tuple(tensors)),
        }
    }
}

/// Loader backed by ONNX Runtime.
#[derive(Debug, Clone, Copy)]
pub struct OrtLoader {
    pub threads: i16,
}

impl ModuleLoader for OrtLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn InferenceModule>> {
        Ok(Box::new(OrtModule::load(path, self.threads)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_pair() {
        let out = ModuleOutput::Tuple(vec![vec![1.0], vec![2.0, 3.0], vec![4.0]]);
        assert_eq!(out.into_pair().unwrap(), (vec![1.0], vec![2.0, 3.0]));
        assert!(ModuleOutput::Tensor(vec![1.0]).into_pair().is_err());
        assert!(ModuleOutput::Tuple(vec![vec![1.0]]).into_pair().is_err());
    }

    #[test]
    fn test_into_tensor() {
        assert_eq!(
            ModuleOutput::Tensor(vec![0.5]).into_tensor().unwrap(),
            vec![0.5]
        );
        assert!(ModuleOutput::Tuple(vec![]).into_tensor().is_err());
    }

    #[test]
    fn test_missing_model_file() {
        let err = OrtLoader { threads: 1 }
            .load(Path::new("does/not/exist.onnx"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Io(_)));
    }
}
