//! On-device image classification and UltraFace face detection over camera frames.

pub mod analysis;
pub mod classification;
pub mod config;
pub mod error;
pub mod face_detection;
pub mod ffi;
pub mod inference;
pub mod overlay;
pub mod pipeline;
pub mod preprocess;
pub mod utils;
pub mod webcam;

pub use error::{Error, Result};
