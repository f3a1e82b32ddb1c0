use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("shape mismatch for {what}: expected {expected} values, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid detector configuration: {0}")]
    InvalidDetectorConfig(String),

    #[error("unsupported rotation of {0} degrees")]
    UnsupportedRotation(i32),

    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

impl From<ort::OrtError> for Error {
    fn from(err: ort::OrtError) -> Self {
        Error::Inference(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
