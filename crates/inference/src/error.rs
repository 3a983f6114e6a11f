use gemma_core::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("No prompts given")]
    NoPrompts,

    #[error("Prompt {0} encodes to no tokens")]
    EmptyPrompt(usize),

    #[error("Generation needs {requested} cache slots but the model has {available}")]
    ExceedsCache { requested: i64, available: i64 },

    #[error("Invalid sampling parameters: {0}")]
    InvalidSampling(String),
}

pub type Result<T> = std::result::Result<T, SamplerError>;
