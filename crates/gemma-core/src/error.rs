use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache overflow: writing {len} entries at position {start} exceeds cache size {cache_size}")]
    CacheOverflow {
        start: i64,
        len: i64,
        cache_size: i64,
    },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<i64>,
        got: Vec<i64>,
    },

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
