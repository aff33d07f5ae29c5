use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Typed failures surfaced to tool callers. Recoverable conditions (cache
/// miss, transient jank during settling) are retried internally and never
/// reach this enum.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no device available: {0}")]
    NoDeviceAvailable(String),

    #[error("no element matched query {query}; nearby candidates: {nearby:?}")]
    ElementNotFound { query: String, nearby: Vec<String> },

    #[error("container with resource-id '{0}' not found in current hierarchy")]
    ContainerNotFound(String),

    #[error("capability unsupported: {0}")]
    CapabilityUnsupported(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid parameters: {0}")]
    Validation(String),

    #[error("malformed plan document: {0}")]
    Structural(String),

    #[error("step index {index} out of bounds; valid range is 0..{max}")]
    OutOfBounds { index: i64, max: usize },

    #[error("device bridge error: {0}")]
    Bridge(#[from] tapdance_adb::BridgeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable machine-readable kind for protocol payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NoDeviceAvailable(_) => "NO_DEVICE_AVAILABLE",
            EngineError::ElementNotFound { .. } => "ELEMENT_NOT_FOUND",
            EngineError::ContainerNotFound(_) => "CONTAINER_NOT_FOUND",
            EngineError::CapabilityUnsupported(_) => "CAPABILITY_UNSUPPORTED",
            EngineError::Timeout(_) => "TIMEOUT",
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Structural(_) => "STRUCTURAL_ERROR",
            EngineError::OutOfBounds { .. } => "OUT_OF_BOUNDS",
            EngineError::Bridge(_) => "BRIDGE_ERROR",
            EngineError::Io(_) => "IO_ERROR",
            EngineError::Json(_) => "JSON_ERROR",
        }
    }
}
