use serde::{Deserialize, Serialize};

use crate::EngineError;

/// JSON-RPC error codes emitted by the protocol server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    // Standard JSON-RPC error codes
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);

    // Tool-server codes (range -32000 to -32099)
    pub const TOOL_NOT_FOUND: Self = Self(-32000);
    pub const TOOL_EXECUTION_FAILED: Self = Self(-32001);
    pub const INVALID_TOOL_PARAMS: Self = Self(-32002);
    pub const TIMEOUT: Self = Self(-32004);
    pub const NO_DEVICE: Self = Self(-32010);
    pub const ELEMENT_NOT_FOUND: Self = Self(-32011);
    pub const CAPABILITY_UNSUPPORTED: Self = Self(-32012);
    pub const STRUCTURAL_ERROR: Self = Self(-32013);
    pub const OUT_OF_BOUNDS: Self = Self(-32014);

    pub fn for_error(error: &EngineError) -> Self {
        match error {
            EngineError::NoDeviceAvailable(_) => Self::NO_DEVICE,
            EngineError::ElementNotFound { .. } | EngineError::ContainerNotFound(_) => {
                Self::ELEMENT_NOT_FOUND
            }
            EngineError::CapabilityUnsupported(_) => Self::CAPABILITY_UNSUPPORTED,
            EngineError::Timeout(_) => Self::TIMEOUT,
            EngineError::Validation(_) => Self::INVALID_TOOL_PARAMS,
            EngineError::Structural(_) => Self::STRUCTURAL_ERROR,
            EngineError::OutOfBounds { .. } => Self::OUT_OF_BOUNDS,
            _ => Self::TOOL_EXECUTION_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_engine_errors_to_codes() {
        assert_eq!(
            ErrorCode::for_error(&EngineError::NoDeviceAvailable("x".into())),
            ErrorCode::NO_DEVICE
        );
        assert_eq!(
            ErrorCode::for_error(&EngineError::OutOfBounds { index: 5, max: 3 }),
            ErrorCode::OUT_OF_BOUNDS
        );
        assert_eq!(
            ErrorCode::for_error(&EngineError::ContainerNotFound("id".into())),
            ErrorCode::ELEMENT_NOT_FOUND
        );
    }
}
