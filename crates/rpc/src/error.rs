//! JSON-RPC error codes and mapping from service errors.

use opflow_mempool::MempoolError;
use serde_json::{Value, json};

/// The service's JSON-RPC code space: the standard envelope codes plus the
/// bundler range −32000…−32007.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    /// Admission or validation rejected the user operation.
    InvalidUserOp,
    UnsupportedOperation,
    GasTooLow,
    PaymasterDepleted,
    RateLimited,
    Unauthorized,
    InsufficientFunds,
    /// The EntryPoint or its endpoint misbehaved.
    EntryPointFault,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::Internal => -32603,
            Self::InvalidUserOp => -32000,
            Self::UnsupportedOperation => -32001,
            Self::GasTooLow => -32002,
            Self::PaymasterDepleted => -32003,
            Self::RateLimited => -32004,
            Self::Unauthorized => -32005,
            Self::InsufficientFunds => -32006,
            Self::EntryPointFault => -32007,
        }
    }
}

/// A JSON-RPC error about to be serialized into a response envelope.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn to_value(&self) -> Value {
        json!({ "code": self.code.code(), "message": self.message })
    }
}

impl From<MempoolError> for RpcError {
    fn from(error: MempoolError) -> Self {
        match error {
            MempoolError::Full { .. } | MempoolError::ReplacementUnderpriced => {
                Self::new(ErrorCode::InvalidUserOp, error.to_string())
            }
            MempoolError::Validation(reason) => {
                Self::new(classify_validation_reason(&reason), reason)
            }
            MempoolError::EntryPoint(message) => Self::new(ErrorCode::EntryPointFault, message),
            MempoolError::Store(_) | MempoolError::Cache(_) | MempoolError::Codec(_) => {
                Self::new(ErrorCode::Internal, error.to_string())
            }
        }
    }
}

/// Map an EntryPoint rejection reason onto the bundler code space using
/// the AA error-code conventions; anything unrecognized is a plain
/// invalid-UserOp rejection.
pub fn classify_validation_reason(reason: &str) -> ErrorCode {
    let lower = reason.to_lowercase();
    if lower.contains("aa21") || lower.contains("prefund") || lower.contains("insufficient funds") {
        ErrorCode::InsufficientFunds
    } else if lower.contains("aa31") || lower.contains("paymaster") {
        ErrorCode::PaymasterDepleted
    } else if lower.contains("out of gas") || lower.contains("gas too low") || lower.contains("aa95")
    {
        ErrorCode::GasTooLow
    } else {
        ErrorCode::InvalidUserOp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_space_matches_the_wire_contract() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::InvalidRequest.code(), -32600);
        assert_eq!(ErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(ErrorCode::InvalidParams.code(), -32602);
        assert_eq!(ErrorCode::Internal.code(), -32603);
        assert_eq!(ErrorCode::InvalidUserOp.code(), -32000);
        assert_eq!(ErrorCode::UnsupportedOperation.code(), -32001);
        assert_eq!(ErrorCode::GasTooLow.code(), -32002);
        assert_eq!(ErrorCode::PaymasterDepleted.code(), -32003);
        assert_eq!(ErrorCode::RateLimited.code(), -32004);
        assert_eq!(ErrorCode::Unauthorized.code(), -32005);
        assert_eq!(ErrorCode::InsufficientFunds.code(), -32006);
        assert_eq!(ErrorCode::EntryPointFault.code(), -32007);
    }

    #[test]
    fn validation_reasons_classify_by_aa_code() {
        assert_eq!(
            classify_validation_reason("AA21 didn't pay prefund"),
            ErrorCode::InsufficientFunds
        );
        assert_eq!(
            classify_validation_reason("AA31 paymaster deposit too low"),
            ErrorCode::PaymasterDepleted
        );
        assert_eq!(
            classify_validation_reason("AA95 out of gas"),
            ErrorCode::GasTooLow
        );
        assert_eq!(
            classify_validation_reason("AA25 invalid account nonce"),
            ErrorCode::InvalidUserOp
        );
    }

    #[test]
    fn mempool_errors_map_to_invalid_user_op() {
        let full = RpcError::from(MempoolError::Full { size: 1000, max: 1000 });
        assert_eq!(full.code, ErrorCode::InvalidUserOp);
        assert!(full.message.contains("mempool"));

        let underpriced = RpcError::from(MempoolError::ReplacementUnderpriced);
        assert_eq!(underpriced.code, ErrorCode::InvalidUserOp);

        let transport = RpcError::from(MempoolError::EntryPoint("timeout".to_string()));
        assert_eq!(transport.code, ErrorCode::EntryPointFault);
    }
}
