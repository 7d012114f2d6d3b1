//! Error types for the data-movement mapper
//!
//! Every error is fatal for the device scope being compiled. Allocation never
//! retries or recovers from a half-assigned channel/lock state.

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Capacity exhausted: {resource}{}", context(.op, .location))]
    CapacityExhausted {
        resource: String,
        op: Option<u32>,
        location: Option<String>,
    },

    #[error("Unsupported memory path {src} -> {dst}{}", context(.op, .location))]
    UnsupportedMemoryPath {
        src: String,
        dst: String,
        op: Option<u32>,
        location: Option<String>,
    },

    #[error("Non-static shape: {message}{}", op_context(.op, .location))]
    NonStaticShape {
        message: String,
        op: u32,
        location: Option<String>,
    },

    #[error("Unresolved broadcast target on channel '{channel}': {message}{}", context(.op, .location))]
    UnresolvedBroadcastTarget {
        channel: String,
        message: String,
        op: Option<u32>,
        location: Option<String>,
    },

    #[error("Incomplete control fold: {message}")]
    IncompleteControlFold { message: String },

    #[error("Invalid graph: {message}{}", context(.op, .location))]
    InvalidGraph {
        message: String,
        op: Option<u32>,
        location: Option<String>,
    },

    #[error("Failed to decode graph: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Code generation error: {message}")]
    CodeGenError { message: String },
}

fn context(op: &Option<u32>, location: &Option<String>) -> String {
    match (op, location) {
        (Some(id), Some(loc)) => format!(" (op {} at {})", id, loc),
        (Some(id), None) => format!(" (op {})", id),
        (None, Some(loc)) => format!(" (at {})", loc),
        (None, None) => String::new(),
    }
}

fn op_context(op: &u32, location: &Option<String>) -> String {
    context(&Some(*op), location)
}

impl CompileError {
    pub fn capacity(resource: impl Into<String>) -> Self {
        CompileError::CapacityExhausted {
            resource: resource.into(),
            op: None,
            location: None,
        }
    }

    pub fn invalid_graph(msg: impl Into<String>) -> Self {
        CompileError::InvalidGraph {
            message: msg.into(),
            op: None,
            location: None,
        }
    }

    pub fn unsupported_path(src: impl Into<String>, dst: impl Into<String>) -> Self {
        CompileError::UnsupportedMemoryPath {
            src: src.into(),
            dst: dst.into(),
            op: None,
            location: None,
        }
    }

    pub fn incomplete_fold(msg: impl Into<String>) -> Self {
        CompileError::IncompleteControlFold { message: msg.into() }
    }

    pub fn codegen(msg: impl Into<String>) -> Self {
        CompileError::CodeGenError { message: msg.into() }
    }

    /// Attach the offending op's id and location, keeping any context that
    /// was already recorded closer to the failure.
    pub fn at_op(mut self, id: u32, loc: Option<&str>) -> Self {
        match &mut self {
            CompileError::CapacityExhausted { op, location, .. }
            | CompileError::UnsupportedMemoryPath { op, location, .. }
            | CompileError::UnresolvedBroadcastTarget { op, location, .. }
            | CompileError::InvalidGraph { op, location, .. } => {
                if op.is_none() {
                    *op = Some(id);
                    if location.is_none() {
                        *location = loc.map(str::to_string);
                    }
                }
            }
            CompileError::NonStaticShape { location, .. } => {
                if location.is_none() {
                    *location = loc.map(str::to_string);
                }
            }
            _ => {}
        }
        self
    }

    /// Id of the movement op the error was reported against, if any
    pub fn op_id(&self) -> Option<u32> {
        match self {
            CompileError::CapacityExhausted { op, .. }
            | CompileError::UnsupportedMemoryPath { op, .. }
            | CompileError::UnresolvedBroadcastTarget { op, .. }
            | CompileError::InvalidGraph { op, .. } => *op,
            CompileError::NonStaticShape { op, .. } => Some(*op),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_in_message() {
        let err = CompileError::capacity("interface tiles").at_op(7, Some("seg0.herd0"));
        assert_eq!(
            err.to_string(),
            "Capacity exhausted: interface tiles (op 7 at seg0.herd0)"
        );
        assert_eq!(err.op_id(), Some(7));
    }

    #[test]
    fn test_first_context_wins() {
        let err = CompileError::invalid_graph("unknown buffer 'x'")
            .at_op(3, None)
            .at_op(9, Some("outer"));
        assert_eq!(err.op_id(), Some(3));
        assert_eq!(err.to_string(), "Invalid graph: unknown buffer 'x' (op 3)");
    }
}
