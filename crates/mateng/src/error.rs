//! Error Types for the Engine Bridge
//!
//! Every failure surfaced by this crate is a [`MatError`]. Foreign-side
//! failures arrive either as non-zero integer status codes or as null
//! handles; both are mapped onto this taxonomy at the call site.
//!
//! ## Error Categories
//!
//! - Engine start / library loading failures
//! - Session lifecycle (closed sessions, native status codes)
//! - Namespace lookups
//! - Errors raised by the engine while evaluating a statement
//! - Array handle validity and conversion preconditions

use std::fmt;
use thiserror::Error;

use crate::class::MxClass;

/// Result type for engine bridge operations
pub type MatResult<T> = Result<T, MatError>;

/// Why an engine process could not be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartFailure {
    /// The engine executable named in the startup command was not found
    ExecutableNotFound {
        /// The executable that was looked up
        executable: String,
    },
    /// The engine needs a helper shell (`csh` on Unix) that is not installed
    HelperShellMissing,
    /// The engine's automation server is not registered (Windows)
    ServerRegistration,
    /// The engine refused to start for a reason the binding cannot tell
    Unknown,
}

impl fmt::Display for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartFailure::ExecutableNotFound { executable } => {
                write!(f, "engine executable '{}' not found", executable)
            }
            StartFailure::HelperShellMissing => {
                write!(f, "the engine requires csh, which is not installed")
            }
            StartFailure::ServerRegistration => write!(
                f,
                "the engine server is not registered; run `matlab -regserver` once as administrator"
            ),
            StartFailure::Unknown => write!(f, "the engine did not start"),
        }
    }
}

/// Engine bridge error types
#[derive(Error, Debug, Clone)]
pub enum MatError {
    /// The engine process could not be spawned or attached
    #[error("failed to start engine with `{command}`: {reason}")]
    EngineStart {
        /// Startup command that was used
        command: String,
        /// Diagnostic hint
        reason: StartFailure,
    },

    /// The engine shared libraries could not be loaded
    #[error("failed to load engine library {library}: {message}")]
    LibraryLoad {
        /// Library name or path
        library: String,
        /// Loader message
        message: String,
    },

    /// Operation attempted on a closed session
    #[error("session is closed")]
    SessionClosed,

    /// A native call reported a non-zero status code
    #[error("engine call {operation} failed with status {code}")]
    Engine {
        /// The native entry point that failed
        operation: &'static str,
        /// Raw status code, not interpreted
        code: i32,
    },

    /// Namespace lookup returned no binding
    #[error("variable '{name}' not found in the engine namespace")]
    VariableNotFound {
        /// Name that was looked up
        name: String,
    },

    /// The engine raised an error while evaluating a statement
    #[error("engine error {identifier}: {message}")]
    RemoteComputation {
        /// Error identifier, e.g. `MATLAB:undefinedVarOrFunction`
        identifier: String,
        /// Error message
        message: String,
    },

    /// Array operation on a released or transferred handle
    #[error("invalid array handle (released or transferred)")]
    InvalidHandle,

    /// The array's element class has no host equivalent
    #[error("unsupported element type: {class}")]
    UnsupportedElementType {
        /// Class of the array
        class: MxClass,
    },

    /// Requested host element type does not match the array class
    #[error("class mismatch: expected {expected}, got {actual}")]
    ClassMismatch {
        /// Class implied by the requested host type
        expected: MxClass,
        /// Actual class of the array
        actual: MxClass,
    },

    /// Shape precondition of a conversion violated
    #[error("shape mismatch: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        /// Description of the required shape
        expected: String,
        /// Actual dimensions
        actual: Vec<usize>,
    },

    /// Struct array has no field with this name
    #[error("no field named '{field}'")]
    FieldNotFound {
        /// Requested field
        field: String,
    },

    /// Linear index past the end of a container
    #[error("index {index} out of bounds for {len} elements")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Number of elements
        len: usize,
    },

    /// Name is not a valid engine identifier
    #[error("invalid variable name '{name}'")]
    InvalidName {
        /// Offending name
        name: String,
    },

    /// The engine library could not allocate an array
    #[error("allocation failed: {what}")]
    AllocationFailed {
        /// What was being allocated
        what: String,
    },

    /// Forwarding captured output failed
    #[error("failed to forward engine output: {message}")]
    OutputSink {
        /// I/O error message
        message: String,
    },

    /// Configuration could not be parsed
    #[error("invalid configuration: {message}")]
    Config {
        /// Parser message
        message: String,
    },
}

impl MatError {
    /// Create an engine start error
    pub fn engine_start(command: impl Into<String>, reason: StartFailure) -> Self {
        MatError::EngineStart {
            command: command.into(),
            reason,
        }
    }

    /// Create a library load error
    pub fn library_load(library: impl Into<String>, message: impl ToString) -> Self {
        MatError::LibraryLoad {
            library: library.into(),
            message: message.to_string(),
        }
    }

    /// Create a native status error
    pub fn engine(operation: &'static str, code: i32) -> Self {
        MatError::Engine { operation, code }
    }

    /// Create a variable not found error
    pub fn variable_not_found(name: impl Into<String>) -> Self {
        MatError::VariableNotFound { name: name.into() }
    }

    /// Create a remote computation error
    pub fn remote(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        MatError::RemoteComputation {
            identifier: identifier.into(),
            message: message.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, actual: &[usize]) -> Self {
        MatError::ShapeMismatch {
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }

    /// Create an invalid name error
    pub fn invalid_name(name: impl Into<String>) -> Self {
        MatError::InvalidName { name: name.into() }
    }

    /// Create an allocation failure
    pub fn allocation_failed(what: impl Into<String>) -> Self {
        MatError::AllocationFailed { what: what.into() }
    }

    /// Check if this error was raised by the engine itself
    pub fn is_remote(&self) -> bool {
        matches!(self, MatError::RemoteComputation { .. })
    }

    /// Check if this is a conversion precondition failure
    pub fn is_conversion_error(&self) -> bool {
        matches!(
            self,
            MatError::UnsupportedElementType { .. }
                | MatError::ClassMismatch { .. }
                | MatError::ShapeMismatch { .. }
        )
    }
}

impl From<std::io::Error> for MatError {
    fn from(err: std::io::Error) -> Self {
        MatError::OutputSink {
            message: err.to_string(),
        }
    }
}
