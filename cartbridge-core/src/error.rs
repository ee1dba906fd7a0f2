//! Error types for the cartridge bridge.
//!
//! Engine failures (decode, instantiate, invoke) are returned to the embedder
//! instead of terminating the process. Accessor and growth refusals are local
//! and never bypassed.

use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Core error types for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Engine could not be configured
    #[error("engine configuration failed: {0}")]
    Engine(String),

    /// Guest bytecode is malformed or fails validation
    #[error("cartridge decode failed: {0}")]
    Decode(String),

    /// Imports or memory could not be bound to the guest
    #[error("cartridge instantiation failed: {0}")]
    Instantiation(String),

    /// `instantiate` was called before a module was defined
    #[error("no cartridge defined")]
    NotDefined,

    /// The guest trapped while running an entry point
    #[error("cartridge trapped in `{entry}`: {message}")]
    Invocation { entry: &'static str, message: String },

    /// A guest pointer would escape linear memory
    #[error("guest access out of bounds: offset={offset}, length={length}, capacity={capacity}")]
    OutOfBounds {
        offset: i32,
        length: i64,
        capacity: usize,
    },

    /// Growth beyond the fixed memory ceiling
    #[error("memory growth refused: requested={requested}, capacity={capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// The backing store could not be (or is no longer) allocated
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),
}

impl BridgeError {
    /// Returns true if the cartridge itself caused this error.
    #[inline]
    pub fn is_guest_fault(&self) -> bool {
        matches!(
            self,
            BridgeError::Decode(_)
                | BridgeError::Invocation { .. }
                | BridgeError::OutOfBounds { .. }
                | BridgeError::CapacityExceeded { .. }
        )
    }

    /// Returns true for local refusals that left all state untouched.
    #[inline]
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            BridgeError::OutOfBounds { .. } | BridgeError::CapacityExceeded { .. }
        )
    }
}
