//! Memory subsystem errors

use thiserror::Error;

/// Errors raised while configuring the memory subsystem.
///
/// Allocation failure is not an error: allocation paths return `None`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    /// Card size must be a power of two of at least 2 bytes
    #[error("Invalid card size {0}: must be a power of two of at least 2 bytes")]
    InvalidCardSize(usize),

    /// Heap range must start and end on a card boundary
    #[error("Heap range [{start:#x}, +{size:#x}) is not aligned to card size {card_size}")]
    UnalignedHeapRange {
        /// Range start
        start: usize,
        /// Range size in bytes
        size: usize,
        /// Card size in bytes
        card_size: usize,
    },

    /// Small tier limit must be below the large tier limit
    #[error("Invalid tier limits: small {small} must be non-zero and below large {large}")]
    InvalidTierLimits {
        /// Largest small-tier allocation
        small: usize,
        /// Largest large-tier allocation
        large: usize,
    },

    /// Pool budget can not be zero
    #[error("Pool limit must be non-zero")]
    ZeroPoolLimit,

    /// Histogram period can not be zero
    #[error("Histogram period must be non-zero")]
    ZeroHistogramPeriod,

    /// Environment variable holds a value that can not be parsed
    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },
}

/// Result type for memory subsystem operations
pub type Result<T> = std::result::Result<T, MemError>;
