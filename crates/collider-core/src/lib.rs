//! # collider-core
//!
//! Core types shared by the Collider reactor and its front-ends.
//!
//! This crate holds everything that does not touch a readiness multiplexer:
//! logging, configuration, the error taxonomy, and the pooled data blocks
//! the session read path stages input in.
//!
//! ## Modules
//!
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities
//! - `error` - Error types
//! - `config` - Engine configuration (defaults + env overrides + builder)
//! - `buffer` - Fixed-capacity data blocks and their lock-free cache

pub mod kprint;
pub mod env;
pub mod error;
pub mod config;
pub mod buffer;

// Re-exports for convenience
pub use buffer::{DataBlock, DataBlockCache};
pub use config::ColliderConfig;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_size, env_get_str, env_is_set};
pub use error::{ColliderError, Result};

/// Constants shared by the engine crates
pub mod constants {
    /// Maximum buffers gathered into one vectored socket write
    pub const WRITE_IOV_MAX: usize = 32;

    /// Bits of the read-path state word carrying the unread byte count
    pub const READ_LENGTH_BITS: u32 = 28;

    /// Largest value the read-path length field can hold
    pub const READ_LENGTH_MAX: usize = (1 << READ_LENGTH_BITS) - 1;

    /// Minimum spill buffer capacity used by the stream defragmenter
    pub const DEFRAG_MIN_SPILL: usize = 1024;

    /// Floor applied to an auto-detected worker thread count
    pub const MIN_POOL_THREADS: usize = 4;
}
