//! Collider configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder setters (programmatic)
//! 2. Environment variables (runtime, via `from_env()`)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use collider_core::ColliderConfig;
//!
//! let config = ColliderConfig::from_env()
//!     .thread_pool_threads(8)
//!     .forward_read_max_size(1024 * 1024);
//! config.validate()?;
//! ```

use std::time::Duration;

use crate::constants::{MIN_POOL_THREADS, READ_LENGTH_MAX};
use crate::env::{env_get, env_get_bool, env_get_size};
use crate::error::{ColliderError, Result};

/// Library defaults
pub mod defaults {
    /// 0 selects the CPU count (floored at 4)
    pub const THREAD_POOL_THREADS: usize = 0;
    pub const THREAD_POOL_CONTENTION: usize = 4;
    pub const USE_DIRECT_BUFFERS: bool = true;
    pub const SHUTDOWN_TIMEOUT_SECS: u64 = 60;
    /// 0 keeps the OS default
    pub const SOCKET_SEND_BUF_SIZE: usize = 0;
    pub const SOCKET_RECV_BUF_SIZE: usize = 0;
    pub const INPUT_QUEUE_BLOCK_SIZE: usize = 32 * 1024;
    pub const OUTPUT_QUEUE_BLOCK_SIZE: usize = 16 * 1024;
    pub const FORWARD_READ_MAX_SIZE: usize = 256 * 1024;
    pub const INPUT_QUEUE_CACHE_MAX: usize = 1024;
    pub const MAX_THREADS: usize = 256;
}

/// Engine configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct ColliderConfig {
    /// Worker threads, 0 = auto
    pub thread_pool_threads: usize,
    /// Independent FIFO shards in the worker pool
    pub thread_pool_contention: usize,
    /// Page-aligned block memory for the input queue
    pub use_direct_buffers: bool,
    /// Grace period for worker pool shutdown
    pub shutdown_timeout: Duration,
    pub socket_send_buf_size: usize,
    pub socket_recv_buf_size: usize,
    /// Size of one input data block
    pub input_queue_block_size: usize,
    /// Byte floor for one gathered write batch
    pub output_queue_block_size: usize,
    /// Unread bytes allowed before read readiness is suspended
    pub forward_read_max_size: usize,
    /// Input blocks retained by the cache
    pub input_queue_cache_max: usize,
}

impl Default for ColliderConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ColliderConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional, sizes accept k/m/g suffixes):
    /// - `COLLIDER_THREAD_POOL_THREADS`
    /// - `COLLIDER_THREAD_POOL_CONTENTION`
    /// - `COLLIDER_USE_DIRECT_BUFFERS` (0/1)
    /// - `COLLIDER_SHUTDOWN_TIMEOUT_SECS`
    /// - `COLLIDER_SOCKET_SEND_BUF_SIZE`
    /// - `COLLIDER_SOCKET_RECV_BUF_SIZE`
    /// - `COLLIDER_INPUT_QUEUE_BLOCK_SIZE`
    /// - `COLLIDER_OUTPUT_QUEUE_BLOCK_SIZE`
    /// - `COLLIDER_FORWARD_READ_MAX_SIZE`
    /// - `COLLIDER_INPUT_QUEUE_CACHE_MAX`
    pub fn from_env() -> Self {
        Self {
            thread_pool_threads: env_get("COLLIDER_THREAD_POOL_THREADS", defaults::THREAD_POOL_THREADS),
            thread_pool_contention: env_get(
                "COLLIDER_THREAD_POOL_CONTENTION",
                defaults::THREAD_POOL_CONTENTION,
            ),
            use_direct_buffers: env_get_bool("COLLIDER_USE_DIRECT_BUFFERS", defaults::USE_DIRECT_BUFFERS),
            shutdown_timeout: Duration::from_secs(env_get(
                "COLLIDER_SHUTDOWN_TIMEOUT_SECS",
                defaults::SHUTDOWN_TIMEOUT_SECS,
            )),
            socket_send_buf_size: env_get_size(
                "COLLIDER_SOCKET_SEND_BUF_SIZE",
                defaults::SOCKET_SEND_BUF_SIZE,
            ),
            socket_recv_buf_size: env_get_size(
                "COLLIDER_SOCKET_RECV_BUF_SIZE",
                defaults::SOCKET_RECV_BUF_SIZE,
            ),
            input_queue_block_size: env_get_size(
                "COLLIDER_INPUT_QUEUE_BLOCK_SIZE",
                defaults::INPUT_QUEUE_BLOCK_SIZE,
            ),
            output_queue_block_size: env_get_size(
                "COLLIDER_OUTPUT_QUEUE_BLOCK_SIZE",
                defaults::OUTPUT_QUEUE_BLOCK_SIZE,
            ),
            forward_read_max_size: env_get_size(
                "COLLIDER_FORWARD_READ_MAX_SIZE",
                defaults::FORWARD_READ_MAX_SIZE,
            ),
            input_queue_cache_max: env_get(
                "COLLIDER_INPUT_QUEUE_CACHE_MAX",
                defaults::INPUT_QUEUE_CACHE_MAX,
            ),
        }
    }

    /// Library defaults only, no environment override.
    pub fn new() -> Self {
        Self {
            thread_pool_threads: defaults::THREAD_POOL_THREADS,
            thread_pool_contention: defaults::THREAD_POOL_CONTENTION,
            use_direct_buffers: defaults::USE_DIRECT_BUFFERS,
            shutdown_timeout: Duration::from_secs(defaults::SHUTDOWN_TIMEOUT_SECS),
            socket_send_buf_size: defaults::SOCKET_SEND_BUF_SIZE,
            socket_recv_buf_size: defaults::SOCKET_RECV_BUF_SIZE,
            input_queue_block_size: defaults::INPUT_QUEUE_BLOCK_SIZE,
            output_queue_block_size: defaults::OUTPUT_QUEUE_BLOCK_SIZE,
            forward_read_max_size: defaults::FORWARD_READ_MAX_SIZE,
            input_queue_cache_max: defaults::INPUT_QUEUE_CACHE_MAX,
        }
    }

    // Builder methods

    pub fn thread_pool_threads(mut self, n: usize) -> Self {
        self.thread_pool_threads = n;
        self
    }

    pub fn thread_pool_contention(mut self, n: usize) -> Self {
        self.thread_pool_contention = n;
        self
    }

    pub fn use_direct_buffers(mut self, enable: bool) -> Self {
        self.use_direct_buffers = enable;
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    pub fn socket_send_buf_size(mut self, size: usize) -> Self {
        self.socket_send_buf_size = size;
        self
    }

    pub fn socket_recv_buf_size(mut self, size: usize) -> Self {
        self.socket_recv_buf_size = size;
        self
    }

    pub fn input_queue_block_size(mut self, size: usize) -> Self {
        self.input_queue_block_size = size;
        self
    }

    pub fn output_queue_block_size(mut self, size: usize) -> Self {
        self.output_queue_block_size = size;
        self
    }

    pub fn forward_read_max_size(mut self, size: usize) -> Self {
        self.forward_read_max_size = size;
        self
    }

    pub fn input_queue_cache_max(mut self, n: usize) -> Self {
        self.input_queue_cache_max = n;
        self
    }

    /// Worker thread count with auto-detection resolved.
    pub fn effective_threads(&self) -> usize {
        if self.thread_pool_threads > 0 {
            return self.thread_pool_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_POOL_THREADS)
            .max(MIN_POOL_THREADS)
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.thread_pool_threads > defaults::MAX_THREADS {
            return Err(ColliderError::InvalidConfig("thread_pool_threads must be <= 256"));
        }
        if self.thread_pool_contention == 0 {
            return Err(ColliderError::InvalidConfig("thread_pool_contention must be > 0"));
        }
        if self.input_queue_block_size == 0 {
            return Err(ColliderError::InvalidConfig("input_queue_block_size must be > 0"));
        }
        if self.output_queue_block_size == 0 {
            return Err(ColliderError::InvalidConfig("output_queue_block_size must be > 0"));
        }
        if self.forward_read_max_size == 0 {
            return Err(ColliderError::InvalidConfig("forward_read_max_size must be > 0"));
        }
        // Unread length may exceed the threshold by two blocks of one read
        let headroom = self.input_queue_block_size.saturating_mul(2);
        if self.forward_read_max_size.saturating_add(headroom) > READ_LENGTH_MAX {
            return Err(ColliderError::InvalidConfig(
                "forward_read_max_size plus two input blocks must fit in 28 bits",
            ));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        crate::kprintln!("Collider Configuration:");
        crate::kprintln!("  thread_pool_threads:     {} (effective {})", self.thread_pool_threads, self.effective_threads());
        crate::kprintln!("  thread_pool_contention:  {}", self.thread_pool_contention);
        crate::kprintln!("  use_direct_buffers:      {}", self.use_direct_buffers);
        crate::kprintln!("  shutdown_timeout:        {:?}", self.shutdown_timeout);
        crate::kprintln!("  socket_send_buf_size:    {}", self.socket_send_buf_size);
        crate::kprintln!("  socket_recv_buf_size:    {}", self.socket_recv_buf_size);
        crate::kprintln!("  input_queue_block_size:  {}", self.input_queue_block_size);
        crate::kprintln!("  output_queue_block_size: {}", self.output_queue_block_size);
        crate::kprintln!("  forward_read_max_size:   {}", self.forward_read_max_size);
        crate::kprintln!("  input_queue_cache_max:   {}", self.input_queue_cache_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ColliderConfig::new();
        assert!(config.validate().is_ok());
        assert!(config.effective_threads() >= MIN_POOL_THREADS);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_builder() {
        let config = ColliderConfig::new()
            .thread_pool_threads(2)
            .forward_read_max_size(4096)
            .use_direct_buffers(false);

        assert_eq!(config.thread_pool_threads, 2);
        assert_eq!(config.effective_threads(), 2);
        assert_eq!(config.forward_read_max_size, 4096);
        assert!(!config.use_direct_buffers);
    }

    #[test]
    fn test_validation() {
        assert!(ColliderConfig::new().thread_pool_threads(1000).validate().is_err());
        assert!(ColliderConfig::new().thread_pool_contention(0).validate().is_err());
        assert!(ColliderConfig::new().input_queue_block_size(0).validate().is_err());
        assert!(ColliderConfig::new().forward_read_max_size(READ_LENGTH_MAX).validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("COLLIDER_INPUT_QUEUE_BLOCK_SIZE", "8k");
        let config = ColliderConfig::from_env();
        assert_eq!(config.input_queue_block_size, 8 * 1024);
        std::env::remove_var("COLLIDER_INPUT_QUEUE_BLOCK_SIZE");
    }
}
