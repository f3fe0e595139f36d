//! Common module
//!
//! This module contains shared types, errors, and utility functions used throughout the application.

pub mod buffer_pool;
pub mod context;
pub mod error;
pub mod log;

// Re-export commonly used types and functions
pub use buffer_pool::{copy_buffers, BufferPool, PooledBuffer, COPY_BUFFER_SIZE};
pub use context::{CancelHandle, Context};
pub use error::{ProxyError, Result};
pub use log::init_logger;
