//! 错误处理模块
//!
//! 区分协调存储错误（`StoreError`）与服务发现层错误（`DiscoveryError`），
//! 并通过 `ErrorCode` 提供统一的错误分类与可重试判定。

pub mod code;
pub mod discovery_error;

pub use code::{ErrorCategory, ErrorCode};
pub use discovery_error::{DiscoveryError, Result, StoreError, StoreResult};
