//! 重试策略模块

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;

use crate::error::StoreError;
use std::time::Duration;

/// 重试策略 trait
///
/// `attempt` 为已经完成的尝试次数（从 1 开始）
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: usize, error: &StoreError) -> bool;
    fn backoff_duration(&self, attempt: usize) -> Duration;
    fn max_attempts(&self) -> usize;
}
