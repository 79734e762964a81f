//! 服务发现统一错误类型

use super::code::ErrorCode;
use thiserror::Error;

/// 协调存储客户端错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// 节点不存在
    #[error("node does not exist: {0}")]
    NoNode(String),

    /// 节点已存在
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// 节点仍有子节点，无法删除
    #[error("node has children: {0}")]
    NotEmpty(String),

    /// 会话当前未连接
    #[error("store session is not connected")]
    NotConnected,

    /// 会话已关闭
    #[error("store session is closed")]
    Closed,

    /// 后端（etcd 等）返回的其他错误
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// 创建后端错误
    pub fn backend(msg: impl Into<String>) -> Self {
        StoreError::Backend(msg.into())
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NoNode(_) => ErrorCode::NodeNotFound,
            StoreError::NodeExists(_) => ErrorCode::NodeExists,
            StoreError::NotEmpty(_) => ErrorCode::NodeNotEmpty,
            StoreError::NotConnected => ErrorCode::NotConnected,
            StoreError::Closed => ErrorCode::ConnectionClosed,
            StoreError::Backend(_) => ErrorCode::ServiceUnavailable,
        }
    }

    /// 判断是否为可重试的错误（网络抖动、尚未连接）
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// 存储操作结果类型别名
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 服务发现统一错误类型
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// 协调存储错误
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// 实例编码失败
    #[error("failed to encode service instance: {0}")]
    Serialization(#[source] serde_json::Error),

    /// 实例解码失败
    #[error("failed to decode service instance: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// 配置缺失或非法（启动阶段直接失败）
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 实例的服务名或 ID 不能用作节点名
    #[error("invalid service instance: {0}")]
    InvalidInstance(String),
}

impl DiscoveryError {
    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        DiscoveryError::Config(msg.into())
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::Store(e) => e.code(),
            DiscoveryError::Serialization(_) => ErrorCode::SerializationError,
            DiscoveryError::Deserialization(_) => ErrorCode::DeserializationError,
            DiscoveryError::Config(_) => ErrorCode::ConfigurationError,
            DiscoveryError::InvalidInstance(_) => ErrorCode::InvalidParameter,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DiscoveryError>;
