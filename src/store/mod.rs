//! 协调存储抽象和实现
//!
//! 服务发现只依赖一个层级式、支持一次性 watch 的存储（ZooKeeper 语义）：
//! 节点 CRUD、子节点列举（可附带 watch）以及连接状态通知。

pub mod factory;
pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use async_trait::async_trait;
use std::fmt;

use crate::error::{StoreError, StoreResult};

pub use factory::connect;
pub use memory::{MemorySession, MemoryStore};

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;

/// 节点持久性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// 会话绑定：会话结束时节点自动消失
    Ephemeral,
    /// 持久节点
    Persistent,
}

/// 创建节点选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    pub mode: CreateMode,
    /// 父路径不存在时是否逐级创建（父节点总是持久节点）
    pub create_parents: bool,
}

impl CreateOptions {
    pub fn ephemeral() -> Self {
        Self {
            mode: CreateMode::Ephemeral,
            create_parents: false,
        }
    }

    pub fn persistent() -> Self {
        Self {
            mode: CreateMode::Persistent,
            create_parents: false,
        }
    }

    pub fn creating_parents(mut self) -> Self {
        self.create_parents = true;
        self
    }
}

/// watch 触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    ChildrenChanged,
    NodeDeleted,
}

/// watch 触发事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// 一次性 watch
///
/// 触发一次后即失效，需要调用方重新注册。
pub struct Watcher {
    callback: Box<dyn FnOnce(WatchEvent) + Send>,
}

impl Watcher {
    pub fn new(callback: impl FnOnce(WatchEvent) + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// 触发 watch（消耗自身）
    pub fn fire(self, event: WatchEvent) {
        (self.callback)(event)
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher").finish_non_exhaustive()
    }
}

/// 连接状态监听器，参数为当前是否已连接
pub type ConnectionListener = Box<dyn Fn(bool) + Send + Sync>;

/// 协调存储客户端 trait
///
/// 一个实现对应一个客户端会话。注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// 创建节点
    async fn create(&self, path: &str, data: Vec<u8>, options: CreateOptions) -> StoreResult<()>;

    /// 删除节点
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// 读取节点数据
    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// 列举子节点名称，可选地注册一次性 watch
    ///
    /// watch 在子节点集合变化或节点本身被删除时触发一次。
    async fn get_children(&self, path: &str, watcher: Option<Watcher>)
    -> StoreResult<Vec<String>>;

    /// 注册连接状态监听器
    fn add_connection_listener(&self, listener: ConnectionListener);

    /// 关闭会话
    ///
    /// 会话拥有的临时节点被删除；未触发的 watch 和连接监听器被丢弃。
    async fn close(&self);

    /// 确保路径存在（逐级创建持久节点，已存在不算错误）
    async fn ensure_path(&self, path: &str) -> StoreResult<()> {
        match self
            .create(path, Vec::new(), CreateOptions::persistent().creating_parents())
            .await
        {
            Ok(()) | Err(StoreError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
