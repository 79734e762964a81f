//! ZooKeeper 风格的服务注册与发现库
//!
//! 进程把自身实例注册到层级式协调存储中，并在连接恢复后重新注册；
//! 同时可以监听整棵服务树，在本地缓存上按负载均衡策略挑选实例。

pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod retry;
pub mod store;

// Re-exports
pub use config::{Config, DiscoveryConfig, LoggingConfig, StoreBackend, StoreConfig};
pub use discovery::{
    FixedSetInstanceProvider, InstanceList, InstanceProvider, InstanceSerializer,
    JsonInstanceSerializer, LoadBalanceStrategy, ProviderStrategy, RandomStrategy,
    RoundRobinStrategy, ServiceCache, ServiceDiscovery, ServiceInstance, ServiceProvider,
    ServiceType, TreeCache,
};
pub use error::{DiscoveryError, ErrorCategory, ErrorCode, Result, StoreError, StoreResult};
pub use retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};
pub use store::{
    CoordinationStore, CreateMode, CreateOptions, MemorySession, MemoryStore, WatchEvent,
    WatchEventKind, Watcher,
};

#[cfg(feature = "etcd")]
pub use store::EtcdStore;
