//! 服务注册与发现模块
//!
//! 实例注册到 `{base_path}/{service-name}/{instance-id}`，节点数据是实例的 JSON 编码。
//! Tree Cache 监听整棵树并维护本地缓存，提供者在缓存上按策略挑选实例。

pub mod cache;
pub mod coalesce;
pub mod instance;
pub mod paths;
pub mod provider;
pub mod serializer;
pub mod service;
pub mod strategy;
pub mod tree_cache;

pub use cache::{InstanceList, ServiceCache};
pub use coalesce::most_recent;
pub use instance::{ServiceInstance, ServiceType};
pub use paths::ServicePaths;
pub use provider::{FixedSetInstanceProvider, InstanceProvider, ServiceProvider};
pub use serializer::{InstanceSerializer, JsonInstanceSerializer};
pub use service::ServiceDiscovery;
pub use strategy::{LoadBalanceStrategy, ProviderStrategy, RandomStrategy, RoundRobinStrategy};
pub use tree_cache::TreeCache;
