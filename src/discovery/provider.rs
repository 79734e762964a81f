//! 实例提供者
//!
//! 注意：返回的实例列表只是某一时刻的快照，Tree Cache 随时可能整体替换它，
//! 调用方不应长期持有，每次使用都应重新获取。

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::discovery::cache::{InstanceList, ServiceCache};
use crate::discovery::instance::ServiceInstance;
use crate::discovery::strategy::ProviderStrategy;
use crate::error::Result;

/// 实例来源 trait
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// 返回当前可用的全部实例
    async fn get_all_instances(&self) -> Result<InstanceList>;
}

/// 固定实例集合
#[derive(Debug, Clone, Default)]
pub struct FixedSetInstanceProvider {
    instances: InstanceList,
}

impl FixedSetInstanceProvider {
    pub fn new(instances: Vec<ServiceInstance>) -> Self {
        Self {
            instances: Arc::new(instances.into_iter().map(Arc::new).collect()),
        }
    }
}

#[async_trait]
impl InstanceProvider for FixedSetInstanceProvider {
    async fn get_all_instances(&self) -> Result<InstanceList> {
        Ok(self.instances.clone())
    }
}

/// 某个服务名的提供者：服务发现缓存 + 选择策略
#[derive(Clone)]
pub struct ServiceProvider {
    name: String,
    cache: ServiceCache,
    strategy: Arc<dyn ProviderStrategy>,
}

impl ServiceProvider {
    pub fn new(
        name: impl Into<String>,
        cache: ServiceCache,
        strategy: Arc<dyn ProviderStrategy>,
    ) -> Self {
        Self {
            name: name.into(),
            cache,
            strategy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 选出一个实例，仅供单次使用；没有实例时返回 `None`
    pub async fn get_instance(&self) -> Result<Option<Arc<ServiceInstance>>> {
        self.strategy.get_instance(self).await
    }
}

#[async_trait]
impl InstanceProvider for ServiceProvider {
    async fn get_all_instances(&self) -> Result<InstanceList> {
        Ok(self.cache.get(&self.name).await)
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
