//! 服务实例缓存
//!
//! 服务名 -> 实例列表。列表以不可变快照（`Arc`）整体替换，
//! 读者拿到的永远是某一次完整刷新的结果，不会看到重建到一半的列表。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::discovery::instance::ServiceInstance;

/// 某个服务在某一时刻的实例列表快照
pub type InstanceList = Arc<Vec<Arc<ServiceInstance>>>;

/// 服务发现本地视图
///
/// 只由 Tree Cache 写入，可被任意数量的调用方并发读取。
#[derive(Clone, Default)]
pub struct ServiceCache {
    services: Arc<RwLock<HashMap<String, InstanceList>>>,
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取某个服务的实例快照；未知服务返回空列表
    pub async fn get(&self, name: &str) -> InstanceList {
        let services = self.services.read().await;
        services.get(name).cloned().unwrap_or_default()
    }

    /// 获取整个视图的快照
    pub async fn snapshot(&self) -> HashMap<String, InstanceList> {
        self.services.read().await.clone()
    }

    /// 当前已知的服务名（按字典序）
    pub async fn service_names(&self) -> Vec<String> {
        let services = self.services.read().await;
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.services.read().await.contains_key(name)
    }

    /// 发布服务的新实例列表；空列表会把服务从视图中移除
    pub(crate) async fn publish(&self, name: &str, instances: Vec<Arc<ServiceInstance>>) {
        let mut services = self.services.write().await;
        if instances.is_empty() {
            services.remove(name);
        } else {
            services.insert(name.to_string(), Arc::new(instances));
        }
    }

    pub(crate) async fn remove(&self, name: &str) {
        self.services.write().await.remove(name);
    }

    pub(crate) async fn clear(&self) {
        self.services.write().await.clear();
    }
}
