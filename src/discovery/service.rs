//! 服务发现门面
//!
//! - 注册：写入 `{base_path}/{name}/{id}`，并记入"需维持"表；
//! - 恢复：连接从断开变为已连接时，重新注册"需维持"表中的全部实例；
//! - 发现：持有 Tree Cache，向调用方提供缓存视图和按服务名的提供者。
//!
//! 进程可以只注册、只发现，或者两者兼有。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, DiscoveryConfig};
use crate::discovery::cache::{InstanceList, ServiceCache};
use crate::discovery::coalesce::most_recent;
use crate::discovery::instance::ServiceInstance;
use crate::discovery::paths::ServicePaths;
use crate::discovery::provider::ServiceProvider;
use crate::discovery::serializer::{InstanceSerializer, JsonInstanceSerializer};
use crate::discovery::strategy::{ProviderStrategy, RandomStrategy};
use crate::discovery::tree_cache::TreeCache;
use crate::error::{DiscoveryError, Result, StoreError};
use crate::retry::{FixedRetryPolicy, RetryPolicy};
use crate::store::{CoordinationStore, CreateMode, CreateOptions};

struct DiscoveryInner {
    store: Arc<dyn CoordinationStore>,
    paths: ServicePaths,
    config: DiscoveryConfig,
    serializer: Arc<dyn InstanceSerializer>,
    retry: FixedRetryPolicy,
    /// 需要在存储中保持存在的注册：实例 ID -> 实例
    maintain: RwLock<HashMap<String, ServiceInstance>>,
    services: ServiceCache,
    tree: Mutex<Option<TreeCache>>,
}

/// 服务发现
///
/// 句柄可以廉价克隆，所有克隆共享同一份状态。
#[derive(Clone)]
pub struct ServiceDiscovery {
    inner: Arc<DiscoveryInner>,
}

impl ServiceDiscovery {
    /// 使用 JSON 编码创建服务发现；配置非法时直接失败
    pub fn new(store: Arc<dyn CoordinationStore>, config: DiscoveryConfig) -> Result<Self> {
        Self::with_serializer(store, config, Arc::new(JsonInstanceSerializer))
    }

    pub fn with_serializer(
        store: Arc<dyn CoordinationStore>,
        config: DiscoveryConfig,
        serializer: Arc<dyn InstanceSerializer>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(DiscoveryInner {
                store,
                paths: ServicePaths::new(config.base_path.clone()),
                retry: FixedRetryPolicy::immediate(config.register_attempts),
                config,
                serializer,
                maintain: RwLock::new(HashMap::new()),
                services: ServiceCache::new(),
                tree: Mutex::new(None),
            }),
        })
    }

    /// 按配置连接存储并创建服务发现，同时返回存储句柄
    pub async fn connect(config: &Config) -> Result<(Self, Arc<dyn CoordinationStore>)> {
        config.validate()?;
        let store = crate::store::connect(&config.store).await?;
        let discovery = Self::new(store.clone(), config.discovery.clone())?;
        Ok((discovery, store))
    }

    pub fn base_path(&self) -> &str {
        self.inner.paths.base()
    }

    pub fn paths(&self) -> &ServicePaths {
        &self.inner.paths
    }

    /// 注册实例
    ///
    /// `Dynamic` 实例创建为临时节点，其余为持久节点，缺失的父路径会被创建。
    /// 写入最多尝试 `register_attempts` 次；节点已存在视为注册已生效。
    /// 只有写入成功后实例才会进入"需维持"表。
    pub async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        check_node_name("service name", &instance.name)?;
        check_node_name("instance id", &instance.id)?;

        let data = self.inner.serializer.serialize(instance)?;
        let path = self.inner.paths.for_instance(&instance.name, &instance.id);
        let mode = if instance.is_ephemeral() {
            CreateMode::Ephemeral
        } else {
            CreateMode::Persistent
        };
        let options = CreateOptions {
            mode,
            create_parents: true,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(
                service = %instance.name,
                spec = %instance.spec(),
                attempt,
                path = %path,
                "Creating registration"
            );
            match self.inner.store.create(&path, data.clone(), options).await {
                Ok(()) => break,
                Err(StoreError::NodeExists(_)) => {
                    debug!(service = %instance.name, path = %path, "Registration already present");
                    break;
                }
                Err(e) if self.inner.retry.should_retry(attempt, &e) => {
                    warn!(service = %instance.name, path = %path, attempt, error = %e,
                        "Registration attempt failed");
                    let delay = self.inner.retry.backoff_duration(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.inner
            .maintain
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    /// 注销实例
    ///
    /// 先从"需维持"表移除（即使随后的删除失败），再删除存储节点。
    pub async fn unregister(&self, instance: &ServiceInstance) -> Result<()> {
        let path = self.inner.paths.for_instance(&instance.name, &instance.id);
        self.inner.maintain.write().await.remove(&instance.id);

        info!(service = %instance.name, spec = %instance.spec(), path = %path, "Deleting registration");
        self.inner.store.delete(&path).await?;
        Ok(())
    }

    /// 重新注册全部需维持的实例，遇到第一个错误即返回
    pub async fn reregister_all(&self) -> Result<()> {
        for instance in self.maintained().await {
            self.register(&instance).await?;
        }
        Ok(())
    }

    /// 注销全部需维持的实例，遇到第一个错误即返回
    pub async fn unregister_all(&self) -> Result<()> {
        for instance in self.maintained().await {
            self.unregister(&instance).await?;
        }
        Ok(())
    }

    /// 当前需维持的注册
    pub async fn maintained(&self) -> Vec<ServiceInstance> {
        self.inner.maintain.read().await.values().cloned().collect()
    }

    /// 启动注册维持任务
    ///
    /// 监听连接状态，每当从"未连接"变为"已连接"时调用 [`reregister_all`]。
    /// 初始状态视为未连接，因此第一次收到"已连接"也会触发一次重新注册。
    /// 存储会话关闭（监听器被释放）后任务退出。
    ///
    /// [`reregister_all`]: ServiceDiscovery::reregister_all
    pub fn maintain_registrations(&self) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let discovery = self.clone();
        let handle = tokio::spawn(async move {
            let mut prev = false;
            while let Some(connected) = most_recent(&mut rx).await {
                if connected && !prev {
                    info!(base_path = %discovery.base_path(), "Reconnected. Re-registering services.");
                    if let Err(e) = discovery.reregister_all().await {
                        warn!(base_path = %discovery.base_path(), error = %e,
                            "Failed to re-register services");
                    }
                }
                prev = connected;
            }
            info!(base_path = %discovery.base_path(), "Done maintaining registrations");
        });

        self.inner
            .store
            .add_connection_listener(Box::new(move |connected| {
                let _ = tx.send(connected);
            }));
        handle
    }

    /// 确保基础路径存在，然后启动 Tree Cache
    ///
    /// 返回时缓存已完成第一次完整读取。重复调用不会启动第二个缓存。
    pub async fn watch(&self) -> Result<()> {
        self.inner.store.ensure_path(self.base_path()).await?;

        let mut tree = self.inner.tree.lock().await;
        if tree.is_some() {
            debug!(base_path = %self.base_path(), "Already watching");
            return Ok(());
        }
        let cache = TreeCache::new(
            self.inner.store.clone(),
            self.inner.paths.clone(),
            self.inner.serializer.clone(),
            self.inner.services.clone(),
        );
        cache.start().await;
        *tree = Some(cache);
        Ok(())
    }

    /// 使用配置的默认策略（默认随机）获取某个服务的提供者
    pub fn provider(&self, name: impl Into<String>) -> ServiceProvider {
        self.provider_with_strategy(name, self.inner.config.default_strategy.build())
    }

    /// 使用随机策略获取提供者
    pub fn random_provider(&self, name: impl Into<String>) -> ServiceProvider {
        self.provider_with_strategy(name, Arc::new(RandomStrategy::new()))
    }

    pub fn provider_with_strategy(
        &self,
        name: impl Into<String>,
        strategy: Arc<dyn ProviderStrategy>,
    ) -> ServiceProvider {
        ServiceProvider::new(name, self.inner.services.clone(), strategy)
    }

    /// 服务名 -> 实例列表的本地缓存视图
    pub fn services(&self) -> &ServiceCache {
        &self.inner.services
    }

    pub async fn instances(&self, name: &str) -> InstanceList {
        self.inner.services.get(name).await
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.inner.services.service_names().await
    }

    /// 正在监听实例列表的服务名；未调用 [`watch`] 时为空
    ///
    /// [`watch`]: ServiceDiscovery::watch
    pub async fn watching(&self) -> Vec<String> {
        match self.inner.tree.lock().await.as_ref() {
            Some(tree) => tree.watching().await,
            None => Vec::new(),
        }
    }

    /// 停止 Tree Cache 并关闭存储会话，所有后台任务随之退出
    pub async fn close(&self) {
        if let Some(tree) = self.inner.tree.lock().await.take() {
            tree.stop().await;
        }
        self.inner.store.close().await;
        info!(base_path = %self.base_path(), "Service discovery closed");
    }
}

fn check_node_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') {
        return Err(DiscoveryError::InvalidInstance(format!(
            "{} {:?} is not a valid node name",
            what, value
        )));
    }
    Ok(())
}
