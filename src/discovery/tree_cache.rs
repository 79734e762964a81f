//! Tree Cache
//!
//! 在本地维护 `{base_path}/{service}/{instance_id}` 子树的镜像，使用两级一次性 watch：
//! - 服务列表 watch：基础路径的子节点（服务名）变化；
//! - 实例列表 watch：每个服务一个，服务下的子节点（实例 ID）变化。
//!
//! watch 只触发一次，每次处理都遵循"重新注册 watch → 重新读取当前状态"。
//! 服务列表和每个服务的实例列表各由一个独立的后台任务处理，
//! 每个任务都通过 [`most_recent`] 把突发的多次触发合并为一次读取。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::discovery::cache::ServiceCache;
use crate::discovery::coalesce::most_recent;
use crate::discovery::instance::ServiceInstance;
use crate::discovery::paths::ServicePaths;
use crate::discovery::serializer::InstanceSerializer;
use crate::store::{CoordinationStore, Watcher};

/// 某个服务当前生效的实例列表 watch
struct WatchEntry {
    tx: UnboundedSender<String>,
    /// 每次(重新)开始监听时递增，用于丢弃过期的刷新结果
    generation: u64,
}

#[derive(Default)]
struct TreeState {
    service_list_tx: Option<UnboundedSender<bool>>,
    watching: HashMap<String, WatchEntry>,
    /// 服务名 -> (实例 ID -> 已解码实例)
    existing: HashMap<String, HashMap<String, Arc<ServiceInstance>>>,
    next_generation: u64,
}

struct TreeInner {
    store: Arc<dyn CoordinationStore>,
    paths: ServicePaths,
    serializer: Arc<dyn InstanceSerializer>,
    cache: ServiceCache,
    state: Mutex<TreeState>,
}

/// 基于 watch 的服务树缓存
#[derive(Clone)]
pub struct TreeCache {
    inner: Arc<TreeInner>,
}

impl TreeCache {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        paths: ServicePaths,
        serializer: Arc<dyn InstanceSerializer>,
        cache: ServiceCache,
    ) -> Self {
        Self {
            inner: Arc::new(TreeInner {
                store,
                paths,
                serializer,
                cache,
                state: Mutex::new(TreeState::default()),
            }),
        }
    }

    /// 同步完成第一次完整读取并注册 watch，然后启动服务列表处理任务
    pub async fn start(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock().await;
            if state.service_list_tx.is_some() {
                warn!(base_path = %self.inner.paths.base(), "Tree cache already started");
                return;
            }
            state.service_list_tx = Some(tx);
        }

        self.inner.read_services().await;

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.process_service_changes(rx).await });
    }

    /// 停止注册新的 watch 并清空本地视图
    ///
    /// 已注册在存储中的 watch 触发或被会话丢弃后，后台任务随队列关闭而退出。
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        state.service_list_tx = None;
        state.watching.clear();
        state.existing.clear();
        self.inner.cache.clear().await;
        debug!(base_path = %self.inner.paths.base(), "Tree cache stopped");
    }

    pub fn cache(&self) -> &ServiceCache {
        &self.inner.cache
    }

    /// 当前正在监听实例列表的服务名
    pub async fn watching(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut names: Vec<String> = state.watching.keys().cloned().collect();
        names.sort();
        names
    }
}

impl TreeInner {
    async fn process_service_changes(self: Arc<Self>, mut rx: UnboundedReceiver<bool>) {
        while most_recent(&mut rx).await.is_some() {
            self.read_services().await;
        }
        info!(base_path = %self.paths.base(), "Done watching for service changes");
    }

    async fn process_instance_changes(
        self: Arc<Self>,
        name: String,
        mut rx: UnboundedReceiver<String>,
    ) {
        while let Some(service) = most_recent(&mut rx).await {
            self.read_and_watch(&service, "restarting").await;
        }
        info!(service = %name, "Done watching for instance changes");
    }

    /// 读取服务列表并重新注册服务列表 watch，然后与已知服务做差异
    async fn read_services(self: &Arc<Self>) {
        let Some(tx) = self.state.lock().await.service_list_tx.clone() else {
            return;
        };
        let watcher = Watcher::new(move |_| {
            let _ = tx.send(true);
        });

        let children = match self.store.get_children(self.paths.base(), Some(watcher)).await {
            Ok(children) => children,
            Err(e) => {
                warn!(base_path = %self.paths.base(), error = %e, "Error reading service list");
                return;
            }
        };
        let found: HashSet<&str> = children.iter().map(String::as_str).collect();

        let mut added = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.service_list_tx.is_none() {
                return;
            }

            for name in &children {
                if state.watching.contains_key(name) {
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                state.next_generation += 1;
                let generation = state.next_generation;
                state
                    .watching
                    .insert(name.clone(), WatchEntry { tx, generation });
                added.push((name.clone(), rx));
            }

            let gone: Vec<String> = state
                .watching
                .keys()
                .filter(|name| !found.contains(name.as_str()))
                .cloned()
                .collect();
            for name in &gone {
                state.watching.remove(name);
                state.existing.remove(name);
            }
            // 包括此前因 watch 失败而不在 watching 中的服务
            for name in self.cache.service_names().await {
                if !found.contains(name.as_str()) {
                    self.cache.remove(&name).await;
                    info!(service = %name, "Service removed");
                }
            }
        }

        for (name, rx) in added {
            if self.read_and_watch(&name, "starting").await {
                let inner = self.clone();
                tokio::spawn(async move { inner.process_instance_changes(name, rx).await });
            }
        }
    }

    /// 重新注册某个服务的实例列表 watch 并刷新其实例
    ///
    /// 返回 watch 是否注册成功。对已不在监听中的服务是空操作。
    async fn read_and_watch(self: &Arc<Self>, name: &str, verb: &str) -> bool {
        let entry = {
            let state = self.state.lock().await;
            state
                .watching
                .get(name)
                .map(|entry| (entry.tx.clone(), entry.generation))
        };
        let Some((tx, generation)) = entry else {
            debug!(service = %name, "Ignoring instance change for unwatched service");
            return false;
        };

        let path = self.paths.for_name(name);
        let watched = name.to_string();
        let watcher = Watcher::new(move |_| {
            let _ = tx.send(watched);
        });

        match self.store.get_children(&path, Some(watcher)).await {
            Ok(children) => {
                self.read_instance_list(name, generation, &children).await;
                true
            }
            Err(e) => {
                warn!(service = %name, path = %path, error = %e, "Error {} watch", verb);
                // 交给下一次服务列表读取重新发现
                let mut state = self.state.lock().await;
                if state
                    .watching
                    .get(name)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    state.watching.remove(name);
                    state.existing.remove(name);
                }
                false
            }
        }
    }

    async fn read_instance_list(&self, name: &str, generation: u64, children: &[String]) {
        let existing = {
            let state = self.state.lock().await;
            state.existing.get(name).cloned().unwrap_or_default()
        };

        let mut fresh = HashMap::with_capacity(children.len());
        let mut instances = Vec::with_capacity(children.len());

        for id in children {
            if let Some(instance) = existing.get(id) {
                fresh.insert(id.clone(), instance.clone());
                instances.push(instance.clone());
                continue;
            }

            let path = self.paths.for_instance(name, id);
            let data = match self.store.get_data(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(service = %name, instance_id = %id, path = %path, error = %e,
                        "Error fetching instance info");
                    continue;
                }
            };
            let mut instance = match self.serializer.deserialize(&data) {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(service = %name, instance_id = %id, path = %path, error = %e,
                        "Error decoding instance info");
                    continue;
                }
            };
            // 缓存以路径为键
            instance.id = id.clone();

            info!(service = %name, instance_id = %id, spec = %instance.spec(), "New instance");
            let instance = Arc::new(instance);
            fresh.insert(id.clone(), instance.clone());
            instances.push(instance);
        }

        let mut state = self.state.lock().await;
        if !state
            .watching
            .get(name)
            .is_some_and(|entry| entry.generation == generation)
        {
            debug!(service = %name, "Discarding refresh for service no longer watched");
            return;
        }
        state.existing.insert(name.to_string(), fresh);
        self.cache.publish(name, instances).await;
    }
}
