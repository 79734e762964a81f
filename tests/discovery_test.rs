//! 服务注册与发现集成测试（内存存储）

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use zk_discovery::store::ConnectionListener;
use zk_discovery::{
    Config, CoordinationStore, CreateOptions, DiscoveryConfig, DiscoveryError, MemorySession,
    MemoryStore, ServiceDiscovery, ServiceInstance, ServiceType, StoreError, StoreResult,
    WatchEvent, WatchEventKind, Watcher,
};

mod common;

use common::{
    BASE_PATH, discovery_on, wait_for_count, wait_for_instances, wait_for_service,
    wait_for_watching,
};

/// 统计 `create` 调用次数的存储包装
struct CountingStore {
    inner: Arc<MemorySession>,
    creates: Arc<AtomicUsize>,
}

#[async_trait]
impl CoordinationStore for CountingStore {
    async fn create(&self, path: &str, data: Vec<u8>, options: CreateOptions) -> StoreResult<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(path, data, options).await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.inner.delete(path).await
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.inner.get_data(path).await
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> StoreResult<Vec<String>> {
        self.inner.get_children(path, watcher).await
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        self.inner.add_connection_listener(listener)
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// 注入故障的存储包装：读取指定节点数据失败，或扣下指定路径上的 watch 由测试手动触发
struct FaultyStore {
    inner: Arc<MemorySession>,
    failing_data: Option<String>,
    held_path: Option<String>,
    held: std::sync::Mutex<Vec<Watcher>>,
    held_reads: AtomicUsize,
}

impl FaultyStore {
    fn new(inner: Arc<MemorySession>) -> Self {
        Self {
            inner,
            failing_data: None,
            held_path: None,
            held: std::sync::Mutex::new(Vec::new()),
            held_reads: AtomicUsize::new(0),
        }
    }

    fn take_held(&self) -> Option<Watcher> {
        self.held.lock().unwrap().pop()
    }
}

#[async_trait]
impl CoordinationStore for FaultyStore {
    async fn create(&self, path: &str, data: Vec<u8>, options: CreateOptions) -> StoreResult<()> {
        self.inner.create(path, data, options).await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.inner.delete(path).await
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        if self.failing_data.as_deref() == Some(path) {
            return Err(StoreError::backend("injected read failure"));
        }
        self.inner.get_data(path).await
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> StoreResult<Vec<String>> {
        if self.held_path.as_deref() == Some(path) {
            self.held_reads.fetch_add(1, Ordering::SeqCst);
            if let Some(watcher) = watcher {
                self.held.lock().unwrap().push(watcher);
            }
            return self.inner.get_children(path, None).await;
        }
        self.inner.get_children(path, watcher).await
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        self.inner.add_connection_listener(listener)
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_register_then_discover_end_to_end() {
    let store = MemoryStore::new();
    let a = discovery_on(&store);
    let b = discovery_on(&store);
    b.watch().await.unwrap();

    let first = ServiceInstance::new_simple("baz", "a", 8080);
    a.register(&first).await.unwrap();
    assert!(wait_for_instances(&b, "baz", 1).await);
    let seen = b.instances("baz").await;
    assert_eq!(seen[0].id, first.id);
    assert_eq!(seen[0].port, Some(8080));

    let second = ServiceInstance::new_simple("baz", "a", 8081);
    a.register(&second).await.unwrap();
    assert!(wait_for_instances(&b, "baz", 2).await);

    a.unregister(&first).await.unwrap();
    assert!(wait_for_instances(&b, "baz", 1).await);
    assert_eq!(b.instances("baz").await[0].id, second.id);

    a.unregister(&second).await.unwrap();
    assert!(wait_for_instances(&b, "baz", 0).await);
    assert!(!b.service_names().await.contains(&"baz".to_string()));
    assert!(!b.services().contains("baz").await);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_multiple_services_are_tracked_independently() {
    let store = MemoryStore::new();
    let a = discovery_on(&store);
    let b = discovery_on(&store);
    b.watch().await.unwrap();

    for port in [1, 2, 3] {
        a.register(&ServiceInstance::new_simple("baz", "h", port)).await.unwrap();
    }
    a.register(&ServiceInstance::new_simple("qux", "h", 9)).await.unwrap();

    assert!(wait_for_instances(&b, "baz", 3).await);
    assert!(wait_for_instances(&b, "qux", 1).await);
    assert_eq!(b.service_names().await, vec!["baz".to_string(), "qux".to_string()]);

    let picked = b.provider("qux").get_instance().await.unwrap().unwrap();
    assert_eq!(picked.port, Some(9));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_watch_picks_up_existing_registrations() {
    let store = MemoryStore::new();
    let a = discovery_on(&store);
    let instance = ServiceInstance::new_simple("early", "h", 1).with_payload("meta");
    a.register(&instance).await.unwrap();

    let b = discovery_on(&store);
    b.watch().await.unwrap();

    // 启动时同步完成第一次读取
    let cached = b.instances("early").await;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].as_ref(), &instance);

    // 重复调用不会启动第二个缓存
    b.watch().await.unwrap();

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_session_close_removes_dynamic_instances() {
    let store = MemoryStore::new();
    let a = discovery_on(&store);
    let b = discovery_on(&store);
    b.watch().await.unwrap();

    a.register(&ServiceInstance::new_simple("eph", "h", 1)).await.unwrap();
    a.register(
        &ServiceInstance::new_simple("eph", "h", 2).with_service_type(ServiceType::Static),
    )
    .await
    .unwrap();
    assert!(wait_for_instances(&b, "eph", 2).await);

    a.close().await;

    assert!(wait_for_instances(&b, "eph", 1).await);
    assert_eq!(b.instances("eph").await[0].service_type, ServiceType::Static);

    b.close().await;
}

#[tokio::test]
async fn test_undecodable_child_is_skipped() {
    let store = MemoryStore::new();
    let raw = store.session();
    let a = discovery_on(&store);
    let b = discovery_on(&store);
    b.watch().await.unwrap();

    let good = ServiceInstance::new_simple("mixed", "h", 1);
    a.register(&good).await.unwrap();
    raw.create(
        &format!("{}/mixed/garbage", BASE_PATH),
        b"not json".to_vec(),
        CreateOptions::ephemeral(),
    )
    .await
    .unwrap();
    let later = ServiceInstance::new_simple("mixed", "h", 2);
    a.register(&later).await.unwrap();

    assert!(wait_for_instances(&b, "mixed", 2).await);
    let ids: Vec<String> = b.instances("mixed").await.iter().map(|i| i.id.clone()).collect();
    assert!(ids.contains(&good.id));
    assert!(ids.contains(&later.id));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_instance_id_follows_node_name() {
    let store = MemoryStore::new();
    let raw = store.session();
    let b = discovery_on(&store);
    b.watch().await.unwrap();

    let instance = ServiceInstance::new_simple("renamed", "h", 1).with_id("inner-id");
    let data = serde_json::to_vec(&instance).unwrap();
    raw.create(
        &format!("{}/renamed/node-name", BASE_PATH),
        data,
        CreateOptions::persistent().creating_parents(),
    )
    .await
    .unwrap();

    assert!(wait_for_instances(&b, "renamed", 1).await);
    assert_eq!(b.instances("renamed").await[0].id, "node-name");

    b.close().await;
}

#[tokio::test]
async fn test_reconnect_reregisters_once_per_transition() {
    let store = MemoryStore::new();
    let session = Arc::new(store.session());
    let creates = Arc::new(AtomicUsize::new(0));
    let counting = Arc::new(CountingStore {
        inner: session.clone(),
        creates: creates.clone(),
    });
    let discovery = ServiceDiscovery::new(counting, DiscoveryConfig::new(BASE_PATH)).unwrap();
    let handle = discovery.maintain_registrations();

    let instance = ServiceInstance::new_simple("svc", "h", 1);
    discovery.register(&instance).await.unwrap();
    assert_eq!(creates.load(Ordering::SeqCst), 1);
    let path = discovery.paths().for_instance("svc", &instance.id);

    // 会话存活：节点仍在，重新注册视为成功
    session.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.reconnect();
    assert!(wait_for_count(&creates, 2).await);
    assert!(session.get_data(&path).await.is_ok());

    // 会话过期：节点已消失，重新注册会把它写回
    session.expire();
    assert!(session.get_data(&path).await.is_err());
    session.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.reconnect();
    assert!(wait_for_count(&creates, 3).await);
    assert!(session.get_data(&path).await.is_ok());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(creates.load(Ordering::SeqCst), 3);

    discovery.close().await;
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("maintain loop exits after close")
        .unwrap();
}

#[tokio::test]
async fn test_unregister_removes_from_maintained_set() {
    let store = MemoryStore::new();
    let discovery = discovery_on(&store);

    let a = ServiceInstance::new_simple("svc", "h", 1);
    let b = ServiceInstance::new_simple("svc", "h", 2);
    discovery.register(&a).await.unwrap();
    discovery.register(&b).await.unwrap();
    assert_eq!(discovery.maintained().await.len(), 2);

    discovery.unregister(&a).await.unwrap();
    let maintained = discovery.maintained().await;
    assert_eq!(maintained.len(), 1);
    assert_eq!(maintained[0].id, b.id);

    // 节点已不存在：错误返回给调用方，但实例仍从维持表中移除
    let err = discovery.unregister(&a).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Store(StoreError::NoNode(_))));

    discovery.unregister_all().await.unwrap();
    assert!(discovery.maintained().await.is_empty());

    discovery.close().await;
}

#[tokio::test]
async fn test_register_fails_after_retries_when_disconnected() {
    let store = MemoryStore::new();
    let session = Arc::new(store.session());
    let creates = Arc::new(AtomicUsize::new(0));
    let counting = Arc::new(CountingStore {
        inner: session.clone(),
        creates: creates.clone(),
    });
    let discovery = ServiceDiscovery::new(counting, DiscoveryConfig::new(BASE_PATH)).unwrap();

    session.disconnect();
    let err = discovery
        .register(&ServiceInstance::new_simple("svc", "h", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Store(StoreError::NotConnected)));
    assert_eq!(creates.load(Ordering::SeqCst), 3);
    assert!(discovery.maintained().await.is_empty());

    // 不可重试的错误只尝试一次
    session.reconnect();
    session.close().await;
    creates.store(0, Ordering::SeqCst);
    let err = discovery
        .register(&ServiceInstance::new_simple("svc", "h", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Store(StoreError::Closed)));
    assert_eq!(creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_register_rejects_invalid_node_names() {
    let store = MemoryStore::new();
    let discovery = discovery_on(&store);

    let bad_name = ServiceInstance::new_simple("a/b", "h", 1);
    assert!(matches!(
        discovery.register(&bad_name).await,
        Err(DiscoveryError::InvalidInstance(_))
    ));
    let bad_id = ServiceInstance::new_simple("svc", "h", 1).with_id("");
    assert!(matches!(
        discovery.register(&bad_id).await,
        Err(DiscoveryError::InvalidInstance(_))
    ));

    discovery.close().await;
}

#[tokio::test]
async fn test_invalid_config_fails_construction() {
    let store = MemoryStore::new();
    let session = Arc::new(store.session());

    for base in ["", "relative", "/trailing/", "/"] {
        let result = ServiceDiscovery::new(session.clone(), DiscoveryConfig::new(base));
        assert!(matches!(result, Err(DiscoveryError::Config(_))), "base {:?}", base);
    }

    let mut config = DiscoveryConfig::new(BASE_PATH);
    config.register_attempts = 0;
    assert!(ServiceDiscovery::new(session, config).is_err());
}

#[tokio::test]
async fn test_connect_from_config() {
    let config = Config::from_toml_str(
        r#"
        [discovery]
        base_path = "/configured"
        default_strategy = "round_robin"
        "#,
    )
    .unwrap();

    let (discovery, _store) = ServiceDiscovery::connect(&config).await.unwrap();
    assert_eq!(discovery.base_path(), "/configured");
    discovery.watch().await.unwrap();

    // 同一会话内注册和发现
    for port in [1, 2] {
        discovery.register(&ServiceInstance::new_simple("svc", "h", port)).await.unwrap();
    }
    assert!(wait_for_instances(&discovery, "svc", 2).await);

    let provider = discovery.provider("svc");
    let first = provider.get_instance().await.unwrap().unwrap();
    let second = provider.get_instance().await.unwrap().unwrap();
    assert_ne!(first.id, second.id);

    discovery.close().await;
}

#[tokio::test]
async fn test_close_stops_background_loops() {
    let store = MemoryStore::new();
    let a = discovery_on(&store);
    a.watch().await.unwrap();
    a.register(&ServiceInstance::new_simple("svc", "h", 1)).await.unwrap();
    assert!(wait_for_instances(&a, "svc", 1).await);
    let handle = a.maintain_registrations();

    a.close().await;

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("maintain loop exits after close")
        .unwrap();

    // 关闭后本地视图被清空，提供者不再返回已关闭会话看到的实例
    assert!(a.service_names().await.is_empty());
    assert!(a.watching().await.is_empty());
    assert!(a.provider("svc").get_instance().await.unwrap().is_none());

    // 关闭后的会话拒绝操作
    let err = a.register(&ServiceInstance::new_simple("svc", "h", 2)).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Store(StoreError::Closed)));
}

#[tokio::test]
async fn test_deleted_service_node_leaves_view_and_returns() {
    let store = MemoryStore::new();
    let raw = store.session();
    let a = discovery_on(&store);
    let b = discovery_on(&store);
    b.watch().await.unwrap();

    let first = ServiceInstance::new_simple("svc", "h", 1);
    a.register(&first).await.unwrap();
    assert!(wait_for_instances(&b, "svc", 1).await);
    assert!(wait_for_watching(&b, "svc", true).await);

    a.unregister(&first).await.unwrap();
    assert!(wait_for_instances(&b, "svc", 0).await);
    raw.delete(&a.paths().for_name("svc")).await.unwrap();

    assert!(wait_for_watching(&b, "svc", false).await);
    assert!(b.service_names().await.is_empty());

    // 服务节点重新出现：重新发现并重新注册实例列表 watch
    let second = ServiceInstance::new_simple("svc", "h", 2);
    a.register(&second).await.unwrap();
    assert!(wait_for_instances(&b, "svc", 1).await);
    assert!(wait_for_watching(&b, "svc", true).await);
    assert_eq!(b.instances("svc").await[0].id, second.id);

    a.register(&ServiceInstance::new_simple("svc", "h", 3)).await.unwrap();
    assert!(wait_for_instances(&b, "svc", 2).await);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_failed_rearm_is_recovered_by_next_service_pass() {
    let store = MemoryStore::new();
    let a = discovery_on(&store);
    let b_session = Arc::new(store.session());
    let b = ServiceDiscovery::new(b_session.clone(), DiscoveryConfig::new(BASE_PATH)).unwrap();
    b.watch().await.unwrap();

    a.register(&ServiceInstance::new_simple("svc", "h", 1)).await.unwrap();
    assert!(wait_for_instances(&b, "svc", 1).await);

    // 触发实例列表 watch 时 b 已断开，重新注册 watch 失败
    b_session.disconnect();
    a.register(&ServiceInstance::new_simple("svc", "h", 2)).await.unwrap();
    assert!(wait_for_watching(&b, "svc", false).await);
    assert_eq!(b.instances("svc").await.len(), 1);

    // 下一次服务列表读取重新发现该服务并刷新实例
    b_session.reconnect();
    a.register(&ServiceInstance::new_simple("other", "h", 9)).await.unwrap();
    assert!(wait_for_instances(&b, "other", 1).await);
    assert!(wait_for_watching(&b, "svc", true).await);
    assert!(wait_for_instances(&b, "svc", 2).await);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_unreadable_instance_is_skipped() {
    let store = MemoryStore::new();
    let a = discovery_on(&store);
    let mut faulty = FaultyStore::new(Arc::new(store.session()));
    faulty.failing_data = Some(a.paths().for_instance("svc", "broken"));
    let b = ServiceDiscovery::new(Arc::new(faulty), DiscoveryConfig::new(BASE_PATH)).unwrap();
    b.watch().await.unwrap();

    let good = ServiceInstance::new_simple("svc", "h", 1);
    a.register(&good).await.unwrap();
    assert!(wait_for_instances(&b, "svc", 1).await);

    a.register(&ServiceInstance::new_simple("svc", "h", 2).with_id("broken")).await.unwrap();
    let later = ServiceInstance::new_simple("svc", "h", 3);
    a.register(&later).await.unwrap();

    assert!(wait_for_instances(&b, "svc", 2).await);
    let ids: Vec<String> = b.instances("svc").await.iter().map(|i| i.id.clone()).collect();
    assert!(ids.contains(&good.id));
    assert!(ids.contains(&later.id));
    assert!(!ids.contains(&"broken".to_string()));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_fire_for_unwatched_service_is_ignored() {
    let store = MemoryStore::new();
    let raw = store.session();
    let a = discovery_on(&store);
    let service_path = a.paths().for_name("svc");

    let mut faulty = FaultyStore::new(Arc::new(store.session()));
    faulty.held_path = Some(service_path.clone());
    let faulty = Arc::new(faulty);
    let b = ServiceDiscovery::new(faulty.clone(), DiscoveryConfig::new(BASE_PATH)).unwrap();
    b.watch().await.unwrap();

    let instance = ServiceInstance::new_simple("svc", "h", 1);
    a.register(&instance).await.unwrap();
    assert!(wait_for_instances(&b, "svc", 1).await);

    // 服务被移除，但它的实例列表 watch 还没有送达
    a.unregister(&instance).await.unwrap();
    raw.delete(&service_path).await.unwrap();
    assert!(wait_for_service(&b, "svc", false).await);
    assert!(wait_for_watching(&b, "svc", false).await);

    let reads = faulty.held_reads.load(Ordering::SeqCst);
    let watcher = faulty.take_held().expect("instance watch was armed");
    watcher.fire(WatchEvent {
        path: service_path,
        kind: WatchEventKind::ChildrenChanged,
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(faulty.held_reads.load(Ordering::SeqCst), reads);
    assert!(b.service_names().await.is_empty());
    assert!(b.watching().await.is_empty());

    a.close().await;
    b.close().await;
}
