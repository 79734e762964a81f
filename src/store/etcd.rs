//! etcd 协调存储后端
//!
//! 把层级节点模型映射到 etcd 的扁平键空间：
//! - 每个节点是一个键，键名即节点路径；`P` 的子节点是形如 `P/<name>` 且不再含 `/` 的键；
//! - 创建节点是以 `create_revision == 0` 为条件的事务；
//! - 临时节点绑定到会话租约，由后台任务续约；续约失败向监听器报告断开，
//!   租约过期时换发新租约（相当于会话过期后重建会话）；
//! - 一次性 watch 通过从读取版本 +1 开始的前缀 watch 模拟，子节点集合第一次变化后即取消。

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, Event, EventType, GetOptions, PutOptions, Txn,
    TxnOp, WatchOptions,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ConnectionListener, CoordinationStore, CreateMode, CreateOptions, WatchEvent, WatchEventKind,
    Watcher,
};
use crate::config::StoreConfig;
use crate::discovery::paths::{parent_path, validate_path};
use crate::error::{StoreError, StoreResult};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

type SharedListener = Arc<dyn Fn(bool) + Send + Sync>;

struct SessionState {
    lease_id: i64,
    connected: bool,
    closed: bool,
    listeners: Vec<SharedListener>,
}

/// etcd 存储会话
pub struct EtcdStore {
    client: Client,
    session: Arc<Mutex<SessionState>>,
    shutdown: CancellationToken,
}

fn backend(e: etcd_client::Error) -> StoreError {
    StoreError::backend(e.to_string())
}

fn lock(session: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn direct_child(prefix: &str, key: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
}

/// 事件是否改变了子节点集合（创建或删除直接子节点）
fn is_child_change(prefix: &str, event: &Event) -> bool {
    let Some(kv) = event.kv() else {
        return false;
    };
    let Ok(key) = kv.key_str() else {
        return false;
    };
    if direct_child(prefix, key).is_none() {
        return false;
    }
    match event.event_type() {
        EventType::Delete => true,
        EventType::Put => kv.create_revision() == kv.mod_revision(),
    }
}

fn notify(session: &Mutex<SessionState>, connected: bool) {
    let listeners = {
        let mut state = lock(session);
        if state.closed || state.connected == connected {
            return;
        }
        state.connected = connected;
        state.listeners.clone()
    };
    info!(connected, "etcd session connection state changed");
    for listener in listeners {
        listener(connected);
    }
}

impl EtcdStore {
    /// 连接 etcd（按指数退避重试）并建立会话租约
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let policy = ExponentialBackoffPolicy::new(
            config.connect_attempts,
            Duration::from_secs(1),
            Duration::from_secs(15),
        );

        let mut attempt = 0;
        let mut client = loop {
            attempt += 1;
            let options = ConnectOptions::new().with_connect_timeout(Duration::from_secs(5));
            match Client::connect(config.endpoints.clone(), Some(options)).await {
                Ok(client) => break client,
                Err(e) => {
                    let err = backend(e);
                    if !policy.should_retry(attempt, &err) {
                        error!(attempt, error = %err, "Failed to connect to etcd");
                        return Err(err);
                    }
                    warn!(attempt, error = %err, "etcd connect attempt failed");
                    tokio::time::sleep(policy.backoff_duration(attempt)).await;
                }
            }
        };

        let ttl = config.session_ttl as i64;
        let lease = client.lease_grant(ttl, None).await.map_err(backend)?;
        info!(endpoints = ?config.endpoints, lease_id = lease.id(), ttl, "etcd session established");

        let store = Self {
            client,
            session: Arc::new(Mutex::new(SessionState {
                lease_id: lease.id(),
                connected: true,
                closed: false,
                listeners: Vec::new(),
            })),
            shutdown: CancellationToken::new(),
        };
        store.start_keep_alive(ttl);
        Ok(store)
    }

    fn start_keep_alive(&self, ttl: i64) {
        let mut client = self.client.clone();
        let session = self.session.clone();
        let shutdown = self.shutdown.clone();
        let interval = Duration::from_secs((ttl as u64 / 3).max(1));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let lease_id = lock(&session).lease_id;
                match keep_alive_once(&mut client, lease_id).await {
                    Ok(remaining) if remaining > 0 => notify(&session, true),
                    Ok(_) => {
                        // 租约已过期，临时节点已被 etcd 删除
                        warn!(lease_id, "etcd session lease expired");
                        notify(&session, false);
                        match client.lease_grant(ttl, None).await {
                            Ok(lease) => {
                                lock(&session).lease_id = lease.id();
                                info!(lease_id = lease.id(), "etcd session lease renewed");
                                notify(&session, true);
                            }
                            Err(e) => error!(error = %e, "Failed to grant etcd lease"),
                        }
                    }
                    Err(e) => {
                        warn!(lease_id, error = %e, "etcd lease keep-alive failed");
                        notify(&session, false);
                    }
                }
            }
            debug!("etcd keep-alive task stopped");
        });
    }

    fn check_open(&self) -> StoreResult<()> {
        if lock(&self.session).closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn lease_id(&self) -> i64 {
        lock(&self.session).lease_id
    }

    async fn exists(client: &mut Client, path: &str) -> StoreResult<bool> {
        if path == "/" {
            return Ok(true);
        }
        let resp = client
            .get(path, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(backend)?;
        Ok(resp.count() > 0)
    }

    /// 列举直接子节点，同时返回读取时的版本号
    async fn list_children(client: &mut Client, path: &str) -> StoreResult<(Vec<String>, i64)> {
        let prefix = child_prefix(path);
        let resp = client
            .get(
                prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await
            .map_err(backend)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let mut names: Vec<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok())
            .filter_map(|key| direct_child(&prefix, key))
            .collect();
        names.sort();
        names.dedup();
        Ok((names, revision))
    }

    /// 条件创建：键不存在时写入，返回是否写入成功
    async fn put_if_absent(
        client: &mut Client,
        path: &str,
        data: Vec<u8>,
        options: Option<PutOptions>,
    ) -> StoreResult<bool> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(path, data, options)]);
        let resp = client.txn(txn).await.map_err(backend)?;
        Ok(resp.succeeded())
    }

    async fn create_parents(client: &mut Client, parent: &str) -> StoreResult<()> {
        let mut missing = Vec::new();
        let mut cursor = Some(parent);
        while let Some(p) = cursor {
            if Self::exists(client, p).await? {
                break;
            }
            missing.push(p.to_string());
            cursor = parent_path(p);
        }
        for p in missing.iter().rev() {
            Self::put_if_absent(client, p, Vec::new(), None).await?;
        }
        Ok(())
    }
}

async fn keep_alive_once(client: &mut Client, lease_id: i64) -> Result<i64, etcd_client::Error> {
    let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
    keeper.keep_alive().await?;
    match stream.message().await? {
        Some(resp) => Ok(resp.ttl()),
        None => Ok(0),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn create(&self, path: &str, data: Vec<u8>, options: CreateOptions) -> StoreResult<()> {
        self.check_open()?;
        validate_path(path).map_err(StoreError::Backend)?;
        let parent = parent_path(path).ok_or_else(|| StoreError::NodeExists(path.to_string()))?;

        let mut client = self.client.clone();
        if !Self::exists(&mut client, parent).await? {
            if !options.create_parents {
                return Err(StoreError::NoNode(parent.to_string()));
            }
            Self::create_parents(&mut client, parent).await?;
        }

        let put_options = match options.mode {
            CreateMode::Ephemeral => Some(PutOptions::new().with_lease(self.lease_id())),
            CreateMode::Persistent => None,
        };
        if !Self::put_if_absent(&mut client, path, data, put_options).await? {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.check_open()?;
        let mut client = self.client.clone();
        let (children, _) = Self::list_children(&mut client, path).await?;
        if !children.is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        let resp = client.delete(path, None).await.map_err(backend)?;
        if resp.deleted() == 0 {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(())
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.check_open()?;
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(backend)?;
        resp.kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> StoreResult<Vec<String>> {
        self.check_open()?;
        let mut client = self.client.clone();
        if !Self::exists(&mut client, path).await? {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let (children, revision) = Self::list_children(&mut client, path).await?;

        let Some(watcher) = watcher else {
            return Ok(children);
        };
        let prefix = child_prefix(path);
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (mut etcd_watcher, mut stream) = client
            .watch(prefix.as_str(), Some(options))
            .await
            .map_err(backend)?;

        let shutdown = self.shutdown.clone();
        let watched = path.to_string();
        tokio::spawn(async move {
            let fired = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break false,
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                break false;
                            }
                            if resp.events().iter().any(|ev| is_child_change(&prefix, ev)) {
                                break true;
                            }
                        }
                        Ok(None) => break false,
                        Err(e) => {
                            warn!(path = %watched, error = %e, "etcd watch stream failed");
                            break false;
                        }
                    }
                }
            };
            let _ = etcd_watcher.cancel().await;
            if fired {
                watcher.fire(WatchEvent {
                    path: watched,
                    kind: WatchEventKind::ChildrenChanged,
                });
            }
        });

        Ok(children)
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        let mut state = lock(&self.session);
        if !state.closed {
            state.listeners.push(Arc::from(listener));
        }
    }

    async fn close(&self) {
        let lease_id = {
            let mut state = lock(&self.session);
            if state.closed {
                return;
            }
            state.closed = true;
            state.listeners.clear();
            state.lease_id
        };
        self.shutdown.cancel();

        // 撤销租约即删除本会话的临时节点
        let mut client = self.client.clone();
        if let Err(e) = client.lease_revoke(lease_id).await {
            warn!(lease_id, error = %e, "Failed to revoke etcd session lease");
        }
        info!(lease_id, "etcd session closed");
    }
}
