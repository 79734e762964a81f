//! 进程内协调存储
//!
//! 以共享的层级树模拟 ZooKeeper：每个 `MemorySession` 相当于一个客户端会话，
//! 拥有自己的临时节点、watch 和连接状态。适合单进程部署和测试。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::{
    ConnectionListener, CoordinationStore, CreateMode, CreateOptions, WatchEvent, WatchEventKind,
    Watcher,
};
use crate::discovery::paths::{parent_path, validate_path};
use crate::error::{StoreError, StoreResult};

type SharedListener = Arc<dyn Fn(bool) + Send + Sync>;

struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
}

struct SessionState {
    connected: bool,
    listeners: Vec<SharedListener>,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    /// path -> (session id, watcher)
    child_watches: HashMap<String, Vec<(u64, Watcher)>>,
    sessions: HashMap<u64, SessionState>,
    next_session: u64,
}

/// 已从树中摘下、待在锁外触发的 watch
type Fired = Vec<(Watcher, WatchEvent)>;

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                ephemeral_owner: None,
            },
        );
        Self {
            nodes,
            child_watches: HashMap::new(),
            sessions: HashMap::new(),
            next_session: 1,
        }
    }

    fn check_session(&self, session: u64) -> StoreResult<()> {
        match self.sessions.get(&session) {
            None => Err(StoreError::Closed),
            Some(state) if !state.connected => Err(StoreError::NotConnected),
            Some(_) => Ok(()),
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn take_watches(&mut self, path: &str, kind: WatchEventKind, fired: &mut Fired) {
        if let Some(watches) = self.child_watches.remove(path) {
            for (_, watcher) in watches {
                fired.push((
                    watcher,
                    WatchEvent {
                        path: path.to_string(),
                        kind,
                    },
                ));
            }
        }
    }

    fn insert_node(&mut self, path: &str, data: Vec<u8>, owner: Option<u64>, fired: &mut Fired) {
        self.nodes.insert(
            path.to_string(),
            Node {
                data,
                ephemeral_owner: owner,
            },
        );
        if let Some(parent) = parent_path(path) {
            self.take_watches(parent, WatchEventKind::ChildrenChanged, fired);
        }
    }

    fn remove_node(&mut self, path: &str, fired: &mut Fired) {
        self.nodes.remove(path);
        self.take_watches(path, WatchEventKind::NodeDeleted, fired);
        if let Some(parent) = parent_path(path) {
            self.take_watches(parent, WatchEventKind::ChildrenChanged, fired);
        }
    }

    fn create(
        &mut self,
        session: u64,
        path: &str,
        data: Vec<u8>,
        options: CreateOptions,
        fired: &mut Fired,
    ) -> StoreResult<()> {
        self.check_session(session)?;
        validate_path(path).map_err(StoreError::Backend)?;
        if self.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }

        let parent = parent_path(path).ok_or_else(|| StoreError::NodeExists(path.to_string()))?;
        if !self.nodes.contains_key(parent) {
            if !options.create_parents {
                return Err(StoreError::NoNode(parent.to_string()));
            }
            let mut missing = Vec::new();
            let mut cursor = Some(parent);
            while let Some(p) = cursor {
                if self.nodes.contains_key(p) {
                    break;
                }
                missing.push(p.to_string());
                cursor = parent_path(p);
            }
            for p in missing.iter().rev() {
                self.insert_node(p, Vec::new(), None, fired);
            }
        }

        let owner = match options.mode {
            CreateMode::Ephemeral => Some(session),
            CreateMode::Persistent => None,
        };
        self.insert_node(path, data, owner, fired);
        Ok(())
    }

    fn delete(&mut self, session: u64, path: &str, fired: &mut Fired) -> StoreResult<()> {
        self.check_session(session)?;
        if path == "/" || !self.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if !self.children_of(path).is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        self.remove_node(path, fired);
        Ok(())
    }

    fn remove_ephemerals(&mut self, session: u64, fired: &mut Fired) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.remove_node(path, fired);
        }
        owned.len()
    }
}

/// 进程内共享的层级存储
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// 打开一个新的客户端会话（初始即为已连接）
    pub fn session(&self) -> MemorySession {
        let id = {
            let mut tree = self.lock();
            let id = tree.next_session;
            tree.next_session += 1;
            tree.sessions.insert(
                id,
                SessionState {
                    connected: true,
                    listeners: Vec::new(),
                },
            );
            id
        };
        debug!(session = id, "Memory store session opened");
        MemorySession {
            id,
            store: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        // 锁内不会 panic，中毒时沿用内部数据
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn fire_all(fired: Fired) {
    for (watcher, event) in fired {
        watcher.fire(event);
    }
}

/// `MemoryStore` 上的一个客户端会话
pub struct MemorySession {
    id: u64,
    store: MemoryStore,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        let tree = self.store.lock();
        tree.sessions.get(&self.id).is_some_and(|s| s.connected)
    }

    /// 模拟连接断开：监听器收到 `false`，后续操作返回 `NotConnected`
    pub fn disconnect(&self) {
        self.set_connected(false);
    }

    /// 模拟重新连接：监听器收到 `true`
    pub fn reconnect(&self) {
        self.set_connected(true);
    }

    /// 模拟会话过期：删除本会话拥有的所有临时节点
    pub fn expire(&self) {
        let mut fired = Vec::new();
        let removed = {
            let mut tree = self.store.lock();
            tree.remove_ephemerals(self.id, &mut fired)
        };
        info!(session = self.id, removed, "Memory store session expired");
        fire_all(fired);
    }

    fn set_connected(&self, connected: bool) {
        let listeners: Vec<SharedListener> = {
            let mut tree = self.store.lock();
            match tree.sessions.get_mut(&self.id) {
                Some(state) if state.connected != connected => {
                    state.connected = connected;
                    state.listeners.clone()
                }
                _ => return,
            }
        };
        debug!(session = self.id, connected, "Memory store connection state changed");
        for listener in listeners {
            listener(connected);
        }
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    async fn create(&self, path: &str, data: Vec<u8>, options: CreateOptions) -> StoreResult<()> {
        let mut fired = Vec::new();
        let result = {
            let mut tree = self.store.lock();
            tree.create(self.id, path, data, options, &mut fired)
        };
        fire_all(fired);
        result
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let mut fired = Vec::new();
        let result = {
            let mut tree = self.store.lock();
            tree.delete(self.id, path, &mut fired)
        };
        fire_all(fired);
        result
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        let tree = self.store.lock();
        tree.check_session(self.id)?;
        tree.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> StoreResult<Vec<String>> {
        let mut tree = self.store.lock();
        tree.check_session(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let children = tree.children_of(path);
        if let Some(watcher) = watcher {
            tree.child_watches
                .entry(path.to_string())
                .or_default()
                .push((self.id, watcher));
        }
        Ok(children)
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        let mut tree = self.store.lock();
        if let Some(state) = tree.sessions.get_mut(&self.id) {
            state.listeners.push(Arc::from(listener));
        }
    }

    async fn close(&self) {
        let mut fired = Vec::new();
        let dropped = {
            let mut tree = self.store.lock();
            let Some(state) = tree.sessions.remove(&self.id) else {
                return;
            };
            let mut dropped: Vec<Watcher> = Vec::new();
            for watches in tree.child_watches.values_mut() {
                let (mine, others): (Vec<_>, Vec<_>) =
                    watches.drain(..).partition(|(owner, _)| *owner == self.id);
                *watches = others;
                dropped.extend(mine.into_iter().map(|(_, w)| w));
            }
            tree.child_watches.retain(|_, watches| !watches.is_empty());
            tree.remove_ephemerals(self.id, &mut fired);
            (state, dropped)
        };
        // 在锁外释放监听器与 watch，关闭它们持有的通知队列
        drop(dropped);
        fire_all(fired);
        info!(session = self.id, "Memory store session closed");
    }
}
