//! 集成测试公共工具

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use zk_discovery::{DiscoveryConfig, MemoryStore, ServiceDiscovery};

pub const BASE_PATH: &str = "/test/services";

/// 轮询等待的上限
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// 在同一个内存存储上打开新会话并创建服务发现
pub fn discovery_on(store: &MemoryStore) -> ServiceDiscovery {
    let session = Arc::new(store.session());
    ServiceDiscovery::new(session, DiscoveryConfig::new(BASE_PATH)).expect("valid config")
}

/// 等待某个服务的缓存实例数变为 `expected`
pub async fn wait_for_instances(discovery: &ServiceDiscovery, name: &str, expected: usize) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if discovery.instances(name).await.len() == expected {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// 等待计数器达到 `expected`
pub async fn wait_for_count(counter: &std::sync::atomic::AtomicUsize, expected: usize) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if counter.load(std::sync::atomic::Ordering::SeqCst) >= expected {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// 等待某个服务出现在（或离开）缓存的服务名集合中
pub async fn wait_for_service(discovery: &ServiceDiscovery, name: &str, present: bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if discovery.service_names().await.iter().any(|n| n == name) == present {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// 等待某个服务进入（或离开）实例列表监听集合
pub async fn wait_for_watching(discovery: &ServiceDiscovery, name: &str, watching: bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if discovery.watching().await.iter().any(|n| n == name) == watching {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
