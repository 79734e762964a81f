//! 协调存储工厂

use std::sync::Arc;
use tracing::info;

use super::CoordinationStore;
use super::memory::MemoryStore;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

/// 按配置创建存储会话
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>> {
    config.validate()?;
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-process memory store");
            Ok(Arc::new(MemoryStore::new().session()))
        }
        StoreBackend::Etcd => connect_etcd(config).await,
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>> {
    let store = super::etcd::EtcdStore::connect(config).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>> {
    Err(crate::error::DiscoveryError::config(
        "etcd backend requires the `etcd` feature",
    ))
}
