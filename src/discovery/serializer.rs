//! 实例编解码
//!
//! 线上格式为 JSON 对象，字段顺序固定：
//! `name, id, address, port, sslPort, payload, registrationTimeUTC, serviceType, uriSpec`。
//! 可选字段缺值时显式写出 `null`，`serviceType` 写作枚举名（`"DYNAMIC"` 等）。
//! 解码时必填字段缺失即失败；未知字段被忽略，便于集群滚动升级。
//!
//! `port` 和 `sslPort` 的取值范围是 `0..=65535`（`u16`）。其他进程写入负数或
//! 超出该范围的端口时，该节点解码失败，Tree Cache 会跳过它。

use crate::discovery::instance::ServiceInstance;
use crate::error::{DiscoveryError, Result};

/// 实例序列化 trait
pub trait InstanceSerializer: Send + Sync {
    fn serialize(&self, instance: &ServiceInstance) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<ServiceInstance>;
}

/// JSON 序列化实现
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonInstanceSerializer;

impl InstanceSerializer for JsonInstanceSerializer {
    fn serialize(&self, instance: &ServiceInstance) -> Result<Vec<u8>> {
        serde_json::to_vec(instance).map_err(DiscoveryError::Serialization)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<ServiceInstance> {
        serde_json::from_slice(bytes).map_err(DiscoveryError::Deserialization)
    }
}
