//! 服务实例定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 服务实例类型
///
/// `Dynamic` 实例注册为临时节点，随会话结束自动消失；其余类型注册为持久节点。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    #[default]
    Dynamic,
    Static,
    Permanent,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Dynamic => "DYNAMIC",
            ServiceType::Static => "STATIC",
            ServiceType::Permanent => "PERMANENT",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务实例
///
/// `id` 同时作为存储中的子节点名，一经分配不可变更；
/// 同一服务的两个实例不能共享 `id`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    /// 服务名
    pub name: String,

    /// 实例 ID（唯一标识）
    pub id: String,

    /// 主机地址
    pub address: String,

    pub port: Option<u16>,

    #[serde(rename = "sslPort")]
    pub ssl_port: Option<u16>,

    /// 调用方自定义的元数据
    pub payload: Option<String>,

    /// 注册时间（UTC 毫秒）
    #[serde(rename = "registrationTimeUTC")]
    pub registration_time_utc: i64,

    #[serde(rename = "serviceType")]
    pub service_type: ServiceType,

    /// 预留字段，目前总是为空
    #[serde(rename = "uriSpec")]
    pub uri_spec: Option<String>,
}

impl ServiceInstance {
    /// 创建新的服务实例，自动生成 ID 与注册时间
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        port: Option<u16>,
        ssl_port: Option<u16>,
        payload: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: uuid::Uuid::new_v4().to_string(),
            address: address.into(),
            port,
            ssl_port,
            payload,
            registration_time_utc: chrono::Utc::now().timestamp_millis(),
            service_type: ServiceType::Dynamic,
            uri_spec: None,
        }
    }

    /// 只有地址和端口的动态实例
    pub fn new_simple(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self::new(name, address, Some(port), None, None)
    }

    /// 使用调用方指定的 ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 设置实例类型
    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_ssl_port(mut self, ssl_port: u16) -> Self {
        self.ssl_port = Some(ssl_port);
        self
    }

    /// `address:port`，没有端口时只返回地址
    pub fn spec(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.address, port),
            None => self.address.clone(),
        }
    }

    /// 是否注册为临时节点
    pub fn is_ephemeral(&self) -> bool {
        self.service_type == ServiceType::Dynamic
    }
}
