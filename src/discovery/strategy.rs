//! 负载均衡策略
//!
//! 从某一时刻的实例列表快照中选出一个实例。空列表返回 `None`，不视为错误。

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::discovery::instance::ServiceInstance;
use crate::discovery::provider::InstanceProvider;
use crate::error::Result;

/// 实例选择策略 trait
#[async_trait]
pub trait ProviderStrategy: Send + Sync {
    /// 从实例来源中选出一个实例，仅供单次使用
    async fn get_instance(
        &self,
        provider: &dyn InstanceProvider,
    ) -> Result<Option<Arc<ServiceInstance>>>;
}

/// 随机选择
///
/// 随机源在构造时播种一次，之后由本策略独占。
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl RandomStrategy {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// 使用固定种子（可复现的选择序列）
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn next_index(&self, len: usize) -> usize {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(0..len)
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderStrategy for RandomStrategy {
    async fn get_instance(
        &self,
        provider: &dyn InstanceProvider,
    ) -> Result<Option<Arc<ServiceInstance>>> {
        let instances = provider.get_all_instances().await?;
        if instances.is_empty() {
            return Ok(None);
        }
        Ok(instances.get(self.next_index(instances.len())).cloned())
    }
}

/// 轮询选择
///
/// 计数器在所有调用间共享，每次调用先原子自增再取模。
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    index: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProviderStrategy for RoundRobinStrategy {
    async fn get_instance(
        &self,
        provider: &dyn InstanceProvider,
    ) -> Result<Option<Arc<ServiceInstance>>> {
        let instances = provider.get_all_instances().await?;
        if instances.is_empty() {
            return Ok(None);
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Ok(instances.get(index % instances.len()).cloned())
    }
}

/// 负载均衡策略（配置项）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// 随机
    #[default]
    Random,
    /// 轮询
    RoundRobin,
}

impl LoadBalanceStrategy {
    /// 构建对应的策略实例
    pub fn build(self) -> Arc<dyn ProviderStrategy> {
        match self {
            LoadBalanceStrategy::Random => Arc::new(RandomStrategy::new()),
            LoadBalanceStrategy::RoundRobin => Arc::new(RoundRobinStrategy::new()),
        }
    }
}

impl std::str::FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace("-", "_").as_str() {
            "random" => Ok(LoadBalanceStrategy::Random),
            "round_robin" | "roundrobin" => Ok(LoadBalanceStrategy::RoundRobin),
            _ => Err(format!("Unknown load balance strategy: {}", s)),
        }
    }
}
