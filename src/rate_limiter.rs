//! 新连接速率限制
//!
//! 基于 governor 的令牌桶，服务在接受连接后检查，超出速率的连接直接关闭
use crate::error::{Result, TunnelError};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// 速率限制配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// 每秒允许的新连接数
    pub requests_per_second: u32,
    /// 突发容量
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

fn default_burst_size() -> u32 {
    200
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst_size: default_burst_size(),
        }
    }
}

/// 共享状态的速率限制器，克隆后共用同一个令牌桶
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    /// 速率或突发容量为 0 时返回配置错误
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        let rate = NonZeroU32::new(config.requests_per_second).ok_or_else(|| {
            TunnelError::config_error("rate_limit.requests_per_second must be greater than 0")
        })?;
        let burst = NonZeroU32::new(config.burst_size).ok_or_else(|| {
            TunnelError::config_error("rate_limit.burst_size must be greater than 0")
        })?;

        Ok(Self {
            inner: Arc::new(GovernorLimiter::direct(
                Quota::per_second(rate).allow_burst(burst),
            )),
            config,
        })
    }

    /// 非阻塞地获取一个令牌，失败时返回还需等待的时间
    pub fn check(&self) -> std::result::Result<(), Duration> {
        self.inner
            .check()
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }

    /// 等待直到获得令牌
    pub async fn wait(&self) {
        while let Err(wait_time) = self.check() {
            tokio::time::sleep(wait_time).await;
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}
