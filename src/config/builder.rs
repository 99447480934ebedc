use crate::error::Result;
use crate::registry::ProtocolRegistry;
use crate::selector::Strategy;

use super::{AppConfig, ChainConfig, DialConfig, HealthCheckSection, HopConfig, ServiceConfig};

/// AppConfig Builder
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    chains: Vec<ChainConfig>,
    services: Vec<ServiceConfig>,
    dial: DialConfig,
    health_check: HealthCheckSection,
}

impl AppConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加代理链
    pub fn chain(mut self, chain: ChainConfig) -> Self {
        self.chains.push(chain);
        self
    }

    /// 添加服务
    pub fn service(mut self, service: ServiceConfig) -> Self {
        self.services.push(service);
        self
    }

    /// 设置单跳超时（秒）
    pub fn hop_timeout(mut self, secs: u64) -> Self {
        self.dial.hop_timeout = secs;
        self
    }

    /// 设置转发空闲超时（秒）
    pub fn idle_timeout(mut self, secs: u64) -> Self {
        self.dial.idle_timeout = secs;
        self
    }

    /// 开关后台健康探测
    pub fn health_check(mut self, enabled: bool) -> Self {
        self.health_check.enabled = enabled;
        self
    }

    /// 构建但不校验
    pub fn into_config(self) -> AppConfig {
        AppConfig {
            chains: self.chains,
            services: self.services,
            dial: self.dial,
            health_check: self.health_check,
        }
    }

    /// 构建并校验
    pub fn build(self, registry: &ProtocolRegistry) -> Result<AppConfig> {
        let config = self.into_config();
        config.validate(registry)?;
        Ok(config)
    }
}

/// ChainConfig Builder
#[derive(Debug)]
pub struct ChainConfigBuilder {
    name: String,
    retries: usize,
    hops: Vec<HopConfig>,
}

impl ChainConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retries: 1,
            hops: Vec::new(),
        }
    }

    /// 设置重试次数
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// 追加一跳
    pub fn hop(mut self, hop: HopConfig) -> Self {
        self.hops.push(hop);
        self
    }

    /// 追加一个使用指定策略的多节点跳
    pub fn group(mut self, strategy: Strategy, nodes: &[&str]) -> Self {
        let mut hop = HopConfig::new(nodes.iter().map(|n| n.to_string()).collect());
        hop.strategy = strategy;
        self.hops.push(hop);
        self
    }

    pub fn build(self) -> ChainConfig {
        ChainConfig {
            name: self.name,
            retries: self.retries,
            hops: self.hops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_basic() {
        let config = AppConfigBuilder::new()
            .chain(
                ChainConfigBuilder::new("edge")
                    .retries(3)
                    .group(Strategy::Random, &["socks5://a:1080", "socks5://b:1080"])
                    .build(),
            )
            .service(ServiceConfig::new("in", "http://127.0.0.1:8080"))
            .hop_timeout(3)
            .idle_timeout(60)
            .health_check(false)
            .into_config();

        assert_eq!(config.chains[0].retries, 3);
        assert_eq!(config.chains[0].hops[0].strategy, Strategy::Random);
        assert_eq!(config.chains[0].hops[0].nodes.len(), 2);
        assert_eq!(config.dial.hop_timeout, 3);
        assert_eq!(config.dial.idle_timeout, 60);
        assert!(!config.health_check.enabled);
    }

    #[test]
    fn test_builder_validation_fails() {
        let registry = ProtocolRegistry::with_builtins();
        let result = AppConfigBuilder::new()
            .chain(ChainConfigBuilder::new("empty-hop").hop(HopConfig::new(Vec::new())).build())
            .build(&registry);
        assert!(result.unwrap_err().is_config_error());
    }

    #[test]
    fn test_builder_validation_passes() {
        let registry = ProtocolRegistry::with_builtins();
        let config = AppConfigBuilder::new()
            .service(ServiceConfig::new("fwd", "tcp://127.0.0.1:2222/10.0.0.5:22"))
            .build(&registry)
            .unwrap();
        assert_eq!(config.services.len(), 1);
    }
}
