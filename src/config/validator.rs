use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use tracing::warn;

use super::{AppConfig, ChainConfig, DialConfig, HopConfig, ServiceConfig};
use crate::bypass::Bypass;
use crate::node::NodeSpec;
use crate::rate_limiter::RateLimiterConfig;
use crate::registry::ProtocolRegistry;
use crate::service::ServiceKind;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证旁路规则
    pub fn validate_bypass(rules: &[String], context: &str) -> Result<()> {
        Bypass::parse(rules).with_context(|| format!("{}: invalid bypass rule", context))?;
        Ok(())
    }

    /// 验证链节点地址及其协议是否已注册
    pub fn validate_node(node: &str, registry: &ProtocolRegistry, context: &str) -> Result<()> {
        let spec =
            NodeSpec::parse(node).with_context(|| format!("{}: invalid node '{}'", context, node))?;
        Self::validate_port(spec.port, context)?;

        if !registry.has_connector(&spec.protocol) {
            bail!("{}: unknown connector protocol '{}'", context, spec.protocol);
        }
        if !registry.has_transporter(&spec.transport) {
            bail!("{}: unknown transport '{}'", context, spec.transport);
        }
        spec.param_parse::<i32>("priority")
            .with_context(|| context.to_string())?;
        if let Some(rules) = spec.param("bypass") {
            let rules: Vec<String> = rules.split(',').map(str::to_string).collect();
            Self::validate_bypass(&rules, context)?;
        }
        Ok(())
    }

    /// 验证单跳配置
    pub fn validate_hop(hop: &HopConfig, registry: &ProtocolRegistry, context: &str) -> Result<()> {
        if hop.nodes.is_empty() {
            bail!("{}: node list cannot be empty", context);
        }
        for node in &hop.nodes {
            Self::validate_node(node, registry, context)?;
        }
        Self::validate_bypass(&hop.bypass, context)?;
        if hop.max_fails > 0 && hop.fail_timeout == 0 {
            warn!(
                "{}: fail_timeout is 0, failed nodes will be retried immediately",
                context
            );
        }
        Ok(())
    }

    /// 验证链配置
    pub fn validate_chain(chain: &ChainConfig, registry: &ProtocolRegistry) -> Result<()> {
        Self::validate_name(&chain.name, "Chain")?;
        if chain.retries == 0 {
            bail!("Chain '{}': retries must be at least 1", chain.name);
        }
        if chain.hops.is_empty() {
            warn!("Chain '{}' has no hops, it will dial directly", chain.name);
        }
        for (i, hop) in chain.hops.iter().enumerate() {
            Self::validate_hop(
                hop,
                registry,
                &format!("Chain '{}' hop {}", chain.name, i + 1),
            )?;
        }
        Ok(())
    }

    /// 验证服务配置
    pub fn validate_service(service: &ServiceConfig, chains: &HashSet<&str>) -> Result<()> {
        Self::validate_name(&service.name, "Service")?;
        let context = format!("Service '{}'", service.name);

        let spec = NodeSpec::parse(&service.listen)
            .with_context(|| format!("{}: invalid listen address '{}'", context, service.listen))?;
        Self::validate_port(spec.port, &context)?;
        ServiceKind::from_spec(&spec).with_context(|| context.clone())?;

        for chain in &service.chains {
            if !chains.contains(chain.as_str()) {
                bail!("{}: unknown chain '{}'", context, chain);
            }
        }
        Self::validate_bypass(&service.bypass, &context)?;

        if service.max_connections == 0 {
            bail!("{}: max_connections must be greater than 0", context);
        }
        if let Some(ref rate_limit) = service.rate_limit {
            Self::validate_rate_limit_config(rate_limit)
                .with_context(|| context.clone())?;
        }
        Ok(())
    }

    /// 验证速率限制配置
    pub fn validate_rate_limit_config(config: &RateLimiterConfig) -> Result<()> {
        if config.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than 0");
        }
        if config.burst_size == 0 {
            bail!("rate_limit.burst_size must be greater than 0");
        }
        if config.burst_size < config.requests_per_second {
            warn!(
                "rate_limit.burst_size ({}) is less than requests_per_second ({}), \
                 this may cause frequent rate limiting",
                config.burst_size, config.requests_per_second
            );
        }
        Ok(())
    }

    /// 验证拨号参数
    pub fn validate_dial_config(config: &DialConfig) -> Result<()> {
        if config.hop_timeout == 0 {
            bail!("dial.hop_timeout must be greater than 0");
        }
        if config.idle_timeout == 0 {
            bail!("dial.idle_timeout must be greater than 0");
        }
        if config.parse_timeout == 0 {
            bail!("dial.parse_timeout must be greater than 0");
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_app_config(config: &AppConfig, registry: &ProtocolRegistry) -> Result<()> {
        let mut chain_names = HashSet::new();
        for chain in &config.chains {
            if !chain_names.insert(chain.name.as_str()) {
                bail!("Duplicate chain name '{}'", chain.name);
            }
            Self::validate_chain(chain, registry)?;
        }

        let mut service_names = HashSet::new();
        let mut listen_addrs = HashSet::new();
        for service in &config.services {
            if !service_names.insert(service.name.as_str()) {
                bail!("Duplicate service name '{}'", service.name);
            }
            Self::validate_service(service, &chain_names)?;
            if let Ok(spec) = NodeSpec::parse(&service.listen) {
                if !listen_addrs.insert(spec.addr()) {
                    bail!(
                        "Service '{}': listen address {} is already used",
                        service.name,
                        spec.addr()
                    );
                }
            }
        }

        if config.services.is_empty() {
            warn!("No services configured");
        }

        Self::validate_dial_config(&config.dial)?;
        if config.health_check.enabled && config.health_check.interval == 0 {
            bail!("health_check.interval must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfigBuilder;

    fn registry() -> ProtocolRegistry {
        ProtocolRegistry::with_builtins()
    }

    fn base() -> AppConfig {
        AppConfig::builder()
            .chain(
                ChainConfigBuilder::new("main")
                    .hop(HopConfig::new(vec!["socks5://10.0.0.1:1080".into()]))
                    .build(),
            )
            .service({
                let mut s = ServiceConfig::new("in", "socks5://127.0.0.1:1080");
                s.chains = vec!["main".into()];
                s
            })
            .into_config()
    }

    fn error_of(config: &AppConfig) -> String {
        format!(
            "{:#}",
            ConfigValidator::validate_app_config(config, &registry()).unwrap_err()
        )
    }

    #[test]
    fn test_valid_config() {
        assert!(ConfigValidator::validate_app_config(&base(), &registry()).is_ok());
    }

    #[test]
    fn test_empty_hop_rejected() {
        let mut config = base();
        config.chains[0].hops[0].nodes.clear();
        assert!(error_of(&config).contains("node list cannot be empty"));
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let mut config = base();
        config.chains[0].hops[0].nodes = vec!["quic://10.0.0.1:443".into()];
        assert!(error_of(&config).contains("unknown connector protocol 'quic'"));

        let mut config = base();
        config.chains[0].hops[0].nodes = vec!["socks5+kcp://10.0.0.1:443".into()];
        assert!(error_of(&config).contains("unknown transport 'kcp'"));
    }

    #[test]
    fn test_duplicate_chain_rejected() {
        let mut config = base();
        config.chains.push(config.chains[0].clone());
        assert!(error_of(&config).contains("Duplicate chain name 'main'"));
    }

    #[test]
    fn test_unknown_chain_reference() {
        let mut config = base();
        config.services[0].chains = vec!["missing".into()];
        assert!(error_of(&config).contains("unknown chain 'missing'"));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = base();
        config.chains[0].hops[0].nodes = vec!["socks5://10.0.0.1:0".into()];
        assert!(error_of(&config).contains("port cannot be 0"));
    }

    #[test]
    fn test_empty_names_rejected() {
        let mut config = base();
        config.services[0].name = " ".into();
        assert!(error_of(&config).contains("name cannot be empty"));

        let mut config = base();
        config.chains[0].name.clear();
        config.services[0].chains.clear();
        assert!(error_of(&config).contains("name cannot be empty"));
    }

    #[test]
    fn test_invalid_bypass_rejected() {
        let mut config = base();
        config.services[0].bypass = vec!["10.0.0.0/40".into()];
        assert!(error_of(&config).contains("invalid bypass rule"));

        let mut config = base();
        config.chains[0].hops[0].bypass = vec!["!".into()];
        assert!(error_of(&config).contains("invalid bypass rule"));
    }

    #[test]
    fn test_listen_kind_checks() {
        let mut config = base();
        config.services[0].listen = "tcp://:2222".into();
        assert!(error_of(&config).contains("remote"));

        let mut config = base();
        config.services[0].listen = "socks4://:1080".into();
        assert!(ConfigValidator::validate_app_config(&config, &registry()).is_err());
    }

    #[test]
    fn test_duplicate_listen_rejected() {
        let mut config = base();
        let mut second = config.services[0].clone();
        second.name = "other".into();
        config.services.push(second);
        assert!(error_of(&config).contains("already used"));
    }

    #[test]
    fn test_rate_limit_and_dial_checks() {
        let mut config = base();
        config.services[0].rate_limit = Some(RateLimiterConfig {
            requests_per_second: 0,
            burst_size: 1,
        });
        assert!(error_of(&config).contains("requests_per_second"));

        let mut config = base();
        config.dial.hop_timeout = 0;
        assert!(error_of(&config).contains("hop_timeout"));
    }

    #[test]
    fn test_app_config_validate_maps_to_config_error() {
        let mut config = base();
        config.chains[0].hops[0].nodes.clear();
        let err = config.validate(&registry()).unwrap_err();
        assert!(err.is_config_error());
    }
}
