// 配置管理模块

mod builder;
mod validator;

pub use builder::{AppConfigBuilder, ChainConfigBuilder};
pub use validator::ConfigValidator;

use crate::error::{Result, TunnelError};
use crate::node::NodeSpec;
use crate::rate_limiter::RateLimiterConfig;
use crate::registry::ProtocolRegistry;
use crate::selector::{FailPolicy, Strategy};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 代理链列表
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    /// 入站服务列表
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    /// 拨号参数
    #[serde(default)]
    pub dial: DialConfig,
    /// 后台健康探测
    #[serde(default)]
    pub health_check: HealthCheckSection,
}

/// 代理链配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// 链名称（服务通过名称引用）
    pub name: String,
    /// 作为路由候选时每次请求的尝试次数
    #[serde(default = "default_retries")]
    pub retries: usize,
    /// 按顺序排列的跳（每跳一个节点组）
    #[serde(default)]
    pub hops: Vec<HopConfig>,
}

/// 单跳（节点组）配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopConfig {
    /// 节点组名称（可选，默认 `<chain>#<index>`）
    #[serde(default)]
    pub name: Option<String>,
    /// 选择策略：round | random | fifo
    #[serde(default)]
    pub strategy: Strategy,
    /// 连续失败多少次后标记失效
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    /// 失效冷却时间（秒）
    #[serde(default = "default_fail_timeout")]
    pub fail_timeout: u64,
    /// 全部节点失效时是否仍然在所有节点中选择
    #[serde(default = "default_true")]
    pub fail_open: bool,
    /// 节点地址列表
    pub nodes: Vec<String>,
    /// 应用到本跳每个节点的旁路规则
    #[serde(default)]
    pub bypass: Vec<String>,
}

impl HopConfig {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            name: None,
            strategy: Strategy::default(),
            max_fails: default_max_fails(),
            fail_timeout: default_fail_timeout(),
            fail_open: true,
            nodes,
            bypass: Vec::new(),
        }
    }

    /// 由单个节点地址构造一跳，节点的 `max_fails` / `fail_timeout` 参数作用于该跳
    pub fn from_node(node: &str) -> Result<Self> {
        let spec = NodeSpec::parse(node)?;
        let mut hop = Self::new(vec![node.to_string()]);
        if let Some(max_fails) = spec.param_parse::<u32>("max_fails")? {
            hop.max_fails = max_fails;
        }
        if let Some(fail_timeout) = spec.param_parse::<u64>("fail_timeout")? {
            hop.fail_timeout = fail_timeout;
        }
        Ok(hop)
    }

    pub fn fail_policy(&self) -> FailPolicy {
        FailPolicy {
            max_fails: self.max_fails,
            fail_timeout: Duration::from_secs(self.fail_timeout),
            fail_open: self.fail_open,
        }
    }
}

/// 入站服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 服务名称
    pub name: String,
    /// 监听地址，如 `socks5://127.0.0.1:1080`、`http://:8080`、`tcp://:2222/10.0.0.5:22`
    pub listen: String,
    /// 候选链名称，为空表示直连
    #[serde(default)]
    pub chains: Vec<String>,
    /// 候选链选择策略
    #[serde(default)]
    pub chain_strategy: Strategy,
    /// 每条候选链的尝试次数，0 表示使用链自身的 retries
    #[serde(default)]
    pub retries: usize,
    /// 直连的目的地址规则
    #[serde(default)]
    pub bypass: Vec<String>,
    /// 新连接速率限制（可选）
    #[serde(default)]
    pub rate_limit: Option<RateLimiterConfig>,
    /// 最大并发连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, listen: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen: listen.into(),
            chains: Vec::new(),
            chain_strategy: Strategy::default(),
            retries: 0,
            bypass: Vec::new(),
            rate_limit: None,
            max_connections: default_max_connections(),
        }
    }
}

/// 拨号参数（秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialConfig {
    /// 单跳传输拨号 / 握手超时
    #[serde(default = "default_hop_timeout")]
    pub hop_timeout: u64,
    /// 转发空闲超时
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// 入站协议解析超时
    #[serde(default = "default_parse_timeout")]
    pub parse_timeout: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            hop_timeout: default_hop_timeout(),
            idle_timeout: default_idle_timeout(),
            parse_timeout: default_parse_timeout(),
        }
    }
}

/// 健康探测配置（秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
        }
    }
}

fn default_retries() -> usize {
    1
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    1000
}

fn default_hop_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_parse_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    3
}

impl AppConfig {
    /// 创建 Builder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::new()
    }

    /// 解析 TOML 文本
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse configuration")
    }

    /// 从文件加载（支持 `~` 展开），不做校验
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = expand_path(path.as_ref())?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// 由命令行 `-L` / `-F` 构造配置
    ///
    /// 每个 `-L` 是一个服务；所有 `-F` 依次组成名为 `default` 的链，每个 `-F` 单独一跳
    pub fn from_args(listen: &[String], forward: &[String]) -> Result<Self> {
        let mut builder = AppConfig::builder();

        if !forward.is_empty() {
            let mut chain = ChainConfigBuilder::new("default");
            for node in forward {
                chain = chain.hop(HopConfig::from_node(node)?);
            }
            builder = builder.chain(chain.build());
        }

        for (i, listen) in listen.iter().enumerate() {
            let mut service = ServiceConfig::new(format!("service-{}", i + 1), listen.clone());
            if !forward.is_empty() {
                service.chains = vec!["default".to_string()];
            }
            builder = builder.service(service);
        }

        Ok(builder.into_config())
    }

    /// 校验配置，违规项作为配置错误返回
    pub fn validate(&self, registry: &ProtocolRegistry) -> Result<()> {
        ConfigValidator::validate_app_config(self, registry)
            .map_err(|e| TunnelError::config_error(format!("{:#}", e)))
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }
}

/// 展开配置路径中的 `~` 与环境变量
pub fn expand_path(path: &Path) -> anyhow::Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand config path {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
