//! 运行时快照与热加载
//!
//! 配置被构建成不可变的 [`Snapshot`]，通过 [`ConfigHandle`] 整体替换。
//! 新连接使用替换后的快照，已在转发中的连接继续持有旧快照直到结束。

use crate::bypass::Bypass;
use crate::chain::{Chain, ChainDialer};
use crate::config::{AppConfig, HopConfig};
use crate::error::{Result, TunnelError};
use crate::group::NodeGroup;
use crate::health::{HealthCheckConfig, HealthChecker};
use crate::node::{Node, NodeSpec};
use crate::registry::ProtocolRegistry;
use crate::route::Route;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 某一代配置构建出的运行时对象
pub struct Snapshot {
    generation: u64,
    config: AppConfig,
    routes: HashMap<String, Arc<Route>>,
    dialer: ChainDialer,
    groups: Vec<Arc<NodeGroup>>,
    /// 各条链的第一跳，本机可直接探测
    entry_groups: Vec<Arc<NodeGroup>>,
    retired: CancellationToken,
}

impl Snapshot {
    /// 由配置构建快照
    pub fn build(config: &AppConfig, registry: &ProtocolRegistry, generation: u64) -> Result<Self> {
        let mut chains = HashMap::new();
        let mut groups = Vec::new();
        let mut entry_groups = Vec::new();

        for chain_config in &config.chains {
            let mut chain_groups = Vec::with_capacity(chain_config.hops.len());
            for (i, hop) in chain_config.hops.iter().enumerate() {
                let name = hop
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}#{}", chain_config.name, i + 1));
                let group = Arc::new(build_group(&name, hop, registry)?);
                if i == 0 {
                    entry_groups.push(group.clone());
                }
                groups.push(group.clone());
                chain_groups.push(group);
            }
            let chain = Chain::new(chain_config.name.clone(), chain_groups)
                .with_retries(chain_config.retries);
            chains.insert(chain_config.name.clone(), Arc::new(chain));
        }

        let mut routes = HashMap::new();
        for service in &config.services {
            let candidates = service
                .chains
                .iter()
                .map(|name| {
                    chains.get(name).cloned().ok_or_else(|| {
                        TunnelError::config_error(format!(
                            "Service '{}' references unknown chain '{}'",
                            service.name, name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let route = Route::new(service.name.clone(), candidates)
                .with_strategy(service.chain_strategy)
                .with_bypass(Bypass::parse(&service.bypass)?)
                .with_retries(service.retries);
            routes.insert(service.name.clone(), Arc::new(route));
        }

        Ok(Self {
            generation,
            config: config.clone(),
            routes,
            dialer: ChainDialer::new(Duration::from_secs(config.dial.hop_timeout)),
            groups,
            entry_groups,
            retired: CancellationToken::new(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 服务对应的路由
    pub fn route(&self, service: &str) -> Option<Arc<Route>> {
        self.routes.get(service).cloned()
    }

    pub fn dialer(&self) -> &ChainDialer {
        &self.dialer
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.dial.idle_timeout)
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_secs(self.config.dial.parse_timeout)
    }

    pub fn groups(&self) -> &[Arc<NodeGroup>] {
        &self.groups
    }

    /// 每条链的第一跳节点组
    pub fn entry_groups(&self) -> &[Arc<NodeGroup>] {
        &self.entry_groups
    }

    /// 按配置启动健康探测，快照被替换后自动停止
    ///
    /// 后续跳只能经由前一跳到达，只靠拨号结果和冷却期维护
    pub fn spawn_health_checker(&self) -> Option<tokio::task::JoinHandle<()>> {
        let section = self.config.health_check;
        if !section.enabled || self.entry_groups.is_empty() {
            return None;
        }
        let config = HealthCheckConfig {
            interval: Duration::from_secs(section.interval),
            timeout: Duration::from_secs(section.timeout),
        };
        let checker =
            HealthChecker::new(self.entry_groups.clone(), config, self.retired.child_token());
        Some(checker.spawn())
    }

    /// 标记快照已被替换
    fn retire(&self) {
        self.retired.cancel();
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.retired.cancel();
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("generation", &self.generation)
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("groups", &self.groups.len())
            .finish()
    }
}

/// 构建节点组；本跳的旁路规则附加到没有自带规则的节点上
fn build_group(name: &str, hop: &HopConfig, registry: &ProtocolRegistry) -> Result<NodeGroup> {
    let hop_bypass = if hop.bypass.is_empty() {
        None
    } else {
        Some(Arc::new(Bypass::parse(&hop.bypass)?))
    };

    let nodes = hop
        .nodes
        .iter()
        .map(|raw| {
            let spec = NodeSpec::parse(raw)?;
            let mut node = Node::from_spec(&spec, registry)?;
            if node.bypass.is_none() {
                node.bypass = hop_bypass.clone();
            }
            Ok(node)
        })
        .collect::<Result<Vec<_>>>()?;

    NodeGroup::new(name, nodes, hop.strategy, hop.fail_policy())
}

/// 当前生效快照的句柄，克隆后共享
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<Snapshot>>>,
}

impl ConfigHandle {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// 获取当前快照
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// 原子替换快照，返回旧快照
    pub fn swap(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let new = Arc::new(snapshot);
        let old = std::mem::replace(&mut *self.current.write(), new);
        old.retire();
        old
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("generation", &self.generation())
            .finish()
    }
}

/// 轮询配置文件修改时间的热加载器
pub struct Reloader {
    path: PathBuf,
    handle: ConfigHandle,
    registry: Arc<ProtocolRegistry>,
    interval: Duration,
    last_modified: Option<SystemTime>,
}

impl Reloader {
    pub fn new(
        path: impl Into<PathBuf>,
        handle: ConfigHandle,
        registry: Arc<ProtocolRegistry>,
        interval: Duration,
    ) -> Self {
        let path = path.into();
        let last_modified = modified_time(&path);
        Self {
            path,
            handle,
            registry,
            interval,
            last_modified,
        }
    }

    /// 重新加载配置并替换快照，失败时保留当前快照
    pub fn reload(&self) -> Result<u64> {
        let config = AppConfig::load(&self.path)?;
        config.validate(&self.registry)?;

        let current = self.handle.load();
        if listeners(current.config()) != listeners(&config) {
            warn!(
                "Service listeners changed in {}; restart to apply listener changes",
                self.path.display()
            );
        }

        let generation = current.generation() + 1;
        drop(current);
        let snapshot = Snapshot::build(&config, &self.registry, generation)?;
        snapshot.spawn_health_checker();
        self.handle.swap(snapshot);
        Ok(generation)
    }

    /// 文件修改时间变化时重新加载
    pub fn poll(&mut self) -> Option<Result<u64>> {
        let modified = modified_time(&self.path);
        if modified.is_none() || modified == self.last_modified {
            return None;
        }
        self.last_modified = modified;
        Some(self.reload())
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;
        info!(
            "Watching {} for changes every {:?}",
            self.path.display(),
            self.interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Config reloader stopped");
                    break;
                }
                _ = interval.tick() => {
                    match self.poll() {
                        Some(Ok(generation)) => {
                            info!("Configuration reloaded (generation {})", generation);
                        }
                        Some(Err(e)) => {
                            error!("Failed to reload configuration, keeping previous: {}", e);
                        }
                        None => {}
                    }
                }
            }
        }
    }
}

fn modified_time(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn listeners(config: &AppConfig) -> Vec<(&str, &str)> {
    let mut listeners: Vec<_> = config
        .services
        .iter()
        .map(|s| (s.name.as_str(), s.listen.as_str()))
        .collect();
    listeners.sort();
    listeners
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainConfigBuilder, ServiceConfig};

    fn sample_config(node: &str) -> AppConfig {
        let mut service = ServiceConfig::new("in", "socks5://127.0.0.1:1080");
        service.chains = vec!["main".into()];
        service.bypass = vec!["*.local".into()];
        AppConfig::builder()
            .chain(
                ChainConfigBuilder::new("main")
                    .hop(HopConfig::new(vec![node.to_string()]))
                    .build(),
            )
            .service(service)
            .health_check(false)
            .into_config()
    }

    #[test]
    fn test_build_snapshot() {
        let registry = ProtocolRegistry::with_builtins();
        let snapshot =
            Snapshot::build(&sample_config("socks5://10.0.0.1:1080"), &registry, 1).unwrap();

        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.groups().len(), 1);
        assert_eq!(snapshot.groups()[0].name(), "main#1");
        let route = snapshot.route("in").unwrap();
        assert_eq!(route.chains().len(), 1);
        assert!(route.bypass().matches("printer.local:631"));
        assert!(snapshot.route("missing").is_none());
    }

    #[test]
    fn test_only_first_hops_are_health_checked() {
        let registry = ProtocolRegistry::with_builtins();
        let mut config = sample_config("socks5://10.0.0.1:1080");
        config.chains[0]
            .hops
            .push(HopConfig::new(vec!["http://192.0.2.1:3128".into()]));

        let snapshot = Snapshot::build(&config, &registry, 1).unwrap();
        assert_eq!(snapshot.groups().len(), 2);
        assert_eq!(snapshot.entry_groups().len(), 1);
        assert_eq!(snapshot.entry_groups()[0].name(), "main#1");
    }

    #[test]
    fn test_hop_bypass_applies_to_nodes() {
        let registry = ProtocolRegistry::with_builtins();
        let mut config = sample_config("socks5://10.0.0.1:1080");
        config.chains[0].hops[0].bypass = vec!["10.0.0.0/8".into()];
        config.chains[0].hops[0]
            .nodes
            .push("http://10.0.0.2:3128?bypass=*.corp".into());

        let snapshot = Snapshot::build(&config, &registry, 1).unwrap();
        let nodes = snapshot.groups()[0].nodes();
        assert!(nodes[0].bypasses("10.1.1.1:80"));
        // 节点自带的规则优先
        assert!(!nodes[1].bypasses("10.1.1.1:80"));
        assert!(nodes[1].bypasses("git.corp:22"));
    }

    #[test]
    fn test_build_unknown_protocol_fails() {
        let registry = ProtocolRegistry::with_builtins();
        let err =
            Snapshot::build(&sample_config("quic://10.0.0.1:443"), &registry, 1).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_swap_keeps_old_snapshot_alive() {
        let registry = ProtocolRegistry::with_builtins();
        let handle = ConfigHandle::new(
            Snapshot::build(&sample_config("socks5://10.0.0.1:1080"), &registry, 1).unwrap(),
        );

        let in_flight = handle.load();
        let old = handle.swap(
            Snapshot::build(&sample_config("socks5://10.0.0.9:1080"), &registry, 2).unwrap(),
        );

        assert_eq!(handle.generation(), 2);
        assert_eq!(in_flight.generation(), 1);
        assert!(Arc::ptr_eq(&in_flight, &old));
        assert!(old.retired.is_cancelled());
        assert_eq!(in_flight.groups()[0].nodes()[0].addr, "10.0.0.1:1080");
        assert_eq!(handle.load().groups()[0].nodes()[0].addr, "10.0.0.9:1080");
    }

    #[tokio::test]
    async fn test_reloader_keeps_previous_on_error() {
        let registry = Arc::new(ProtocolRegistry::with_builtins());
        let path = std::env::temp_dir()
            .join(format!("chain-tunnel-reload-{}.toml", uuid::Uuid::new_v4()));
        let config = sample_config("socks5://10.0.0.1:1080");
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let handle = ConfigHandle::new(Snapshot::build(&config, &registry, 1).unwrap());
        let reloader = Reloader::new(&path, handle.clone(), registry, Duration::from_secs(1));

        std::fs::write(&path, toml::to_string(&sample_config("socks5://10.0.0.2:1080")).unwrap())
            .unwrap();
        assert_eq!(reloader.reload().unwrap(), 2);
        assert_eq!(handle.load().groups()[0].nodes()[0].addr, "10.0.0.2:1080");

        let empty_hop = "[[chains]]\nname = \"main\"\n[[chains.hops]]\nnodes = []\n";
        std::fs::write(&path, empty_hop).unwrap();
        assert!(reloader.reload().is_err());
        assert_eq!(handle.generation(), 2);

        std::fs::remove_file(&path).unwrap();
    }
}
