//! 协议注册表
//!
//! 按名称查找构建 Connector / Transporter 的工厂函数。
//! 注册表在启动时构建一次，之后只读，作为显式参数传给构建节点的代码。

use crate::connector::{
    Connector, ForwardConnector, HttpConnector, Socks4Connector, Socks5Connector,
};
use crate::error::{Result, TunnelError};
use crate::node::NodeSpec;
use crate::tls::{self, TlsOptions};
use crate::transport::{MuxTransporter, TcpTransporter, TlsTransporter, Transporter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

pub type ConnectorFactory =
    Arc<dyn Fn(&NodeSpec) -> anyhow::Result<Arc<dyn Connector>> + Send + Sync>;
pub type TransporterFactory =
    Arc<dyn Fn(&NodeSpec) -> anyhow::Result<Arc<dyn Transporter>> + Send + Sync>;

/// 同名重复注册时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterPolicy {
    /// 返回 DuplicateProtocol 错误
    #[default]
    Reject,
    /// 覆盖已有注册
    Overwrite,
}

/// 协议注册表
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    policy: RegisterPolicy,
    connectors: HashMap<String, ConnectorFactory>,
    transporters: HashMap<String, TransporterFactory>,
}

impl ProtocolRegistry {
    /// 创建空注册表
    pub fn new(policy: RegisterPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// 注册内置协议
    pub fn with_builtins() -> Self {
        let mut registry = Self::new(RegisterPolicy::Reject);
        registry.register_builtins();
        registry
    }

    pub fn policy(&self) -> RegisterPolicy {
        self.policy
    }

    pub fn register_connector<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&NodeSpec) -> anyhow::Result<Arc<dyn Connector>> + Send + Sync + 'static,
    {
        insert(
            &mut self.connectors,
            self.policy,
            "connector",
            name,
            Arc::new(factory),
        )
    }

    pub fn register_transporter<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&NodeSpec) -> anyhow::Result<Arc<dyn Transporter>> + Send + Sync + 'static,
    {
        insert(
            &mut self.transporters,
            self.policy,
            "transporter",
            name,
            Arc::new(factory),
        )
    }

    pub fn connector(&self, name: &str) -> Result<&ConnectorFactory> {
        self.connectors
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| TunnelError::UnknownProtocol {
                kind: "connector",
                name: name.to_string(),
            })
    }

    pub fn transporter(&self, name: &str) -> Result<&TransporterFactory> {
        self.transporters
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| TunnelError::UnknownProtocol {
                kind: "transporter",
                name: name.to_string(),
            })
    }

    pub fn has_connector(&self, name: &str) -> bool {
        self.connectors.contains_key(&name.to_ascii_lowercase())
    }

    pub fn has_transporter(&self, name: &str) -> bool {
        self.transporters.contains_key(&name.to_ascii_lowercase())
    }

    /// 按节点描述构建 Connector
    pub fn build_connector(&self, spec: &NodeSpec) -> Result<Arc<dyn Connector>> {
        let factory = self.connector(&spec.protocol)?;
        factory(spec).map_err(|e| {
            let reason = format!("Failed to build connector for '{}': {:#}", spec.raw, e);
            TunnelError::config_error(reason)
        })
    }

    /// 按节点描述构建 Transporter
    pub fn build_transporter(&self, spec: &NodeSpec) -> Result<Arc<dyn Transporter>> {
        let factory = self.transporter(&spec.transport)?;
        factory(spec).map_err(|e| {
            TunnelError::config_error(format!(
                "Failed to build transporter for '{}': {:#}",
                spec.raw, e
            ))
        })
    }

    fn register_builtins(&mut self) {
        let connectors: [(&str, ConnectorFactory); 8] = [
            ("http", Arc::new(http_connector)),
            ("socks5", Arc::new(socks5_connector)),
            ("socks", Arc::new(socks5_connector)),
            ("socks4", Arc::new(socks4_connector)),
            ("socks4a", Arc::new(socks4a_connector)),
            ("forward", Arc::new(forward_connector)),
            ("direct", Arc::new(forward_connector)),
            ("tcp", Arc::new(forward_connector)),
        ];
        for (name, factory) in connectors {
            self.connectors.insert(name.to_string(), factory);
        }

        let transporters: [(&str, TransporterFactory); 4] = [
            ("tcp", Arc::new(tcp_transporter)),
            ("tls", Arc::new(tls_transporter)),
            ("mtcp", Arc::new(mtcp_transporter)),
            ("mtls", Arc::new(mtls_transporter)),
        ];
        for (name, factory) in transporters {
            self.transporters.insert(name.to_string(), factory);
        }
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut connectors: Vec<_> = self.connectors.keys().collect();
        let mut transporters: Vec<_> = self.transporters.keys().collect();
        connectors.sort();
        transporters.sort();
        f.debug_struct("ProtocolRegistry")
            .field("policy", &self.policy)
            .field("connectors", &connectors)
            .field("transporters", &transporters)
            .finish()
    }
}

fn insert<V>(
    map: &mut HashMap<String, V>,
    policy: RegisterPolicy,
    kind: &'static str,
    name: &str,
    value: V,
) -> Result<()> {
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(TunnelError::config_error(format!("Empty {} protocol name", kind)));
    }
    if policy == RegisterPolicy::Reject && map.contains_key(&name) {
        return Err(TunnelError::DuplicateProtocol { kind, name });
    }
    map.insert(name, value);
    Ok(())
}

fn http_connector(spec: &NodeSpec) -> anyhow::Result<Arc<dyn Connector>> {
    Ok(Arc::new(HttpConnector::new(spec.auth.clone())))
}

fn socks5_connector(spec: &NodeSpec) -> anyhow::Result<Arc<dyn Connector>> {
    Ok(Arc::new(Socks5Connector::new(spec.auth.clone())))
}

fn socks4_connector(spec: &NodeSpec) -> anyhow::Result<Arc<dyn Connector>> {
    let user_id = spec.auth.as_ref().map(|a| a.username.clone());
    Ok(Arc::new(Socks4Connector::new(user_id, false)))
}

fn socks4a_connector(spec: &NodeSpec) -> anyhow::Result<Arc<dyn Connector>> {
    let user_id = spec.auth.as_ref().map(|a| a.username.clone());
    Ok(Arc::new(Socks4Connector::new(user_id, true)))
}

fn forward_connector(_: &NodeSpec) -> anyhow::Result<Arc<dyn Connector>> {
    Ok(Arc::new(ForwardConnector::new()))
}

fn tcp_transporter(_: &NodeSpec) -> anyhow::Result<Arc<dyn Transporter>> {
    Ok(Arc::new(TcpTransporter::new()))
}

fn tls_transporter(spec: &NodeSpec) -> anyhow::Result<Arc<dyn Transporter>> {
    Ok(Arc::new(build_tls(spec)?))
}

fn mtcp_transporter(_: &NodeSpec) -> anyhow::Result<Arc<dyn Transporter>> {
    let inner: Arc<dyn Transporter> = Arc::new(TcpTransporter::new());
    Ok(Arc::new(MuxTransporter::new(inner, "mtcp")))
}

fn mtls_transporter(spec: &NodeSpec) -> anyhow::Result<Arc<dyn Transporter>> {
    let inner: Arc<dyn Transporter> = Arc::new(build_tls(spec)?);
    Ok(Arc::new(MuxTransporter::new(inner, "mtls")))
}

/// `sni`、`secure`/`skip_verify`、`ca` 参数决定 TLS 客户端配置
fn build_tls(spec: &NodeSpec) -> anyhow::Result<TlsTransporter> {
    let options = TlsOptions::from_spec(spec);
    let config = tls::client_config(&options)?;
    Ok(TlsTransporter::new(
        TlsConnector::from(config),
        options.server_name()?,
    ))
}
