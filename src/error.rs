//! 自定义错误类型
//!
//! 核心模块（节点组、链、路由）返回精确的 `TunnelError`，
//! 协议模块内部使用 anyhow，在链拨号时被包装为 `ChainBuild` 的 source
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 装箱的底层错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 单跳失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopFailure {
    /// 节点组内没有可用节点
    NoLiveNode,
    /// 传输层拨号失败
    TransportDialFailed,
    /// 协议握手失败
    HandshakeFailed,
    /// 传输拨号或握手超时
    Timeout,
}

impl fmt::Display for HopFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopFailure::NoLiveNode => write!(f, "no live node"),
            HopFailure::TransportDialFailed => write!(f, "transport dial failed"),
            HopFailure::HandshakeFailed => write!(f, "handshake failed"),
            HopFailure::Timeout => write!(f, "timeout"),
        }
    }
}

/// Chain Tunnel 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 注册表中不存在的协议
    #[error("Unknown {kind} protocol '{name}'")]
    UnknownProtocol { kind: &'static str, name: String },

    /// 重复注册的协议
    #[error("{kind} protocol '{name}' is already registered")]
    DuplicateProtocol { kind: &'static str, name: String },

    /// 直连失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: BoxError,
    },

    /// 链中某一跳失败（hop_index 从 1 开始）
    #[error("Chain hop {hop_index} ({}) failed: {reason}", .node.as_deref().unwrap_or("-"))]
    ChainBuild {
        hop_index: usize,
        reason: HopFailure,
        node: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// 路由的所有候选链都失败
    #[error("All {attempts} route attempts failed, last error: {last}")]
    RouteExhausted {
        attempts: usize,
        last: Box<TunnelError>,
    },

    /// 连接关闭或进程关闭导致操作取消
    #[error("Operation cancelled")]
    Cancelled,

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// 协议错误
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source: source.into(),
        }
    }

    /// 创建单跳失败错误
    pub fn hop_failed(
        hop_index: usize,
        reason: HopFailure,
        node: Option<&str>,
        source: Option<BoxError>,
    ) -> Self {
        Self::ChainBuild {
            hop_index,
            reason,
            node: node.map(str::to_string),
            source,
        }
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::UnknownProtocol { .. } | Self::DuplicateProtocol { .. }
        )
    }

    /// 检查是否为取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ChainBuild {
                    reason: HopFailure::Timeout,
                    ..
                }
        )
    }

    /// 失败的跳序号（仅 ChainBuild）
    pub fn hop_index(&self) -> Option<usize> {
        match self {
            Self::ChainBuild { hop_index, .. } => Some(*hop_index),
            _ => None,
        }
    }

    /// 失败原因（仅 ChainBuild）
    pub fn hop_failure(&self) -> Option<HopFailure> {
        match self {
            Self::ChainBuild { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_build_display() {
        let err = TunnelError::hop_failed(2, HopFailure::HandshakeFailed, Some("node-b"), None);
        assert_eq!(err.to_string(), "Chain hop 2 (node-b) failed: handshake failed");
        assert_eq!(err.hop_index(), Some(2));
        assert_eq!(err.hop_failure(), Some(HopFailure::HandshakeFailed));
    }

    #[test]
    fn test_chain_build_source() {
        use std::error::Error;

        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::hop_failed(
            1,
            HopFailure::TransportDialFailed,
            None,
            Some(Box::new(io_err)),
        );
        assert!(err.source().is_some());
        assert!(err.to_string().contains("(-)"));
    }

    #[test]
    fn test_route_exhausted() {
        let last = TunnelError::hop_failed(1, HopFailure::NoLiveNode, None, None);
        let err = TunnelError::RouteExhausted {
            attempts: 3,
            last: Box::new(last),
        };
        assert!(err.to_string().contains("All 3 route attempts failed"));
        assert!(err.to_string().contains("no live node"));
    }

    #[test]
    fn test_error_is_checks() {
        let config_err = TunnelError::config_error("empty group");
        let unknown = TunnelError::UnknownProtocol {
            kind: "connector",
            name: "quic".to_string(),
        };
        let timeout_err = TunnelError::timeout(Duration::from_secs(1));
        let hop_timeout = TunnelError::hop_failed(1, HopFailure::Timeout, None, None);

        assert!(config_err.is_config_error());
        assert!(unknown.is_config_error());
        assert!(!config_err.is_timeout());
        assert!(timeout_err.is_timeout());
        assert!(hop_timeout.is_timeout());
        assert!(TunnelError::Cancelled.is_cancelled());
        assert!(!timeout_err.is_cancelled());
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::connection_failed("127.0.0.1:8080", io_err);
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }
}
