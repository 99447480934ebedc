/// Chain Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod bypass;
pub mod chain;
pub mod config;
pub mod connector;
pub mod datagram;
pub mod error;
pub mod group;
pub mod health;
pub mod node;
pub mod rate_limiter;
pub mod registry;
pub mod relay;
pub mod reload;
pub mod route;
pub mod selector;
pub mod service;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use bypass::Bypass;
pub use chain::{Chain, ChainDialer, Request};
pub use config::AppConfig;
pub use datagram::Datagram;
pub use error::{Result, TunnelError};
pub use group::{NodeGroup, Outcome};
pub use node::{Node, NodeSpec};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use registry::{ProtocolRegistry, RegisterPolicy};
pub use reload::{ConfigHandle, Reloader, Snapshot};
pub use route::Route;
pub use selector::{FailPolicy, Strategy};
pub use service::{Service, ServiceKind};
