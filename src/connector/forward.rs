use super::Connector;
use crate::transport::BoxedTransport;
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

/// 端口转发节点：节点本身固定转发到某个目标，不需要握手
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardConnector;

impl ForwardConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for ForwardConnector {
    async fn connect(&self, conn: BoxedTransport, target: &str) -> Result<BoxedTransport> {
        debug!("Forward node ignores requested target {}", target);
        Ok(conn)
    }

    fn name(&self) -> &'static str {
        "forward"
    }
}
