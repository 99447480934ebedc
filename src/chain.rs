//! 代理链与链式拨号
//!
//! 第 i 个节点组经由第 i-1 组建立的连接拨号；每跳的握手目标是下一跳的地址，
//! 最后一跳的握手目标是最终目的地址，或者在最后一跳上建立 UDP 隧道。

use crate::error::{HopFailure, Result, TunnelError};
use crate::group::{NodeGroup, Outcome};
use crate::node::Node;
use crate::transport::{BoxedTransport, TcpTransporter, Transporter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 默认单跳超时
pub const DEFAULT_HOP_TIMEOUT: Duration = Duration::from_secs(10);

/// 有序的节点组序列，空链表示直连
#[derive(Debug)]
pub struct Chain {
    name: String,
    groups: Vec<Arc<NodeGroup>>,
    retries: usize,
}

/// 最后一跳的握手请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    /// 连接到目的地址的字节流
    Stream(&'a str),
    /// UDP 隧道，目的地址由每个数据报携带
    Datagram,
}

impl std::fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Stream(target) => f.write_str(target),
            Request::Datagram => f.write_str("udp tunnel"),
        }
    }
}

/// 一次拨号中某一跳选中的节点
#[derive(Debug, Clone)]
pub struct Hop {
    pub group: Arc<NodeGroup>,
    pub node: Arc<Node>,
}

impl Chain {
    pub fn new(name: impl Into<String>, groups: Vec<Arc<NodeGroup>>) -> Self {
        Self {
            name: name.into(),
            groups,
            retries: 1,
        }
    }

    /// 直连链
    pub fn direct() -> Self {
        Self::new("direct", Vec::new())
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[Arc<NodeGroup>] {
        &self.groups
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// 为一次拨号依次选出每一跳的节点
    ///
    /// 若第 i 跳选中的节点自带的旁路规则命中 `target`，链在该跳之前截断
    pub fn select_route(&self, target: &str) -> Result<Vec<Hop>> {
        self.select(Some(target))
    }

    /// 为 UDP 隧道选出每一跳的节点，数据报的目的地址各不相同，不做旁路截断
    pub fn select_all(&self) -> Result<Vec<Hop>> {
        self.select(None)
    }

    fn select(&self, target: Option<&str>) -> Result<Vec<Hop>> {
        let mut hops = Vec::with_capacity(self.groups.len());

        for (i, group) in self.groups.iter().enumerate() {
            let node = group
                .select()
                .map_err(|_| TunnelError::hop_failed(i + 1, HopFailure::NoLiveNode, None, None))?;

            if let Some(target) = target.filter(|t| node.bypasses(t)) {
                debug!(
                    "Chain '{}': node {} bypasses {}, truncating at hop {}",
                    self.name,
                    node.addr,
                    target,
                    i + 1
                );
                break;
            }
            hops.push(Hop {
                group: group.clone(),
                node,
            });
        }

        Ok(hops)
    }
}

/// 链式拨号器
#[derive(Clone)]
pub struct ChainDialer {
    direct: Arc<dyn Transporter>,
    hop_timeout: Duration,
}

impl Default for ChainDialer {
    fn default() -> Self {
        Self::new(DEFAULT_HOP_TIMEOUT)
    }
}

impl ChainDialer {
    pub fn new(hop_timeout: Duration) -> Self {
        Self::with_transporter(Arc::new(TcpTransporter::new()), hop_timeout)
    }

    /// 指定直连使用的传输
    pub fn with_transporter(direct: Arc<dyn Transporter>, hop_timeout: Duration) -> Self {
        Self {
            direct,
            hop_timeout,
        }
    }

    pub fn hop_timeout(&self) -> Duration {
        self.hop_timeout
    }

    /// 不经过任何代理直接拨号
    pub async fn dial_direct(&self, target: &str) -> Result<BoxedTransport> {
        debug!("Dialing {} directly", target);
        match timeout(self.hop_timeout, self.direct.dial(target, None)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(TunnelError::connection_failed(target, e)),
            Err(_) => Err(TunnelError::timeout(self.hop_timeout)),
        }
    }

    /// 经由 `chain` 拨号到 `target`，不做重试
    pub async fn dial(&self, chain: &Chain, target: &str) -> Result<BoxedTransport> {
        let hops = chain.select_route(target)?;
        self.dial_hops(&hops, target).await
    }

    /// 经由 `chain` 建立 UDP 隧道，不做重试
    ///
    /// 链不能为空，且最后一跳的协议必须支持数据报转发
    pub async fn dial_datagram(&self, chain: &Chain) -> Result<BoxedTransport> {
        let hops = chain.select_all()?;
        let last = hops.last().ok_or_else(|| {
            TunnelError::Protocol(format!("Chain '{}' has no hops for datagrams", chain.name()))
        })?;
        if !last.node.connector.supports_datagram() {
            return Err(TunnelError::Protocol(format!(
                "Node {} ({}) cannot relay datagrams",
                last.node.addr,
                last.node.connector.name()
            )));
        }
        self.build(&hops, Request::Datagram).await
    }

    /// 按请求类型拨号
    pub async fn dial_request(
        &self,
        chain: &Chain,
        request: Request<'_>,
    ) -> Result<BoxedTransport> {
        match request {
            Request::Stream(target) => self.dial(chain, target).await,
            Request::Datagram => self.dial_datagram(chain).await,
        }
    }

    /// 可取消的 [`ChainDialer::dial`]
    ///
    /// 取消时丢弃进行中的拨号，已建立的部分连接随之关闭，不上报健康状态
    pub async fn dial_with_cancel(
        &self,
        chain: &Chain,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<BoxedTransport> {
        self.dial_request_with_cancel(chain, Request::Stream(target), cancel).await
    }

    /// 可取消的 [`ChainDialer::dial_request`]
    pub async fn dial_request_with_cancel(
        &self,
        chain: &Chain,
        request: Request<'_>,
        cancel: &CancellationToken,
    ) -> Result<BoxedTransport> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            result = self.dial_request(chain, request) => result,
        }
    }

    /// 按已选好的节点逐跳建立连接
    pub async fn dial_hops(&self, hops: &[Hop], target: &str) -> Result<BoxedTransport> {
        if hops.is_empty() {
            return self.dial_direct(target).await;
        }
        self.build(hops, Request::Stream(target)).await
    }

    async fn build(&self, hops: &[Hop], request: Request<'_>) -> Result<BoxedTransport> {
        let mut current: Option<BoxedTransport> = None;

        for (i, hop) in hops.iter().enumerate() {
            let hop_index = i + 1;
            let node = &hop.node;
            let next = hops
                .get(i + 1)
                .map(|h| Request::Stream(h.node.addr.as_str()))
                .unwrap_or(request);

            debug!(
                "Hop {}: dialing {} over {}",
                hop_index,
                node.addr,
                node.transporter.name()
            );
            let conn = match timeout(
                self.hop_timeout,
                node.transporter.dial(&node.addr, current.take()),
            )
            .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    return Err(self.fail(hop, hop_index, HopFailure::TransportDialFailed, e.into()))
                }
                Err(_) => {
                    let e = TunnelError::timeout(self.hop_timeout);
                    return Err(self.fail(hop, hop_index, HopFailure::Timeout, Box::new(e)));
                }
            };

            debug!(
                "Hop {}: {} handshake with {} targeting {}",
                hop_index,
                node.connector.name(),
                node.addr,
                next
            );
            let handshake = match next {
                Request::Stream(next) => node.connector.connect(conn, next),
                Request::Datagram => node.connector.connect_datagram(conn),
            };
            let conn = match timeout(self.hop_timeout, handshake).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    return Err(self.fail(hop, hop_index, HopFailure::HandshakeFailed, e.into()))
                }
                Err(_) => {
                    let e = TunnelError::timeout(self.hop_timeout);
                    return Err(self.fail(hop, hop_index, HopFailure::Timeout, Box::new(e)));
                }
            };

            hop.group.report(node, Outcome::Success);
            current = Some(conn);
        }

        current.ok_or_else(|| TunnelError::Protocol("Chain produced no connection".to_string()))
    }

    fn fail(
        &self,
        hop: &Hop,
        hop_index: usize,
        reason: HopFailure,
        source: crate::error::BoxError,
    ) -> TunnelError {
        warn!(
            "Hop {} ({}) failed: {}: {}",
            hop_index, hop.node.addr, reason, source
        );
        hop.group.report(&hop.node, Outcome::Failure);
        TunnelError::hop_failed(hop_index, reason, Some(&hop.node.name), Some(source))
    }
}

impl std::fmt::Debug for ChainDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainDialer")
            .field("direct", &self.direct.name())
            .field("hop_timeout", &self.hop_timeout)
            .finish()
    }
}
