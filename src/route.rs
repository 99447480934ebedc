//! 路由：旁路判断 + 在候选链之间重试

use crate::bypass::Bypass;
use crate::chain::{Chain, ChainDialer, Request};
use crate::error::{Result, TunnelError};
use crate::selector::{Selector, Strategy};
use crate::transport::BoxedTransport;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 一条候选链及其最多尝试次数
#[derive(Debug, Clone)]
pub struct ChainAttempt {
    pub chain: Arc<Chain>,
    pub max_attempts: usize,
}

/// 路由解析结果
#[derive(Debug, Clone)]
pub enum Resolution {
    /// 直连
    Direct,
    /// 按顺序尝试的候选链
    Chained(Vec<ChainAttempt>),
}

#[derive(Debug)]
pub struct Route {
    name: String,
    chains: Vec<Arc<Chain>>,
    selector: Selector,
    bypass: Bypass,
    /// 每条链的尝试次数，0 表示使用链自身的设置
    retries: usize,
}

impl Route {
    pub fn new(name: impl Into<String>, chains: Vec<Arc<Chain>>) -> Self {
        Self {
            name: name.into(),
            chains,
            selector: Selector::new(Strategy::RoundRobin),
            bypass: Bypass::default(),
            retries: 0,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.selector = Selector::new(strategy);
        self
    }

    pub fn with_bypass(mut self, bypass: Bypass) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chains(&self) -> &[Arc<Chain>] {
        &self.chains
    }

    pub fn bypass(&self) -> &Bypass {
        &self.bypass
    }

    /// 解析目的地址
    pub fn resolve(&self, destination: &str) -> Resolution {
        if self.bypass.matches(destination) {
            debug!("Route '{}': {} bypassed", self.name, destination);
            return Resolution::Direct;
        }
        if self.is_direct() {
            return Resolution::Direct;
        }
        Resolution::Chained(self.attempts())
    }

    fn is_direct(&self) -> bool {
        self.chains.iter().all(|c| c.is_empty())
    }

    /// 按选择策略排好序的候选链
    fn attempts(&self) -> Vec<ChainAttempt> {
        self.selector
            .order(self.chains.len())
            .into_iter()
            .map(|i| {
                let chain = self.chains[i].clone();
                let max_attempts = if self.retries > 0 {
                    self.retries
                } else {
                    chain.retries().max(1)
                };
                ChainAttempt {
                    chain,
                    max_attempts,
                }
            })
            .collect()
    }

    /// 解析并拨号，依次尝试候选链直到成功或全部失败
    pub async fn dial(
        &self,
        dialer: &ChainDialer,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<BoxedTransport> {
        let attempts = match self.resolve(destination) {
            Resolution::Direct => {
                return tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TunnelError::Cancelled),
                    result = dialer.dial_direct(destination) => result,
                };
            }
            Resolution::Chained(attempts) => attempts,
        };
        self.attempt(dialer, &attempts, Request::Stream(destination), cancel).await
    }

    /// 建立 UDP 隧道
    ///
    /// 数据报的目的地址各不相同，不做旁路判断；没有代理链时返回 `None`，由调用方直接收发
    pub async fn dial_datagram(
        &self,
        dialer: &ChainDialer,
        cancel: &CancellationToken,
    ) -> Result<Option<BoxedTransport>> {
        if self.is_direct() {
            return Ok(None);
        }
        let attempts = self.attempts();
        self.attempt(dialer, &attempts, Request::Datagram, cancel)
            .await
            .map(Some)
    }

    /// 依次尝试候选链直到成功或全部失败
    async fn attempt(
        &self,
        dialer: &ChainDialer,
        attempts: &[ChainAttempt],
        request: Request<'_>,
        cancel: &CancellationToken,
    ) -> Result<BoxedTransport> {
        let mut tried = 0;
        let mut last = None;

        for attempt in attempts {
            for _ in 0..attempt.max_attempts {
                tried += 1;
                match dialer
                    .dial_request_with_cancel(&attempt.chain, request, cancel)
                    .await
                {
                    Ok(conn) => {
                        debug!(
                            "Route '{}': {} connected via chain '{}' (attempt {})",
                            self.name,
                            request,
                            attempt.chain.name(),
                            tried
                        );
                        return Ok(conn);
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(
                            "Route '{}': chain '{}' attempt {} to {} failed: {}",
                            self.name,
                            attempt.chain.name(),
                            tried,
                            request,
                            e
                        );
                        last = Some(e);
                    }
                }
            }
        }

        Err(TunnelError::RouteExhausted {
            attempts: tried,
            last: Box::new(last.unwrap_or_else(|| {
                TunnelError::Protocol(format!("Route '{}' has no candidate chains", self.name))
            })),
        })
    }
}
