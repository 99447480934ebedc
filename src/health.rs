//! 后台健康探测
//!
//! 定期对处于冷却期的节点发起 TCP 连接，连接成功即视为恢复。
//! 只探测本机可以直接到达的节点组（各条链的第一跳）；探测失败不影响冷却计时。

use crate::group::NodeGroup;
use crate::transport::connect_tcp;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 健康探测配置
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
        }
    }
}

pub struct HealthChecker {
    groups: Vec<Arc<NodeGroup>>,
    config: HealthCheckConfig,
    cancel: CancellationToken,
}

impl HealthChecker {
    pub fn new(
        groups: Vec<Arc<NodeGroup>>,
        config: HealthCheckConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            groups,
            config,
            cancel,
        }
    }

    /// 启动探测任务，取消令牌触发后退出
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 第一次 tick 立即完成，跳过
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Health checker stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.check_once().await;
                }
            }
        }
    }

    /// 探测所有失效节点一次，返回恢复的节点数
    pub async fn check_once(&self) -> usize {
        let timeout = self.config.timeout;
        let checks = self.groups.iter().flat_map(|group| {
            group.dead_nodes().into_iter().map(move |node| {
                let group = group.clone();
                async move {
                    let alive = matches!(
                        tokio::time::timeout(timeout, connect_tcp(&node.addr)).await,
                        Ok(Ok(_))
                    );
                    if alive {
                        info!("Health check of {} succeeded", node.addr);
                    }
                    group.health_check_result(&node, alive);
                    alive
                }
            })
        });

        futures::future::join_all(checks)
            .await
            .into_iter()
            .filter(|alive| *alive)
            .count()
    }
}
