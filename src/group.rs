//! 节点组：一组可互换的节点 + 选择策略 + 每节点健康状态
//!
//! 健康状态按节点加锁，不同节点的上报互不阻塞

use crate::error::{Result, TunnelError};
use crate::node::Node;
use crate::selector::{FailPolicy, Selector, Strategy};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// 组内没有可选节点（且未开启 fail-open）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all nodes in group are marked dead")]
pub struct AllDead;

/// 一次拨号的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// 单个节点的健康状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthState {
    pub consecutive_failures: u32,
    pub marked_dead_at: Option<Instant>,
    /// 累计失败次数（只增不减）
    pub total_failures: u64,
}

struct Member {
    node: Arc<Node>,
    health: Mutex<HealthState>,
}

pub struct NodeGroup {
    name: String,
    members: Vec<Member>,
    selector: Selector,
    policy: FailPolicy,
}

impl NodeGroup {
    /// 创建节点组，空节点列表是配置错误
    ///
    /// 优先级策略下节点按 `priority` 升序（稳定）排序
    pub fn new(
        name: impl Into<String>,
        mut nodes: Vec<Node>,
        strategy: Strategy,
        policy: FailPolicy,
    ) -> Result<Self> {
        let name = name.into();
        if nodes.is_empty() {
            return Err(TunnelError::config_error(format!(
                "Node group '{}' has no nodes",
                name
            )));
        }
        if strategy == Strategy::Priority {
            nodes.sort_by_key(|n| n.priority);
        }

        let members = nodes
            .into_iter()
            .enumerate()
            .map(|(id, mut node)| {
                node.id = id;
                Member {
                    node: Arc::new(node),
                    health: Mutex::new(HealthState::default()),
                }
            })
            .collect();

        Ok(Self {
            name,
            members,
            selector: Selector::new(strategy),
            policy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn strategy(&self) -> Strategy {
        self.selector.strategy()
    }

    pub fn policy(&self) -> FailPolicy {
        self.policy
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.members.iter().map(|m| m.node.clone()).collect()
    }

    fn is_dead_at(&self, member: &Member, now: Instant) -> bool {
        let health = member.health.lock();
        match health.marked_dead_at {
            Some(at) => now.duration_since(at) < self.policy.fail_timeout,
            None => false,
        }
    }

    /// 选择下一次拨号使用的节点
    pub fn select(&self) -> std::result::Result<Arc<Node>, AllDead> {
        let now = Instant::now();
        let n = self.members.len();

        if let Some(i) = self
            .selector
            .select(n, |i| !self.is_dead_at(&self.members[i], now))
        {
            return Ok(self.members[i].node.clone());
        }

        if !self.policy.fail_open {
            return Err(AllDead);
        }
        debug!(
            "All {} nodes of group '{}' are dead, failing open",
            n, self.name
        );
        self.selector
            .fallback(n)
            .map(|i| self.members[i].node.clone())
            .ok_or(AllDead)
    }

    fn member(&self, node: &Node) -> Option<&Member> {
        self.members
            .get(node.id)
            .filter(|m| std::ptr::eq(Arc::as_ptr(&m.node), node))
    }

    /// 上报一次拨号结果
    pub fn report(&self, node: &Node, outcome: Outcome) {
        let Some(member) = self.member(node) else {
            debug!(
                "Ignoring report for node {} not owned by group '{}'",
                node.addr, self.name
            );
            return;
        };

        let mut health = member.health.lock();
        match outcome {
            Outcome::Success => {
                if health.marked_dead_at.take().is_some() {
                    info!("Node {} in group '{}' recovered", node.addr, self.name);
                }
                health.consecutive_failures = 0;
            }
            Outcome::Failure => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.total_failures += 1;
                if self.policy.max_fails > 0 && health.consecutive_failures >= self.policy.max_fails
                {
                    if health.marked_dead_at.is_none() {
                        warn!(
                            "Node {} in group '{}' marked dead after {} consecutive failures",
                            node.addr, self.name, health.consecutive_failures
                        );
                    }
                    // 每次失败都刷新冷却起点
                    health.marked_dead_at = Some(Instant::now());
                }
            }
        }
    }

    /// 上报一次后台健康检查结果
    ///
    /// 检查成功等同于拨号成功；检查失败不计入失败次数，也不刷新冷却起点，
    /// 节点照常在 `fail_timeout` 之后重新参与选择
    pub fn health_check_result(&self, node: &Node, alive: bool) {
        if alive {
            self.report(node, Outcome::Success);
        } else {
            debug!(
                "Health check of node {} in group '{}' failed, keeping cooldown",
                node.addr, self.name
            );
        }
    }

    /// 节点当前是否处于失效冷却期
    pub fn is_dead(&self, node: &Node) -> bool {
        self.member(node)
            .map(|m| self.is_dead_at(m, Instant::now()))
            .unwrap_or(false)
    }

    /// 当前处于冷却期的节点
    pub fn dead_nodes(&self) -> Vec<Arc<Node>> {
        let now = Instant::now();
        self.members
            .iter()
            .filter(|m| self.is_dead_at(m, now))
            .map(|m| m.node.clone())
            .collect()
    }

    /// 所有节点的健康状态快照
    pub fn health(&self) -> Vec<(Arc<Node>, HealthState)> {
        self.members
            .iter()
            .map(|m| (m.node.clone(), m.health.lock().clone()))
            .collect()
    }
}

impl std::fmt::Debug for NodeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGroup")
            .field("name", &self.name)
            .field("nodes", &self.members.len())
            .field("strategy", &self.selector.strategy())
            .field("policy", &self.policy)
            .finish()
    }
}
