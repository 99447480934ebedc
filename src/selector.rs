//! 选择策略与失败过滤参数
//!
//! 节点组和路由（多条候选链）共用同一套选择逻辑

use crate::error::TunnelError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// 选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Strategy {
    /// 轮询，跳过失效节点
    #[default]
    #[serde(rename = "round", alias = "round_robin", alias = "roundrobin")]
    RoundRobin,
    /// 在存活节点中均匀随机
    #[serde(rename = "random", alias = "rand")]
    Random,
    /// 按优先级顺序选择第一个存活节点（故障转移）
    #[serde(rename = "fifo", alias = "priority", alias = "failover")]
    Priority,
}

impl FromStr for Strategy {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round" | "round_robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "random" | "rand" => Ok(Strategy::Random),
            "fifo" | "priority" | "failover" => Ok(Strategy::Priority),
            other => Err(TunnelError::config_error(format!(
                "Unknown selection strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round"),
            Strategy::Random => write!(f, "random"),
            Strategy::Priority => write!(f, "fifo"),
        }
    }
}

/// 失败过滤参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailPolicy {
    /// 连续失败多少次后标记为失效，0 表示从不标记
    pub max_fails: u32,
    /// 失效冷却时间，过后节点重新参与选择
    pub fail_timeout: Duration,
    /// 全部节点失效时是否退回到在所有节点中选择
    pub fail_open: bool,
}

impl Default for FailPolicy {
    fn default() -> Self {
        Self {
            max_fails: 1,
            fail_timeout: Duration::from_secs(30),
            fail_open: true,
        }
    }
}

/// 带游标的选择器
#[derive(Debug, Default)]
pub struct Selector {
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// 在 `0..n` 中选择一个 `is_live` 为真的下标，没有时返回 None
    pub fn select<F>(&self, n: usize, is_live: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        if n == 0 {
            return None;
        }
        match self.strategy {
            Strategy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                (0..n).map(|i| (start + i) % n).find(|&i| is_live(i))
            }
            Strategy::Random => {
                let live: Vec<usize> = (0..n).filter(|&i| is_live(i)).collect();
                if live.is_empty() {
                    None
                } else {
                    Some(live[rand::rng().random_range(0..live.len())])
                }
            }
            Strategy::Priority => (0..n).find(|&i| is_live(i)),
        }
    }

    /// 全部失效时的退路：随机策略仍然随机，其余策略在所有下标上轮询
    pub fn fallback(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        match self.strategy {
            Strategy::Random => Some(rand::rng().random_range(0..n)),
            Strategy::RoundRobin | Strategy::Priority => {
                Some(self.cursor.fetch_add(1, Ordering::Relaxed) % n)
            }
        }
    }

    /// 按策略给出一次完整的尝试顺序（路由在多条链之间重试时使用）
    pub fn order(&self, n: usize) -> Vec<usize> {
        match self.strategy {
            Strategy::RoundRobin => {
                if n == 0 {
                    return Vec::new();
                }
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                (0..n).map(|i| (start + i) % n).collect()
            }
            Strategy::Random => {
                let mut order: Vec<usize> = (0..n).collect();
                let mut rng = rand::rng();
                for i in (1..n).rev() {
                    order.swap(i, rng.random_range(0..=i));
                }
                order
            }
            Strategy::Priority => (0..n).collect(),
        }
    }
}
